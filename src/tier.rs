//! Membership tiers and the quotas they grant

/// Owner classification. Privileged owners get larger quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tier {
    #[default]
    Standard,
    Privileged,
}

impl Tier {
    pub fn from_privileged(privileged: bool) -> Self {
        if privileged {
            Tier::Privileged
        } else {
            Tier::Standard
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, Tier::Privileged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "standard",
            Tier::Privileged => "privileged",
        }
    }

    /// Automated replies allowed per (account, chat) inside one activity window
    pub fn reply_quota(&self) -> usize {
        match self {
            Tier::Privileged => 4,
            Tier::Standard => 1,
        }
    }

    /// Linked accounts an owner may create
    pub fn account_quota(&self) -> usize {
        match self {
            Tier::Privileged => 2,
            Tier::Standard => 1,
        }
    }

    /// Chat assignments a linked account may hold
    pub fn assignment_quota(&self) -> usize {
        match self {
            Tier::Privileged => 8,
            Tier::Standard => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quotas_by_tier() {
        assert_eq!(Tier::Standard.reply_quota(), 1);
        assert_eq!(Tier::Privileged.reply_quota(), 4);
        assert_eq!(Tier::Standard.account_quota(), 1);
        assert_eq!(Tier::Privileged.account_quota(), 2);
        assert_eq!(Tier::Standard.assignment_quota(), 1);
        assert_eq!(Tier::Privileged.assignment_quota(), 8);
    }

    #[test]
    fn test_default_is_stricter_tier() {
        assert_eq!(Tier::default(), Tier::Standard);
        assert!(Tier::from_privileged(true).is_privileged());
    }
}
