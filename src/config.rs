//! Configuration management

use anyhow::{Context, Result};
use rand::Rng;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::OwnerId;
use crate::tier::Tier;

/// Half-open random delay range `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const fn secs(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_secs(min),
            max: Duration::from_secs(max),
        }
    }

    /// Draw a uniformly distributed delay
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let secs = rand::thread_rng().gen_range(self.min.as_secs_f64()..self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub fn contains(&self, d: Duration) -> bool {
        d >= self.min && (d < self.max || self.min == self.max)
    }
}

/// Timing constants shared by the pool and both engines
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Sliding window for send counting and message age (7h)
    pub activity_window: Duration,
    /// How long dedup entries are kept once recorded
    pub dedup_retention: Duration,
    /// Human-latency delay before an automated reply
    pub reply_delay: DelayRange,
    /// Autopost cycle interval for privileged owners
    pub autopost_interval_privileged: DelayRange,
    /// Autopost cycle interval for standard owners
    pub autopost_interval_standard: DelayRange,
    /// Messages inspected per chat per autopost cycle
    pub autopost_scan_limit: usize,
    /// Back-off after an autopost cycle fails outright
    pub autopost_backoff: Duration,
    /// Upper bound on a single generator call
    pub generator_timeout: Duration,
    /// Directory poll / reconciliation interval
    pub poll_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            activity_window: Duration::from_secs(25200),
            dedup_retention: Duration::from_secs(25200),
            reply_delay: DelayRange::secs(32, 2600),
            autopost_interval_privileged: DelayRange::secs(21600, 61200), // 6 to 17 hours
            autopost_interval_standard: DelayRange::secs(43200, 86400),   // 12 to 24 hours
            autopost_scan_limit: 100,
            autopost_backoff: Duration::from_secs(3600),
            generator_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl EngineSettings {
    pub fn autopost_interval(&self, tier: Tier) -> DelayRange {
        match tier {
            Tier::Privileged => self.autopost_interval_privileged,
            Tier::Standard => self.autopost_interval_standard,
        }
    }
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding user_data.json and chat_groups.json
    pub data_dir: PathBuf,

    /// Session gateway base URL
    pub gateway_url: Option<String>,

    /// Bearer token for the session gateway (optional)
    pub gateway_token: Option<String>,

    /// Response generator endpoint (optional - canned replies without it)
    pub generator_url: Option<String>,

    /// Bot API token used for membership checks (optional)
    pub bot_token: Option<String>,

    /// Group whose members are privileged (optional)
    pub membership_group_id: Option<i64>,

    /// Owners that are always privileged
    pub privileged_owners: HashSet<OwnerId>,

    /// Engine timings
    pub settings: EngineSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("NPCBOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("npcbot")
            });

        let gateway_url = non_empty_var("NPCBOT_GATEWAY_URL");
        let gateway_token = non_empty_var("NPCBOT_GATEWAY_TOKEN");
        let generator_url = non_empty_var("NPCBOT_GENERATOR_URL");
        let bot_token = non_empty_var("TELEGRAM_BOT_TOKEN");

        let membership_group_id = match non_empty_var("NPCBOT_MEMBERSHIP_GROUP_ID") {
            Some(v) => Some(
                v.trim()
                    .parse::<i64>()
                    .with_context(|| format!("NPCBOT_MEMBERSHIP_GROUP_ID is not an id: {}", v))?,
            ),
            None => None,
        };

        let privileged_owners = std::env::var("NPCBOT_PRIVILEGED_OWNERS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        let mut settings = EngineSettings::default();
        if let Some(secs) = secs_var("NPCBOT_GENERATOR_TIMEOUT_SECS") {
            settings.generator_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = secs_var("NPCBOT_POLL_INTERVAL_SECS") {
            settings.poll_interval = Duration::from_secs(secs.max(1));
        }

        Ok(Self {
            data_dir,
            gateway_url,
            gateway_token,
            generator_url,
            bot_token,
            membership_group_id,
            privileged_owners,
            settings,
        })
    }

    pub fn user_data_path(&self) -> PathBuf {
        self.data_dir.join("user_data.json")
    }

    pub fn chat_groups_path(&self) -> PathBuf {
        self.data_dir.join("chat_groups.json")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn secs_var(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let s = EngineSettings::default();
        assert_eq!(s.activity_window, Duration::from_secs(7 * 3600));
        assert_eq!(s.reply_delay, DelayRange::secs(32, 2600));
        assert_eq!(s.autopost_interval(Tier::Privileged), DelayRange::secs(21600, 61200));
        assert_eq!(s.autopost_interval(Tier::Standard), DelayRange::secs(43200, 86400));
        assert_eq!(s.autopost_scan_limit, 100);
        assert_eq!(s.autopost_backoff, Duration::from_secs(3600));
        assert_eq!(s.poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_delay_sample_in_range() {
        let range = DelayRange::secs(32, 2600);
        for _ in 0..500 {
            let d = range.sample();
            assert!(range.contains(d), "{:?} outside range", d);
        }
    }

    #[test]
    fn test_degenerate_range_returns_min() {
        let range = DelayRange::secs(5, 5);
        assert_eq!(range.sample(), Duration::from_secs(5));
        let zero = DelayRange::secs(0, 0);
        assert_eq!(zero.sample(), Duration::ZERO);
    }
}
