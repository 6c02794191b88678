//! Link detection
//!
//! Automated messages never answer anything that carries a link: explicit
//! schemes, `www.`, known short-link hosts, or a bare `word.tld/...`.

use once_cell::sync::Lazy;
use regex::Regex;

static LINK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b((?:https?://|www\.|telegram\.me/|t\.me/|bit\.ly/|goo\.gl/|tinyurl\.com|\w+\.\w{2,}/\S*))",
    )
    .expect("link pattern is valid")
});

/// True when the text contains a recognizable URL
pub fn contains_link(text: &str) -> bool {
    LINK_PATTERN.is_match(text)
}
