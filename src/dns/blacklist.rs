use glob::{MatchOptions, Pattern};
use std::collections::HashSet;
use tracing::warn;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// DomainBlacklist holds exact names and shell-style wildcard patterns
#[derive(Debug, Default, Clone)]
pub struct DomainBlacklist {
    exact: HashSet<String>,
    patterns: Vec<Pattern>,
}

impl DomainBlacklist {
    /// new compiles the patterns once; unparseable patterns are skipped
    pub fn new(domains: &[String], patterns: &[String]) -> Self {
        let exact = domains.iter().map(|d| normalize(d)).collect();
        let patterns = patterns
            .iter()
            .filter_map(|p| match Pattern::new(&p.to_ascii_lowercase()) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, "ignoring bad dns blacklist pattern: {e}");
                    None
                }
            })
            .collect();

        Self { exact, patterns }
    }

    pub fn is_blocked(&self, hostname: &str) -> bool {
        let host = normalize(hostname);
        self.exact.contains(&host)
            || self
                .patterns
                .iter()
                .any(|p| p.matches_with(&host, MATCH_OPTIONS))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}

/// normalize lowercases and drops the root label dot
pub(crate) fn normalize(hostname: &str) -> String {
    hostname.trim().trim_end_matches('.').to_ascii_lowercase()
}
