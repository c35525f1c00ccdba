//! Driver configuration (design spec §6).
//!
//! `main` assembles this from CLI flags and environment variables; the core
//! crates only ever see the resulting struct, never raw env/flag state.

use std::time::Duration;

/// Cloud API credentials and connection settings.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Overrides the cloud's default API endpoint; used against
    /// region-compatible or test endpoints.
    pub endpoint: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub ca_bundle_path: Option<String>,
}

/// Backoff engine tuning (design spec §4.1).
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub factor: f64,
    pub steps: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            steps: 5,
        }
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub cloud: CloudConfig,
    pub backoff: BackoffConfig,
    /// Interval used when a node poll loop doesn't have a more specific
    /// backoff schedule (e.g. readiness checks); overridable via
    /// `READINESS_INTERVAL`.
    pub readiness_interval: Duration,
    /// `MAX_BSU_VOLUMES` override; `None` means "derive from host inventory"
    /// (design spec §4.7).
    pub max_volumes_per_node: Option<u32>,
}

/// Parse a duration from either `humantime`-style (`"2s"`) or a bare
/// integer-seconds string, per design spec §4.1 ("Accepts both
/// duration-typed and numeric-second representations").
#[must_use]
pub fn parse_duration_flexible(raw: &str) -> Option<Duration> {
    if let Ok(d) = humantime::parse_duration(raw) {
        return Some(d);
    }
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_humantime_and_bare_seconds() {
        assert_eq!(parse_duration_flexible("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration_flexible("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration_flexible("not-a-duration"), None);
    }

    #[test]
    fn default_backoff_matches_spec() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.initial, Duration::from_secs(1));
        assert_eq!(cfg.factor, 2.0);
        assert_eq!(cfg.steps, 5);
    }
}
