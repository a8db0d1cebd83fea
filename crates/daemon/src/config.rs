// Local configuration for the holdfast daemon.
//
// Global config: `~/.holdfast/config.toml`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::crawler::share_crawler::{
    CrawlerConfig, DEFAULT_MINIMUM_CYCLE_TIME_SECS, DEFAULT_SLOW_START_SECS,
};
use crate::expiration::{ExpirationMode, ExpirationPolicy};

/// Root directory for Holdfast global state: `~/.holdfast/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".holdfast"))
}

/// Path to the global config file: `~/.holdfast/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Daemon configuration at `~/.holdfast/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct DaemonConfig {
    /// Lease database path (defaults to `~/.holdfast/leases.db`).
    pub db_path: Option<PathBuf>,
    /// Root of the on-disk share tree (defaults to `~/.holdfast/shares`).
    pub shares_root: Option<PathBuf>,
    /// Crawler statefile path (defaults to
    /// `~/.holdfast/accounting_crawler.state`).
    pub statefile: Option<PathBuf>,
    /// Crawler pacing.
    pub crawler: CrawlerSection,
    /// Lease garbage collection.
    pub expiration: ExpirationSection,
}

impl DaemonConfig {
    /// Load from `~/.holdfast/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// `[crawler]` section: pacing of the accounting crawler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrawlerSection {
    /// Seconds to wait after startup before the first slice.
    pub slow_start_secs: u64,
    /// Minimum seconds between cycle starts.
    pub minimum_cycle_time_secs: u64,
}

impl Default for CrawlerSection {
    fn default() -> Self {
        Self {
            slow_start_secs: DEFAULT_SLOW_START_SECS,
            minimum_cycle_time_secs: DEFAULT_MINIMUM_CYCLE_TIME_SECS,
        }
    }
}

impl CrawlerSection {
    /// Convert to the crawler's config; out-of-range values are clamped.
    pub fn to_crawler_config(&self) -> CrawlerConfig {
        CrawlerConfig::with_secs(self.slow_start_secs, self.minimum_cycle_time_secs)
    }
}

/// `[expiration]` section: lease garbage collection policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExpirationSection {
    /// Whether expired leases are removed at all.
    pub enabled: bool,
    /// `"age"` or `"cutoff-date"`.
    pub mode: String,
    /// Age mode only: server-wide lease duration overriding each lease's
    /// own expiration time.
    pub override_lease_duration_secs: Option<i64>,
    /// Cutoff-date mode only: leases renewed before this time (seconds
    /// since epoch) are expired.
    pub cutoff_date: Option<i64>,
}

impl Default for ExpirationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: "age".to_string(),
            override_lease_duration_secs: None,
            cutoff_date: None,
        }
    }
}

impl ExpirationSection {
    /// Validate into a policy. Each mode accepts exactly its own knobs.
    pub fn build(&self) -> Result<ExpirationPolicy, ConfigError> {
        let mode = match self.mode.as_str() {
            "age" => {
                if self.cutoff_date.is_some() {
                    return Err(ConfigError::Invalid(
                        "expiration.cutoff_date is only valid in cutoff-date mode".to_string(),
                    ));
                }
                ExpirationMode::Age {
                    override_lease_duration: self.override_lease_duration_secs,
                }
            }
            "cutoff-date" => {
                if self.override_lease_duration_secs.is_some() {
                    return Err(ConfigError::Invalid(
                        "expiration.override_lease_duration_secs is only valid in age mode"
                            .to_string(),
                    ));
                }
                let cutoff_date = self.cutoff_date.ok_or_else(|| {
                    ConfigError::Invalid(
                        "expiration.cutoff_date is required in cutoff-date mode".to_string(),
                    )
                })?;
                ExpirationMode::CutoffDate { cutoff_date }
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "expiration.mode must be \"age\" or \"cutoff-date\", got {other:?}"
                )))
            }
        };

        Ok(ExpirationPolicy::new(self.enabled, mode))
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
            Self::Invalid(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
