//! # Link Configuration
//!
//! Settings for the serial link controller, persisted as TOML under
//! `~/.config/slotlink/link_config.toml`.
//!
//! All timing constants are tunable but must keep their relative ordering
//! (see [`LinkSettings::validate`]). A missing file is created with defaults on
//! first start, so the link always comes up with a usable configuration.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/slotlink";
const LINK_CONFIG_FILE: &str = "link_config.toml";

/// Baud rate the cabinet firmware listens on.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Validation failures for [`LinkSettings`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("baud rate must be greater than zero")]
    ZeroBaudRate,

    #[error("watchdog timeout ({timeout_ms}ms) must exceed the keepalive interval ({keepalive_ms}ms)")]
    WatchdogNotAboveKeepalive { timeout_ms: u64, keepalive_ms: u64 },

    #[error("watchdog poll ({poll_ms}ms) must be shorter than the watchdog timeout ({timeout_ms}ms)")]
    WatchdogPollTooSlow { poll_ms: u64, timeout_ms: u64 },

    #[error("debounce window ({debounce_ms}ms) must be shorter than the lose cooldown ({lose_ms}ms)")]
    DebounceNotBelowCooldown { debounce_ms: u64, lose_ms: u64 },

    #[error("lose cooldown ({lose_ms}ms) must not exceed the win cooldown ({win_ms}ms)")]
    CooldownsInverted { lose_ms: u64, win_ms: u64 },

    #[error("at least one open attempt is required")]
    NoOpenAttempts,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Timing constants of the link, in milliseconds.
///
/// Stored as plain integers so the TOML file stays readable; use the
/// accessor methods to get [`Duration`]s.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LinkTimings {
    /// Wait after opening the port; opening resets the device.
    pub boot_delay_ms: u64,
    pub keepalive_interval_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub watchdog_poll_ms: u64,
    /// Contact bounce window for roll triggers.
    pub debounce_ms: u64,
    pub win_cooldown_ms: u64,
    pub lose_cooldown_ms: u64,
    /// Wait after closing a port that reported itself as already open.
    pub open_settle_ms: u64,
    /// Backoff unit for busy ports, multiplied by the attempt number.
    pub busy_backoff_ms: u64,
    pub busy_close_wait_ms: u64,
    pub max_open_attempts: u32,
    pub disconnect_grace_ms: u64,
    pub reader_exit_wait_ms: u64,
    /// Upper bound for reader/writer shutdown during teardown.
    pub pipe_close_timeout_ms: u64,
    pub post_close_cooldown_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            boot_delay_ms: 2000,
            keepalive_interval_ms: 2000,
            watchdog_timeout_ms: 3000,
            watchdog_poll_ms: 500,
            debounce_ms: 60,
            win_cooldown_ms: 7200,
            lose_cooldown_ms: 4200,
            open_settle_ms: 800,
            busy_backoff_ms: 800,
            busy_close_wait_ms: 500,
            max_open_attempts: 2,
            disconnect_grace_ms: 100,
            reader_exit_wait_ms: 50,
            pipe_close_timeout_ms: 500,
            post_close_cooldown_ms: 300,
            write_timeout_ms: 1000,
        }
    }
}

impl LinkTimings {
    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn watchdog_poll(&self) -> Duration {
        Duration::from_millis(self.watchdog_poll_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn win_cooldown(&self) -> Duration {
        Duration::from_millis(self.win_cooldown_ms)
    }

    pub fn lose_cooldown(&self) -> Duration {
        Duration::from_millis(self.lose_cooldown_ms)
    }

    pub fn open_settle(&self) -> Duration {
        Duration::from_millis(self.open_settle_ms)
    }

    /// Backoff before retrying a busy port on the given (1-based) attempt.
    pub fn busy_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.busy_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn busy_close_wait(&self) -> Duration {
        Duration::from_millis(self.busy_close_wait_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn reader_exit_wait(&self) -> Duration {
        Duration::from_millis(self.reader_exit_wait_ms)
    }

    pub fn pipe_close_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_close_timeout_ms)
    }

    pub fn post_close_cooldown(&self) -> Duration {
        Duration::from_millis(self.post_close_cooldown_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Configuration for one serial link controller.
///
/// # Examples
///
/// ```rust
/// use slotlink::config::LinkSettings;
///
/// let mut settings = LinkSettings::default();
/// settings.port_path = Some("/dev/ttyACM0".to_string());
/// settings.timings.win_cooldown_ms = 9000;
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LinkSettings {
    /// Device path; `None` picks the first USB serial port found.
    pub port_path: Option<String>,
    pub baud_rate: u32,
    /// Log every roll gate decision at info level instead of debug.
    pub verbose_roll_logging: bool,
    pub timings: LinkTimings,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            port_path: None,
            baud_rate: DEFAULT_BAUD_RATE,
            verbose_roll_logging: true,
            timings: LinkTimings::default(),
        }
    }
}

impl LinkSettings {
    /// Checks that the timing constants keep their required ordering.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let t = &self.timings;

        if self.baud_rate == 0 {
            return Err(SettingsError::ZeroBaudRate);
        }
        if t.keepalive_interval_ms == 0 {
            return Err(SettingsError::ZeroInterval("keepalive_interval_ms"));
        }
        if t.watchdog_poll_ms == 0 {
            return Err(SettingsError::ZeroInterval("watchdog_poll_ms"));
        }
        if t.watchdog_timeout_ms <= t.keepalive_interval_ms {
            return Err(SettingsError::WatchdogNotAboveKeepalive {
                timeout_ms: t.watchdog_timeout_ms,
                keepalive_ms: t.keepalive_interval_ms,
            });
        }
        if t.watchdog_poll_ms >= t.watchdog_timeout_ms {
            return Err(SettingsError::WatchdogPollTooSlow {
                poll_ms: t.watchdog_poll_ms,
                timeout_ms: t.watchdog_timeout_ms,
            });
        }
        if t.debounce_ms >= t.lose_cooldown_ms {
            return Err(SettingsError::DebounceNotBelowCooldown {
                debounce_ms: t.debounce_ms,
                lose_ms: t.lose_cooldown_ms,
            });
        }
        if t.lose_cooldown_ms > t.win_cooldown_ms {
            return Err(SettingsError::CooldownsInverted {
                lose_ms: t.lose_cooldown_ms,
                win_ms: t.win_cooldown_ms,
            });
        }
        if t.max_open_attempts == 0 {
            return Err(SettingsError::NoOpenAttempts);
        }

        Ok(())
    }

    /// Default location of the link configuration file.
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(LINK_CONFIG_FILE);
        path
    }

    /// Reads and validates settings from a TOML file.
    pub async fn load(path: &Path) -> Result<Self> {
        debug!("Loading link settings from {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read link config {}: {}", path.display(), e))?;

        let settings: LinkSettings = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse link config {}: {}", path.display(), e))?;

        settings
            .validate()
            .map_err(|e| eyre!("Invalid link config {}: {}", path.display(), e))?;

        info!("Loaded link settings from {}", path.display());
        Ok(settings)
    }

    /// Writes the settings as pretty TOML, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize link config: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write link config {}: {}", path.display(), e))?;

        debug!("Saved link settings to {}", path.display());
        Ok(())
    }

    /// Loads the settings at `path`, writing defaults there first if the file is missing.
    pub async fn ensure_default_config(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if link config exists: {}", e))?;

        if !exists {
            warn!(
                "No link config found at {}, writing defaults",
                path.display()
            );
            let defaults = LinkSettings::default();
            defaults.save(path).await?;
            return Ok(defaults);
        }

        Self::load(path).await
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
