//! Project settings (`forma.toml`)
//!
//! The settings file lives next to the declarations and is optional. Every
//! value has a default; command-line flags override what the file says.
//!
//! ```toml
//! [settings]
//! state_dir = "~/.local/state/forma/shop"
//! lock_timeout_secs = 30
//! jobs = 4
//!
//! [settings.retry]
//! max_attempts = 4
//! base_delay_ms = 2000
//! backoff_factor = 2.0
//! max_delay_ms = 30000
//! ```

use anyhow::{Context, Result, bail};
use declarative::{ApplyOptions, RetryPolicy};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Name of the settings file inside a declaration directory
pub const SETTINGS_FILE: &str = "forma.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    settings: Settings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Where state is kept; relative paths are relative to the declarations
    pub state_dir: Option<String>,
    /// How long to wait for another run's lock
    pub lock_timeout_secs: u64,
    /// Provider calls in flight during apply and refresh
    pub jobs: usize,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: None,
            lock_timeout_secs: 30,
            jobs: 4,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            backoff_factor: policy.backoff_factor,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Settings {
    /// Load `forma.toml` from a declaration directory, or defaults if absent
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE);
        if !path.exists() {
            log::debug!("No {} in {}, using defaults", SETTINGS_FILE, dir.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let file: SettingsFile = toml::from_str(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        let settings = file.settings;
        settings
            .check()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        if self.jobs == 0 {
            bail!("jobs must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            bail!("retry.backoff_factor must be a number of at least 1.0");
        }
        Ok(())
    }

    /// Override file settings with command-line flags
    pub fn with_overrides(mut self, jobs: Option<usize>, lock_timeout_secs: Option<u64>) -> Self {
        if let Some(jobs) = jobs {
            self.jobs = jobs.max(1);
        }
        if let Some(secs) = lock_timeout_secs {
            self.lock_timeout_secs = secs;
        }
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            jobs: self.jobs,
            retry: self.retry.policy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.lock_timeout(), Duration::from_secs(30));
        assert_eq!(settings.apply_options().retry, RetryPolicy::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            "[settings]\njobs = 8\n\n[settings.retry]\nmax_attempts = 2\n",
        )
        .unwrap();

        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.jobs, 8);
        assert_eq!(settings.lock_timeout_secs, 30);
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.retry.base_delay_ms, 2000);

        let options = settings.apply_options();
        assert_eq!(options.jobs, 8);
        assert_eq!(options.retry.max_attempts, 2);
        assert_eq!(options.retry.base_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "[settings]\nworkers = 2\n").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }

    #[test]
    fn test_zero_jobs_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "[settings]\njobs = 0\n").unwrap();
        let err = Settings::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("jobs must be at least 1"));
    }

    #[test]
    fn test_flags_override_file() {
        let settings = Settings::default().with_overrides(Some(16), Some(5));
        assert_eq!(settings.jobs, 16);
        assert_eq!(settings.lock_timeout(), Duration::from_secs(5));

        let unchanged = Settings::default().with_overrides(None, None);
        assert_eq!(unchanged, Settings::default());
    }
}
