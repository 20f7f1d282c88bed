//! State directory resolution for forma
//!
//! Each declaration directory gets its own state directory, holding the
//! state file, its lock and backup, and the local provider's `cloud.json`.
//!
//! # Environment Variables
//!
//! - `FORMA_STATE_DIR` - Override state directory
//!
//! # Path Resolution Priority
//!
//! For state_dir():
//! 1. `--state-dir` flag
//! 2. `FORMA_STATE_DIR` environment variable
//! 3. `state_dir` in `forma.toml` (relative to the declarations)
//! 4. `XDG_STATE_HOME/forma/<project>` (if set)
//! 5. Platform default:
//!    - Windows: `%LOCALAPPDATA%\forma\<project>`
//!    - macOS/Linux: `~/.local/state/forma/<project>`
//!
//! `<project>` is the declaration directory's name followed by a short
//! hash of its absolute path, so two checkouts never share state.

use crate::config::Settings;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "FORMA_STATE_DIR";

/// Inputs to state directory resolution that come from outside the project
#[derive(Debug, Default)]
struct Overrides {
    flag: Option<PathBuf>,
    env: Option<String>,
    xdg_state_home: Option<String>,
}

/// Get the state directory for a declaration directory
pub fn state_dir(declarations: &Path, flag: Option<&Path>, settings: &Settings) -> Result<PathBuf> {
    let overrides = Overrides {
        flag: flag.map(Path::to_path_buf),
        env: std::env::var(ENV_STATE_DIR).ok(),
        xdg_state_home: std::env::var("XDG_STATE_HOME").ok(),
    };
    resolve(declarations, &overrides, settings)
}

fn resolve(declarations: &Path, overrides: &Overrides, settings: &Settings) -> Result<PathBuf> {
    // 1. Command-line flag
    if let Some(flag) = &overrides.flag {
        log::debug!("Using state dir from --state-dir: {}", flag.display());
        return Ok(flag.clone());
    }

    // 2. Environment variable override
    if let Some(dir) = overrides.env.as_deref().filter(|d| !d.is_empty()) {
        let path = expand(dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    // 3. Settings file
    if let Some(dir) = &settings.state_dir {
        let path = declarations.join(expand(dir));
        log::debug!("Using state dir from settings: {}", path.display());
        return Ok(path);
    }

    let project = project_key(declarations);

    // 4. XDG_STATE_HOME
    if let Some(xdg_state) = overrides.xdg_state_home.as_deref().filter(|d| !d.is_empty()) {
        let path = PathBuf::from(xdg_state).join("forma").join(project);
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    // 5. Platform default
    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            let path = local_app_data.join("forma").join(&project);
            log::debug!("Using Windows state dir: {}", path.display());
            return Ok(path);
        }
    }

    // Unix default: ~/.local/state/forma/<project>
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home
        .join(".local")
        .join("state")
        .join("forma")
        .join(project);
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Stable per-directory name: `<dir name>-<12 hex chars>`
pub fn project_key(declarations: &Path) -> String {
    let absolute = declarations
        .canonicalize()
        .unwrap_or_else(|_| declarations.to_path_buf());
    let hash = blake3::hash(absolute.to_string_lossy().as_bytes()).to_hex();

    let name: String = absolute
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let name = if name.is_empty() { "root".to_string() } else { name };

    format!("{name}-{}", &hash.as_str()[..12])
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flag_wins() {
        let overrides = Overrides {
            flag: Some(PathBuf::from("/from/flag")),
            env: Some("/from/env".to_string()),
            xdg_state_home: None,
        };
        let settings = Settings {
            state_dir: Some("from-settings".to_string()),
            ..Settings::default()
        };
        let dir = resolve(Path::new("infra"), &overrides, &settings).unwrap();
        assert_eq!(dir, PathBuf::from("/from/flag"));
    }

    #[test]
    fn test_env_beats_settings() {
        let overrides = Overrides {
            env: Some("/custom/state/path".to_string()),
            ..Overrides::default()
        };
        let settings = Settings {
            state_dir: Some("from-settings".to_string()),
            ..Settings::default()
        };
        let dir = resolve(Path::new("infra"), &overrides, &settings).unwrap();
        assert_eq!(dir, PathBuf::from("/custom/state/path"));
    }

    #[test]
    fn test_env_expands_tilde() {
        let home = dirs::home_dir().unwrap();
        let overrides = Overrides {
            env: Some("~/forma-tilde-test".to_string()),
            ..Overrides::default()
        };
        let dir = resolve(Path::new("infra"), &overrides, &Settings::default()).unwrap();
        assert_eq!(dir, home.join("forma-tilde-test"));
    }

    #[test]
    fn test_settings_relative_to_declarations() {
        let settings = Settings {
            state_dir: Some(".forma".to_string()),
            ..Settings::default()
        };
        let dir = resolve(Path::new("infra"), &Overrides::default(), &settings).unwrap();
        assert_eq!(dir, PathBuf::from("infra/.forma"));
    }

    #[test]
    fn test_xdg_state_home_gets_project_dir() {
        let project = TempDir::new().unwrap();
        let overrides = Overrides {
            xdg_state_home: Some("/xdg/state".to_string()),
            ..Overrides::default()
        };
        let dir = resolve(project.path(), &overrides, &Settings::default()).unwrap();
        assert!(dir.starts_with("/xdg/state/forma"));
        assert_eq!(
            dir.file_name().unwrap().to_string_lossy(),
            project_key(project.path())
        );
    }

    #[test]
    fn test_project_key_is_stable_and_distinct() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        assert_eq!(project_key(a.path()), project_key(a.path()));
        assert_ne!(project_key(a.path()), project_key(b.path()));

        let key = project_key(a.path());
        let (_, hash) = key.rsplit_once('-').unwrap();
        assert_eq!(hash.len(), 12);
    }
}
