//! Configuration file management for pilot.
//!
//! Provides a TOML-based config file at `~/.config/pilot/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use pilot_core::{Mode, SchedulerConfig, StaleCleanupConfig};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub database: Option<DatabaseSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub mode: Option<String>,
    pub max_concurrent: Option<usize>,
    pub interval_secs: Option<u64>,
    pub selector: Option<String>,
    pub wait_for_merge: Option<bool>,
    pub stale_cleanup_enabled: Option<bool>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            mode: None,
            max_concurrent: None,
            interval_secs: None,
            selector: None,
            wait_for_merge: None,
            stale_cleanup_enabled: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the pilot config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/pilot` or `~/.config/pilot`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("pilot");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("pilot")
}

/// Return the path to the pilot config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file, if one exists. Returns `Ok(None)` when
/// the file is simply absent; any other read/parse failure is an error.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let config: ConfigFile =
                toml::from_str(&contents).context("failed to parse config file")?;
            Ok(Some(config))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read config file at {}", path.display())),
    }
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// CLI flags that, when present, win over everything else.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub mode: Option<String>,
    pub max_concurrent: Option<usize>,
    pub interval_secs: Option<u64>,
    pub selector: Option<String>,
    pub database_url: Option<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct PilotConfig {
    pub scheduler: SchedulerConfig,
    pub database_url: Option<String>,
}

fn parse_mode(s: &str) -> Result<Mode> {
    match s {
        "parallel" => Ok(Mode::Parallel),
        "sequential" => Ok(Mode::Sequential),
        other => anyhow::bail!("invalid scheduler mode {other:?}; expected parallel or sequential"),
    }
}

impl PilotConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > built-in default (`SchedulerConfig::default()`).
    pub fn resolve(overrides: &CliOverrides) -> Result<Self> {
        let file_config = load_config()?;
        let file_scheduler = file_config.as_ref().map(|c| &c.scheduler);

        let mut scheduler = SchedulerConfig::default();

        if let Some(mode) = overrides
            .mode
            .clone()
            .or_else(|| std::env::var("PILOT_MODE").ok())
            .or_else(|| file_scheduler.and_then(|s| s.mode.clone()))
        {
            scheduler.mode = parse_mode(&mode)?;
        }

        if let Some(max_concurrent) = overrides
            .max_concurrent
            .or_else(|| std::env::var("PILOT_MAX_CONCURRENT").ok().and_then(|s| s.parse().ok()))
            .or_else(|| file_scheduler.and_then(|s| s.max_concurrent))
        {
            scheduler.max_concurrent = max_concurrent;
        }

        if let Some(interval_secs) = overrides
            .interval_secs
            .or_else(|| std::env::var("PILOT_INTERVAL_SECS").ok().and_then(|s| s.parse().ok()))
            .or_else(|| file_scheduler.and_then(|s| s.interval_secs))
        {
            scheduler.interval = Duration::from_secs(interval_secs);
        }

        if let Some(selector) = overrides
            .selector
            .clone()
            .or_else(|| std::env::var("PILOT_SELECTOR").ok())
            .or_else(|| file_scheduler.and_then(|s| s.selector.clone()))
        {
            scheduler.selector = selector;
        }

        if let Some(wait_for_merge) = file_scheduler.and_then(|s| s.wait_for_merge) {
            scheduler.wait_for_merge = wait_for_merge;
        }

        if let Some(enabled) = file_scheduler.and_then(|s| s.stale_cleanup_enabled) {
            scheduler.stale_cleanup = StaleCleanupConfig { enabled, ..scheduler.stale_cleanup };
        }

        scheduler.validate().context("resolved scheduler configuration is invalid")?;

        let database_url = overrides
            .database_url
            .clone()
            .or_else(|| std::env::var("PILOT_DATABASE_URL").ok())
            .or_else(|| file_config.and_then(|c| c.database).map(|d| d.url));

        Ok(Self { scheduler, database_url })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn resolve_defaults_match_scheduler_config_default() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("PILOT_MODE") };
        unsafe { std::env::remove_var("PILOT_MAX_CONCURRENT") };
        unsafe { std::env::remove_var("PILOT_INTERVAL_SECS") };
        unsafe { std::env::remove_var("PILOT_SELECTOR") };
        unsafe { std::env::remove_var("PILOT_DATABASE_URL") };
        unsafe { std::env::set_var("XDG_CONFIG_HOME", "/nonexistent-pilot-config-dir") };

        let resolved = PilotConfig::resolve(&CliOverrides::default()).unwrap();
        assert_eq!(resolved.scheduler.max_concurrent, SchedulerConfig::default().max_concurrent);
        assert!(resolved.database_url.is_none());

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
    }

    #[test]
    fn cli_flag_overrides_env_var() {
        let _lock = lock_env();
        unsafe { std::env::set_var("PILOT_MAX_CONCURRENT", "9") };

        let overrides = CliOverrides { max_concurrent: Some(3), ..Default::default() };
        let resolved = PilotConfig::resolve(&overrides).unwrap();
        assert_eq!(resolved.scheduler.max_concurrent, 3);

        unsafe { std::env::remove_var("PILOT_MAX_CONCURRENT") };
    }

    #[test]
    fn env_var_overrides_default() {
        let _lock = lock_env();
        unsafe { std::env::set_var("PILOT_SELECTOR", "custom-selector") };

        let resolved = PilotConfig::resolve(&CliOverrides::default()).unwrap();
        assert_eq!(resolved.scheduler.selector, "custom-selector");

        unsafe { std::env::remove_var("PILOT_SELECTOR") };
    }

    #[test]
    fn invalid_mode_string_is_rejected() {
        let _lock = lock_env();
        let overrides = CliOverrides { mode: Some("turbo".to_string()), ..Default::default() };
        assert!(PilotConfig::resolve(&overrides).is_err());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("pilot/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("pilot");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            scheduler: SchedulerSection { selector: Some("roundtrip".to_string()), ..Default::default() },
            database: Some(DatabaseSection { url: "postgresql://testhost:5432/testdb".to_string() }),
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.scheduler.selector, original.scheduler.selector);
        assert_eq!(loaded.database.unwrap().url, "postgresql://testhost:5432/testdb");
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let _lock = lock_env();

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
