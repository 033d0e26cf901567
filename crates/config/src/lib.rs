//! # toonpdf config
//!
//! Configuration persistence for the toonpdf workspace.
//!
//! Every crate that needs tunables implements [`Configuration`] for a
//! serde struct and loads it through [`Config`]. Files are stored as TOML
//! under a configuration root (`.config` in the working directory, or the
//! directory named by `TOONPDF_CONFIG_DIR`).
//!
//! ## Features:
//! - One `<crate-name>.toml` file per configuration type
//! - Timestamped backup before a file is overwritten
//! - Cleanup of old backups after a configurable period (default: 30 days)

use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

/// Environment variable that overrides the configuration root.
pub const CONFIG_DIR_ENV: &str = "TOONPDF_CONFIG_DIR";

const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 30;

/// A configuration object that can be persisted as TOML.
pub trait Configuration: Serialize + DeserializeOwned + Default {
    /// Name of the crate or component owning this configuration; used as file stem.
    fn crate_name() -> &'static str;
}

/// Loaded configuration together with where it lives on disk.
pub struct Config<T: Configuration> {
    /// The configuration data
    pub data: T,
    /// Number of days to keep backup files before cleaning them up
    pub cleanup_backups_after_days: u32,
    root: PathBuf,
}

/// Returns the configuration root used when no explicit root is given.
pub fn default_root() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    cwd.join(".config")
}

impl<T: Configuration> Default for Config<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Configuration> Config<T> {
    /// Default data stored under the default root.
    pub fn new() -> Self {
        Self::with_root(default_root())
    }

    /// Default data stored under `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            data: T::default(),
            cleanup_backups_after_days: DEFAULT_BACKUP_RETENTION_DAYS,
            root: root.into(),
        }
    }

    /// Location of the configuration file under the default root.
    pub fn get_location() -> PathBuf {
        location_in(&default_root(), T::crate_name())
    }

    /// Location of this configuration's file.
    pub fn location(&self) -> PathBuf {
        location_in(&self.root, T::crate_name())
    }

    fn backup_location(&self) -> PathBuf {
        self.root.join(".backup")
    }

    /// Loads the configuration from the default root.
    pub fn load() -> Result<Self> {
        Self::load_from(default_root())
    }

    /// Loads the configuration stored under `root`.
    pub fn load_from(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let path = location_in(&root, T::crate_name());
        debug!("Loading configuration from {}", path.display());

        if !path.exists() {
            anyhow::bail!("Configuration file does not exist: {}", path.display());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        let data: T = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML: {}", path.display()))?;

        Ok(Self {
            data,
            cleanup_backups_after_days: DEFAULT_BACKUP_RETENTION_DAYS,
            root,
        })
    }

    /// Loads the configuration from the default root, writing defaults when absent.
    pub fn load_or_default() -> Result<Self> {
        Self::load_or_default_from(default_root())
    }

    /// Loads the configuration under `root`, writing defaults when absent.
    pub fn load_or_default_from(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if location_in(&root, T::crate_name()).exists() {
            let config = Self::load_from(root)?;
            debug!("Loaded existing configuration");
            return Ok(config);
        }

        debug!("Configuration not found, creating default");
        let config = Self::with_root(root);
        config.save()?;
        Ok(config)
    }

    /// Copies the current file (if any) into the backup directory.
    fn backup_file(&self) -> Result<()> {
        let config_path = self.location();
        if !config_path.exists() {
            return Ok(());
        }

        let backup_dir = self.backup_location();
        create_dir_all(&backup_dir).with_context(|| {
            format!("Failed to create backup directory: {}", backup_dir.display())
        })?;

        let now: DateTime<Local> = Local::now();
        let backup_path = backup_dir.join(format!(
            "{}.toml_{}",
            T::crate_name(),
            now.format("%Y%m%d_%H%M%S")
        ));

        fs::copy(&config_path, &backup_path)
            .with_context(|| format!("Failed to create backup: {}", backup_path.display()))?;
        info!("Created backup at {}", backup_path.display());

        if let Err(e) = self.cleanup_old_backups() {
            warn!("Failed to clean up old backups: {}", e);
        }

        Ok(())
    }

    /// Writes the configuration, backing up the previous file first.
    pub fn save(&self) -> Result<()> {
        self.backup_file()?;

        let path = self.location();
        debug!("Saving configuration to {}", path.display());

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let contents =
            toml::to_string(&self.data).context("Failed to serialize configuration to TOML")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write configuration file: {}", path.display()))?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Removes this crate's backups older than `cleanup_backups_after_days`.
    fn cleanup_old_backups(&self) -> Result<()> {
        let backup_dir = self.backup_location();
        if !backup_dir.exists() {
            return Ok(());
        }

        let max_age = Duration::from_secs(u64::from(self.cleanup_backups_after_days) * 24 * 60 * 60);
        let now = SystemTime::now();

        let entries = fs::read_dir(&backup_dir)
            .with_context(|| format!("Failed to read backup directory: {}", backup_dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            let owned = path
                .file_name()
                .map(|name| name.to_string_lossy().starts_with(T::crate_name()))
                .unwrap_or(false);
            if !path.is_file() || !owned {
                continue;
            }

            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if let Some(age) = age {
                if age > max_age {
                    debug!("Removing old backup: {}", path.display());
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("Failed to remove old backup {}: {}", path.display(), e);
                    }
                }
            }
        }

        Ok(())
    }
}

fn location_in(root: &Path, crate_name: &str) -> PathBuf {
    root.join(format!("{crate_name}.toml"))
}
