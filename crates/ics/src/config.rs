//! Configuration loading for the synchronization engine
//!
//! Settings are read from (in order of priority):
//! 1. `ICS_*` environment variables
//! 2. JSON file (~/.config/groupware/ics.json)
//! 3. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config filename in the groupware config directory
const CONFIG_FILE: &str = "ics.json";

/// Tunables of the synchronization engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcsConfig {
    /// Snapshot generations kept at or below the resumed cursor
    pub retained_generations: usize,
    /// Compact and persist snapshots in a single store transaction
    pub atomic_finalize: bool,
    /// Candidates handed to the restriction gate per call
    pub restriction_batch_size: usize,
    /// Locale for string comparisons when the request carries none
    pub restriction_locale: String,
    /// Record message changes even for folders no session tracks
    pub log_all_changes: bool,
    /// Idle days after which a session registration expires, `0` = never
    pub sync_lifetime_days: u32,
}

impl Default for IcsConfig {
    fn default() -> Self {
        Self {
            retained_generations: 9,
            atomic_finalize: true,
            restriction_batch_size: 1000,
            restriction_locale: String::new(),
            log_all_changes: true,
            sync_lifetime_days: 90,
        }
    }
}

impl IcsConfig {
    /// Load the config file if present, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config = match Self::default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.with_overrides(|name| std::env::var(name).ok())
    }

    /// Load settings from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse settings from a JSON string, missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse config JSON")
    }

    /// Get the default config path (~/.config/groupware/ics.json)
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("groupware").join(CONFIG_FILE))
    }

    /// Apply `ICS_*` overrides resolved through `lookup`
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("ICS_RETAINED_GENERATIONS") {
            self.retained_generations = parse_var("ICS_RETAINED_GENERATIONS", &value)?;
        }
        if let Some(value) = lookup("ICS_ATOMIC_FINALIZE") {
            self.atomic_finalize = parse_bool("ICS_ATOMIC_FINALIZE", &value)?;
        }
        if let Some(value) = lookup("ICS_RESTRICTION_BATCH_SIZE") {
            self.restriction_batch_size = parse_var("ICS_RESTRICTION_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("ICS_RESTRICTION_LOCALE") {
            self.restriction_locale = value;
        }
        if let Some(value) = lookup("ICS_LOG_ALL_CHANGES") {
            self.log_all_changes = parse_bool("ICS_LOG_ALL_CHANGES", &value)?;
        }
        if let Some(value) = lookup("ICS_SYNC_LIFETIME_DAYS") {
            self.sync_lifetime_days = parse_var("ICS_SYNC_LIFETIME_DAYS", &value)?;
        }
        Ok(self)
    }

    /// Batch size used for restriction evaluation, never zero
    pub fn batch_size(&self) -> usize {
        self.restriction_batch_size.max(1)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", name, value))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid value for {}: {:?}", name, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = IcsConfig::default();
        assert_eq!(config.retained_generations, 9);
        assert!(config.atomic_finalize);
        assert_eq!(config.restriction_batch_size, 1000);
        assert!(config.log_all_changes);
        assert_eq!(config.sync_lifetime_days, 90);
    }

    #[test]
    fn test_partial_json() {
        let config = IcsConfig::from_json(r#"{ "retained_generations": 3 }"#).unwrap();
        assert_eq!(config.retained_generations, 3);
        assert_eq!(config.restriction_batch_size, 1000);
    }

    #[test]
    fn test_invalid_json() {
        assert!(IcsConfig::from_json(r#"{ "atomic_finalize": "maybe" }"#).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{ "log_all_changes": false }"#).unwrap();

        let config = IcsConfig::from_file(&path).unwrap();
        assert!(!config.log_all_changes);
        assert!(IcsConfig::from_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ICS_RETAINED_GENERATIONS", "4"),
            ("ICS_ATOMIC_FINALIZE", "off"),
            ("ICS_RESTRICTION_LOCALE", "de_DE"),
        ]);
        let config = IcsConfig::default()
            .with_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.retained_generations, 4);
        assert!(!config.atomic_finalize);
        assert_eq!(config.restriction_locale, "de_DE");
        assert_eq!(config.sync_lifetime_days, 90);
    }

    #[test]
    fn test_invalid_override() {
        let result = IcsConfig::default().with_overrides(|name| {
            (name == "ICS_RESTRICTION_BATCH_SIZE").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_size_never_zero() {
        let config = IcsConfig {
            restriction_batch_size: 0,
            ..IcsConfig::default()
        };
        assert_eq!(config.batch_size(), 1);
    }

    #[test]
    fn test_default_config_path() {
        let path = IcsConfig::default_config_path();
        assert!(path.is_some());
        assert!(path.unwrap().ends_with("groupware/ics.json"));
    }
}
