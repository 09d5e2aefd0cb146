//! Configuration management for Memo Core.
//!
//! This module handles loading and saving application configuration to/from
//! a JSON file. The config directory can be customized.
//!
//! Includes sync-related configuration:
//! - paging: page size and search debounce
//! - sync: full sync page size and page limit
//! - accounts: server connections and their capabilities

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemoError, MemoResult};
use crate::full_sync::FullSyncOptions;
use crate::validation::validate_page_size;

/// Paging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagingConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Quiet period before a typed search is applied
    #[serde(default = "default_search_debounce_ms")]
    pub search_debounce_ms: u64,
}

fn default_page_size() -> usize {
    10
}

fn default_search_debounce_ms() -> u64 {
    300
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            search_debounce_ms: default_search_debounce_ms(),
        }
    }
}

/// Full sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_full_sync_page_size")]
    pub full_sync_page_size: usize,
    #[serde(default = "default_max_full_sync_pages")]
    pub max_full_sync_pages: usize,
}

fn default_full_sync_page_size() -> usize {
    200
}

fn default_max_full_sync_pages() -> usize {
    50
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_sync_page_size: default_full_sync_page_size(),
            max_full_sync_pages: default_max_full_sync_pages(),
        }
    }
}

/// A server connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_key: String,
    pub base_url: String,
    /// Server accepts filter expressions on list calls
    #[serde(default = "default_supports_server_filter")]
    pub supports_server_filter: bool,
    /// Server version the user chose to sync with despite it being untested
    #[serde(default)]
    pub accepted_sync_version: Option<String>,
}

fn default_supports_server_filter() -> bool {
    true
}

fn default_usage_window_days() -> u32 {
    84
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Human-readable device name
    #[serde(default = "get_default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub paging: PagingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Days covered by the usage histogram
    #[serde(default = "default_usage_window_days")]
    pub usage_window_days: u32,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

fn get_default_device_name() -> String {
    #[cfg(feature = "desktop")]
    {
        match hostname::get() {
            Ok(name) => format!("Memos on {}", name.to_string_lossy()),
            Err(_) => "Memos Device".to_string(),
        }
    }
    #[cfg(not(feature = "desktop"))]
    {
        "Memos Mobile".to_string()
    }
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            device_name: get_default_device_name(),
            paging: PagingConfig::default(),
            sync: SyncConfig::default(),
            usage_window_days: default_usage_window_days(),
            accounts: Vec::new(),
        }
    }
}

/// Settings a session runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub page_size: usize,
    pub search_debounce: Duration,
    pub full_sync: FullSyncOptions,
    pub usage_window_days: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            search_debounce: Duration::from_millis(default_search_debounce_ms()),
            full_sync: FullSyncOptions::default(),
            usage_window_days: default_usage_window_days(),
        }
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// On mobile platforms (without the `desktop` feature), `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> MemoResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("memocore")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(MemoError::Config(
                        "config_dir is required on mobile platforms".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let default_data = || ConfigData {
            database_file: config_dir.join("memos.db").to_string_lossy().to_string(),
            ..ConfigData::default()
        };

        let mut data = match fs::read_to_string(&config_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed {}: {}", config_file.display(), e);
                default_data()
            }),
            Err(_) => default_data(),
        };
        if data.database_file.is_empty() {
            data.database_file = default_data().database_file;
        }

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> MemoResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    /// Get the human-readable device name
    pub fn device_name(&self) -> &str {
        &self.data.device_name
    }

    /// Set the device name
    pub fn set_device_name(&mut self, name: &str) -> MemoResult<()> {
        self.data.device_name = name.to_string();
        self.save()
    }

    pub fn paging(&self) -> &PagingConfig {
        &self.data.paging
    }

    /// Set the page size used for paged lists
    pub fn set_page_size(&mut self, page_size: usize) -> MemoResult<()> {
        validate_page_size(page_size)?;
        self.data.paging.page_size = page_size;
        self.save()
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.data.sync
    }

    pub fn usage_window_days(&self) -> u32 {
        self.data.usage_window_days
    }

    /// Settings handed to a new session
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            page_size: self.data.paging.page_size,
            search_debounce: Duration::from_millis(self.data.paging.search_debounce_ms),
            full_sync: FullSyncOptions {
                page_size: self.data.sync.full_sync_page_size,
                max_pages: self.data.sync.max_full_sync_pages,
            },
            usage_window_days: self.data.usage_window_days,
        }
    }

    /// Get list of accounts
    pub fn accounts(&self) -> &[AccountConfig] {
        &self.data.accounts
    }

    /// Get a specific account by key
    pub fn get_account(&self, account_key: &str) -> Option<&AccountConfig> {
        self.data.accounts.iter().find(|a| a.account_key == account_key)
    }

    /// Add or replace an account
    pub fn add_account(
        &mut self,
        account_key: &str,
        base_url: &str,
        supports_server_filter: bool,
    ) -> MemoResult<()> {
        if account_key.trim().is_empty() {
            return Err(MemoError::validation("account_key", "cannot be empty"));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(MemoError::validation("base_url", "must be an http(s) URL"));
        }

        if let Some(existing) = self
            .data
            .accounts
            .iter_mut()
            .find(|a| a.account_key == account_key)
        {
            existing.base_url = base_url.to_string();
            existing.supports_server_filter = supports_server_filter;
        } else {
            self.data.accounts.push(AccountConfig {
                account_key: account_key.to_string(),
                base_url: base_url.to_string(),
                supports_server_filter,
                accepted_sync_version: None,
            });
        }

        self.save()
    }

    /// Remove an account
    pub fn remove_account(&mut self, account_key: &str) -> MemoResult<bool> {
        let original_len = self.data.accounts.len();
        self.data.accounts.retain(|a| a.account_key != account_key);
        let removed = self.data.accounts.len() < original_len;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Remember a server version the user accepted for an account
    pub fn set_accepted_sync_version(&mut self, account_key: &str, version: &str) -> MemoResult<bool> {
        if let Some(account) = self
            .data
            .accounts
            .iter_mut()
            .find(|a| a.account_key == account_key)
        {
            account.accepted_sync_version = Some(version.to_string());
            self.save()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "device_name" => Some(self.data.device_name.clone()),
            "page_size" => Some(self.data.paging.page_size.to_string()),
            "search_debounce_ms" => Some(self.data.paging.search_debounce_ms.to_string()),
            "usage_window_days" => Some(self.data.usage_window_days.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> MemoResult<()> {
        let invalid = |e: std::num::ParseIntError| MemoError::validation(key, e.to_string());
        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "device_name" => self.data.device_name = value.to_string(),
            "page_size" => {
                let page_size = value.parse().map_err(invalid)?;
                validate_page_size(page_size)?;
                self.data.paging.page_size = page_size;
            }
            "search_debounce_ms" => self.data.paging.search_debounce_ms = value.parse().map_err(invalid)?,
            "usage_window_days" => self.data.usage_window_days = value.parse().map_err(invalid)?,
            _ => return Err(MemoError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        assert!(!config.device_name().is_empty());
        assert!(config.database_file().ends_with("memos.db"));
        assert_eq!(config.paging().page_size, 10);
        assert_eq!(config.paging().search_debounce_ms, 300);
        assert_eq!(config.usage_window_days(), 84);
        assert!(config.accounts().is_empty());
        assert!(temp_dir.path().join("config.json").exists());
    }

    #[test]
    fn test_session_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        assert_eq!(config.session_settings(), SessionSettings::default());
        assert_eq!(
            config.session_settings().search_debounce,
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_add_and_remove_account() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        config
            .add_account("memos:demo", "https://demo.example", true)
            .unwrap();
        config
            .add_account("memos:demo", "https://demo2.example", false)
            .unwrap();

        assert_eq!(config.accounts().len(), 1);
        let account = config.get_account("memos:demo").unwrap();
        assert_eq!(account.base_url, "https://demo2.example");
        assert!(!account.supports_server_filter);

        assert!(config.remove_account("memos:demo").unwrap());
        assert!(!config.remove_account("memos:demo").unwrap());
    }

    #[test]
    fn test_invalid_account() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        assert!(config.add_account("", "https://demo.example", true).is_err());
        assert!(config.add_account("memos:demo", "ftp://demo", true).is_err());
    }

    #[test]
    fn test_config_persistence() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
            config.set_device_name("Test Device").unwrap();
            config.set_page_size(25).unwrap();
            config
                .add_account("memos:demo", "https://demo.example", true)
                .unwrap();
            assert!(config
                .set_accepted_sync_version("memos:demo", "0.27.0")
                .unwrap());
        }

        {
            let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
            assert_eq!(config.device_name(), "Test Device");
            assert_eq!(config.paging().page_size, 25);
            assert_eq!(
                config.get_account("memos:demo").unwrap().accepted_sync_version.as_deref(),
                Some("0.27.0")
            );
        }
    }

    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("config.json"), "{not json").unwrap();

        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        assert_eq!(config.paging().page_size, 10);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("config.json"),
            r#"{"paging": {"page_size": 30}}"#,
        )
        .unwrap();

        let config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        assert_eq!(config.paging().page_size, 30);
        assert_eq!(config.paging().search_debounce_ms, 300);
        assert_eq!(config.sync_config().full_sync_page_size, 200);
    }

    #[test]
    fn test_get_set() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();

        config.set("search_debounce_ms", "500").unwrap();
        assert_eq!(config.get("search_debounce_ms"), Some("500".to_string()));

        assert!(config.set("page_size", "0").is_err());
        assert!(config.set("page_size", "many").is_err());
        assert!(config.set("nope", "1").is_err());
        assert!(config.get("nope").is_none());
    }
}
