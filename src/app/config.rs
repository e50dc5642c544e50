use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

pub const DEFAULT_CATALOG_URL: &str =
    "https://mrgun.chu-jiao.com/api/v1/admins/applications/versions/all";
pub const DEFAULT_COMPANION_PACKAGE: &str = "com.ChuJiao.quest3_wireless_adb";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdbSettings {
    pub command_path: String,
    pub device_serial: String,
    pub command_timeout_secs: u64,
    /// Source of `install-adb`; empty picks the official archive for this OS.
    #[serde(default)]
    pub platform_tools_url: String,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            device_serial: String::new(),
            command_timeout_secs: 10,
            platform_tools_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogSettings {
    pub url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CATALOG_URL.to_string(),
            timeout_secs: 30,
            user_agent: "Mozilla/5.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSettings {
    /// Empty means "resolve automatically".
    pub directory: String,
    pub stall_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub min_artifact_bytes: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            directory: String::new(),
            stall_timeout_secs: 30,
            connect_timeout_secs: 15,
            min_artifact_bytes: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallSettings {
    pub replace_existing: bool,
    pub timeout_secs: u64,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            replace_existing: true,
            timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSettings {
    pub poll_interval_secs: u64,
    pub enable_recheck_ms: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            enable_recheck_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageSettings {
    pub excluded_prefixes: Vec<String>,
    /// package id -> display name shown to the user and used for catalog matching.
    /// A package missing here keeps its id as name and only matches a catalog entry
    /// literally named after that id.
    pub display_names: HashMap<String, String>,
}

impl Default for PackageSettings {
    fn default() -> Self {
        Self {
            excluded_prefixes: default_excluded_prefixes(),
            display_names: HashMap::new(),
        }
    }
}

pub fn default_excluded_prefixes() -> Vec<String> {
    [
        "com.android.",
        "com.google.",
        "com.oculus.",
        "com.meta.",
        "com.facebook.",
        "android.",
    ]
    .iter()
    .map(|prefix| prefix.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCommandSettings {
    pub package_id: String,
    pub locate_repeats: u32,
    pub locate_interval_ms: u64,
}

impl Default for RemoteCommandSettings {
    fn default() -> Self {
        Self {
            package_id: DEFAULT_COMPANION_PACKAGE.to_string(),
            locate_repeats: 5,
            locate_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySettings {
    pub scan_secs: u64,
    pub port_lookup_timeout_ms: u64,
    /// Empty means `~/.quest_wireless_adb_devices.json`.
    pub devices_path: String,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            scan_secs: 10,
            port_lookup_timeout_ms: 3000,
            devices_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub catalog: CatalogSettings,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub install: InstallSettings,
    #[serde(default)]
    pub status: StatusSettings,
    #[serde(default)]
    pub packages: PackageSettings,
    #[serde(default)]
    pub remote_command: RemoteCommandSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("QUEST_WIRELESS_ADB_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    home_dir().join(".quest_wireless_adb_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let path = config_path();
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    path.with_file_name(format!("{stem}.backup.json"))
}

pub fn devices_path(config: &AppConfig) -> PathBuf {
    let configured = config.discovery.devices_path.trim();
    if !configured.is_empty() {
        return PathBuf::from(configured);
    }
    home_dir().join(".quest_wireless_adb_devices.json")
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

pub fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();
    if config.adb.command_timeout_secs == 0 {
        config.adb.command_timeout_secs = defaults.adb.command_timeout_secs;
    }
    if config.catalog.url.trim().is_empty() {
        config.catalog.url = defaults.catalog.url;
    }
    if config.catalog.timeout_secs == 0 {
        config.catalog.timeout_secs = defaults.catalog.timeout_secs;
    }
    if config.download.stall_timeout_secs == 0 {
        config.download.stall_timeout_secs = defaults.download.stall_timeout_secs;
    }
    if config.download.connect_timeout_secs == 0 {
        config.download.connect_timeout_secs = defaults.download.connect_timeout_secs;
    }
    // Anything shorter than the ZIP signature cannot be an APK.
    if config.download.min_artifact_bytes < 4 {
        config.download.min_artifact_bytes = 4;
    }
    if config.install.timeout_secs < 10 {
        config.install.timeout_secs = defaults.install.timeout_secs;
    }
    if config.status.poll_interval_secs == 0 {
        config.status.poll_interval_secs = defaults.status.poll_interval_secs;
    }
    if config.remote_command.package_id.trim().is_empty() {
        config.remote_command.package_id = defaults.remote_command.package_id;
    }
    if config.remote_command.locate_repeats == 0 {
        config.remote_command.locate_repeats = defaults.remote_command.locate_repeats;
    }
    if config.discovery.scan_secs == 0 {
        config.discovery.scan_secs = defaults.discovery.scan_secs;
    }
    config
}
