use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::app::adb::apk::LocalArtifact;
use crate::app::adb::connection::PermissionChange;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

impl DeviceSummary {
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }

    /// Wireless transports are listed as `ip:port`; anything else is USB.
    pub fn is_usb(&self) -> bool {
        !self.serial.contains(':')
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub serial: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostCommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdbInfo {
    pub available: bool,
    pub version: Option<String>,
    pub version_output: String,
    pub command_path: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResponse<T> {
    pub trace_id: String,
    pub data: T,
}

/// A package installed on the headset, before it is joined with the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalPackage {
    pub package_name: String,
    pub display_name: String,
    pub version_name: Option<String>,
    pub version_code: Option<String>,
}

/// Row of the installed-apps view. Rebuilt from scratch on every refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledApp {
    pub package_name: String,
    pub display_name: String,
    pub local_version_name: Option<String>,
    pub local_version_code: Option<String>,
    pub remote_version: Option<String>,
    pub remote_app_id: Option<String>,
    pub download_url: Option<String>,
    pub remote_file_size: Option<u64>,
    pub is_matched: bool,
}

impl InstalledApp {
    pub fn unmatched(package: LocalPackage) -> Self {
        Self {
            package_name: package.package_name,
            display_name: package.display_name,
            local_version_name: package.version_name,
            local_version_code: package.version_code,
            remote_version: None,
            remote_app_id: None,
            download_url: None,
            remote_file_size: None,
            is_matched: false,
        }
    }

    pub fn has_update(&self) -> bool {
        match (&self.remote_version, &self.local_version_name) {
            (Some(remote), Some(local)) => self.is_matched && remote.trim() != local.trim(),
            (Some(_), None) => self.is_matched,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    #[serde(default, deserialize_with = "string_or_number")]
    pub app_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub app_code: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub app_name: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub latest_version: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub apk_url: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub file_size: Option<u64>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub updated_at: String,
}

impl CatalogEntry {
    /// Entries without a name, version or URL cannot be matched or downloaded.
    pub fn is_complete(&self) -> bool {
        !self.app_name.trim().is_empty()
            && !self.latest_version.trim().is_empty()
            && !self.apk_url.trim().is_empty()
    }

    pub fn updated_at_parsed(&self) -> Option<DateTime<Utc>> {
        let raw = self.updated_at.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(other @ (Value::Array(_) | Value::Object(_))) => {
            return Err(D::Error::custom(format!(
                "expected a string or number, found {other}"
            )));
        }
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_u64(),
        Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub enabled: bool,
    pub ip: String,
    pub port: u16,
    pub message: String,
}

impl ConnectionStatus {
    pub fn not_initialized() -> Self {
        Self {
            enabled: false,
            ip: String::new(),
            port: 0,
            message: "Not initialized".to_string(),
        }
    }

    pub fn address(&self) -> Option<String> {
        if self.ip.is_empty() || self.port == 0 {
            None
        } else {
            Some(format!("{}:{}", self.ip, self.port))
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::not_initialized()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSession {
    pub app: InstalledApp,
    pub progress: f32,
    pub in_progress: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub ip: String,
    pub port: u16,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub address: String,
    pub connected: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PermissionResult {
    pub serial: String,
    pub change: PermissionChange,
    pub success: bool,
    pub detail: String,
}

/// Where `install-adb` put the platform tools.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlatformToolsInstall {
    pub directory: String,
    pub adb_path: String,
    pub downloaded: bool,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArtifactListing {
    pub directory: String,
    pub artifacts: Vec<LocalArtifact>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ListenSummary {
    pub received: usize,
    pub dispatched: usize,
    pub ignored: usize,
    pub reregistered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_entry_accepts_numbers_and_strings() {
        let value = serde_json::json!({
            "app_id": 12,
            "app_code": "beat",
            "app_name": "Beat Game",
            "latest_version": "1.4.0",
            "apk_url": "https://cdn.example/beat.apk",
            "file_size": "2048",
            "updated_at": "2024-05-01 10:20:30"
        });
        let entry: CatalogEntry = serde_json::from_value(value).expect("entry");
        assert_eq!(entry.app_id, "12");
        assert_eq!(entry.file_size, Some(2048));
        assert!(entry.is_complete());
        let updated = entry.updated_at_parsed().expect("timestamp");
        assert_eq!(updated.to_rfc3339(), "2024-05-01T10:20:30+00:00");
    }

    #[test]
    fn catalog_entry_tolerates_nulls() {
        let value = serde_json::json!({
            "app_id": null,
            "app_name": "Only Name",
            "file_size": null
        });
        let entry: CatalogEntry = serde_json::from_value(value).expect("entry");
        assert_eq!(entry.app_id, "");
        assert_eq!(entry.file_size, None);
        assert!(!entry.is_complete());
        assert!(entry.updated_at_parsed().is_none());
    }

    #[test]
    fn catalog_entry_rejects_nested_values() {
        for bad in [serde_json::json!(["not", "a", "string"]), serde_json::json!({"en": "Beat"})] {
            let value = serde_json::json!({
                "app_id": 3,
                "app_name": bad,
                "latest_version": "1.0",
                "apk_url": "x"
            });
            assert!(serde_json::from_value::<CatalogEntry>(value).is_err());
        }
    }

    #[test]
    fn has_update_requires_match_and_version_difference() {
        let mut app = InstalledApp::unmatched(LocalPackage {
            package_name: "com.example.game".to_string(),
            display_name: "Game".to_string(),
            version_name: Some("1.0".to_string()),
            version_code: Some("10".to_string()),
        });
        assert!(!app.has_update());
        app.is_matched = true;
        app.remote_version = Some("1.0".to_string());
        assert!(!app.has_update());
        app.remote_version = Some("1.1".to_string());
        assert!(app.has_update());
    }

    #[test]
    fn connection_address_requires_ip_and_port() {
        let mut status = ConnectionStatus::default();
        assert_eq!(status.address(), None);
        status.ip = "192.168.1.20".to_string();
        status.port = 37_000;
        assert_eq!(status.address().as_deref(), Some("192.168.1.20:37000"));
    }
}
