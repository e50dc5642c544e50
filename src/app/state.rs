use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::apps::AdbPackageSource;
use crate::app::adb::bridge::AdbDebugBridge;
use crate::app::adb::connection::list_adb_devices;
use crate::app::adb::install::AdbInstaller;
use crate::app::adb::locator::{resolve_adb_program, validate_adb_program};
use crate::app::catalog::HttpCatalogClient;
use crate::app::config::{load_config, AppConfig};
use crate::app::download::{DownloadContext, DownloadManager, HttpArtifactSource};
use crate::app::error::AppError;
use crate::app::models::DeviceSummary;
use crate::app::platform::{DebugBridge, PackageInstaller, UnavailableBridge};
use crate::app::wireless::WirelessDebugManager;

/// Explicit serial, then the configured one, then the only online device.
pub fn pick_serial(
    explicit: Option<&str>,
    configured: &str,
    devices: &[DeviceSummary],
) -> Result<String, String> {
    if let Some(serial) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(serial.to_string());
    }
    if !configured.trim().is_empty() {
        return Ok(configured.trim().to_string());
    }
    let online: Vec<&DeviceSummary> = devices.iter().filter(|device| device.is_online()).collect();
    match online.as_slice() {
        [only] => Ok(only.serial.clone()),
        [] => Err("No online device found".to_string()),
        _ => Err(format!(
            "{} devices connected, choose one with --serial",
            online.len()
        )),
    }
}

/// Services for one session against one headset, built lazily from the config.
pub struct AppState {
    pub config: AppConfig,
    pub adb_program: String,
    serial_override: Option<String>,
    downloads: Mutex<Option<Arc<DownloadManager>>>,
    wireless: Mutex<Option<Arc<WirelessDebugManager>>>,
}

impl AppState {
    pub fn new(config: AppConfig, serial_override: Option<String>) -> Self {
        let adb_program = resolve_adb_program(&config.adb.command_path);
        Self {
            config,
            adb_program,
            serial_override,
            downloads: Mutex::new(None),
            wireless: Mutex::new(None),
        }
    }

    pub fn load(serial_override: Option<String>, trace_id: &str) -> Result<Self, AppError> {
        Ok(Self::new(load_config(trace_id)?, serial_override))
    }

    pub fn adb_program(&self, trace_id: &str) -> Result<String, AppError> {
        validate_adb_program(&self.adb_program)
            .map_err(|message| AppError::dependency(message, trace_id))?;
        Ok(self.adb_program.clone())
    }

    pub fn resolve_serial(&self, trace_id: &str) -> Result<String, AppError> {
        let explicit = self.serial_override.as_deref();
        let needs_listing = explicit.map(|value| value.trim().is_empty()).unwrap_or(true)
            && self.config.adb.device_serial.trim().is_empty();
        let devices = if needs_listing {
            list_adb_devices(&self.adb_program(trace_id)?, trace_id)?
        } else {
            Vec::new()
        };
        pick_serial(explicit, &self.config.adb.device_serial, &devices)
            .map_err(|message| AppError::validation(message, trace_id))
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.adb.command_timeout_secs)
    }

    pub fn package_source(&self, serial: &str, trace_id: &str) -> AdbPackageSource {
        AdbPackageSource {
            adb_program: self.adb_program.clone(),
            serial: serial.to_string(),
            excluded_prefixes: self.config.packages.excluded_prefixes.clone(),
            display_names: self.config.packages.display_names.clone(),
            trace_id: trace_id.to_string(),
        }
    }

    pub fn catalog(&self, trace_id: &str) -> HttpCatalogClient {
        HttpCatalogClient::new(&self.config.catalog, trace_id)
    }

    pub fn installer(&self, serial: &str, trace_id: &str) -> AdbInstaller {
        AdbInstaller {
            adb_program: self.adb_program.clone(),
            serial: serial.to_string(),
            replace_existing: self.config.install.replace_existing,
            timeout: Duration::from_secs(self.config.install.timeout_secs),
            trace_id: trace_id.to_string(),
        }
    }

    /// Falls back to [`UnavailableBridge`] when no device can be reached.
    pub fn debug_bridge(&self, trace_id: &str) -> Arc<dyn DebugBridge> {
        let resolved = self
            .adb_program(trace_id)
            .and_then(|program| self.resolve_serial(trace_id).map(|serial| (program, serial)));
        match resolved {
            Ok((adb_program, serial)) => Arc::new(AdbDebugBridge {
                adb_program,
                serial,
                package_id: self.config.remote_command.package_id.clone(),
                command_timeout: self.command_timeout(),
                port_lookup_timeout: Duration::from_millis(self.config.discovery.port_lookup_timeout_ms),
                trace_id: trace_id.to_string(),
            }),
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "wireless bridge unavailable");
                Arc::new(UnavailableBridge::new(err.error))
            }
        }
    }

    pub fn wireless(&self, trace_id: &str) -> Result<Arc<WirelessDebugManager>, AppError> {
        let mut slot = self
            .wireless
            .lock()
            .map_err(|_| AppError::system("Wireless state lock poisoned", trace_id))?;
        if let Some(manager) = slot.as_ref() {
            return Ok(Arc::clone(manager));
        }
        let manager = Arc::new(WirelessDebugManager::new(
            self.debug_bridge(trace_id),
            Duration::from_millis(self.config.status.enable_recheck_ms),
            trace_id,
        ));
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// Installs go to the session's device; without one, artifacts are only downloaded.
    pub fn downloads(&self, trace_id: &str) -> Result<Arc<DownloadManager>, AppError> {
        let mut slot = self
            .downloads
            .lock()
            .map_err(|_| AppError::system("Download state lock poisoned", trace_id))?;
        if let Some(manager) = slot.as_ref() {
            return Ok(Arc::clone(manager));
        }
        let installer: Option<Arc<dyn PackageInstaller>> = match self.resolve_serial(trace_id) {
            Ok(serial) => Some(Arc::new(self.installer(&serial, trace_id))),
            Err(err) => {
                info!(trace_id = %trace_id, error = %err, "no install target, download only");
                None
            }
        };
        let source = Arc::new(HttpArtifactSource::new(
            &self.config.download,
            &self.config.catalog.user_agent,
        ));
        let manager = Arc::new(DownloadManager::new(DownloadContext::from_config(
            &self.config,
            source,
            installer,
        )));
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(serial: &str, state: &str) -> DeviceSummary {
        DeviceSummary {
            serial: serial.to_string(),
            state: state.to_string(),
            model: None,
            product: None,
            device: None,
            transport_id: None,
        }
    }

    #[test]
    fn pick_serial_prefers_explicit_then_config() {
        let devices = vec![device("A", "device"), device("B", "device")];
        assert_eq!(pick_serial(Some(" X "), "CFG", &devices), Ok("X".to_string()));
        assert_eq!(pick_serial(Some(""), "CFG", &devices), Ok("CFG".to_string()));
    }

    #[test]
    fn pick_serial_uses_only_online_device() {
        let devices = vec![device("A", "unauthorized"), device("B", "device")];
        assert_eq!(pick_serial(None, "", &devices), Ok("B".to_string()));
        assert!(pick_serial(None, "", &[device("A", "offline")])
            .expect_err("none online")
            .contains("No online device"));
        let many = vec![device("A", "device"), device("B", "device")];
        assert!(pick_serial(None, "", &many)
            .expect_err("ambiguous")
            .contains("--serial"));
    }

    #[test]
    fn bridge_falls_back_when_adb_missing() {
        let mut config = AppConfig::default();
        config.adb.command_path = "/definitely/not/a/real/adb".to_string();
        let state = AppState::new(config, None);
        let bridge = state.debug_bridge("trace-state");
        assert!(!bridge.is_available());
        let manager = state.wireless("trace-state").expect("manager");
        assert!(Arc::ptr_eq(&manager, &state.wireless("trace-state").expect("again")));
    }
}
