use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::adb::parse::{parse_adb_devices, parse_inet_address, parse_port, parse_settings_bool};
use crate::app::adb::runner::{device_shell_args, run_command_with_timeout, CommandOutput};
use crate::app::discovery::find_service_port;
use crate::app::error::AppError;
use crate::app::models::ConnectionStatus;
use crate::app::platform::DebugBridge;

const ADB_WIFI_SETTING: &str = "adb_wifi_enabled";

pub fn permission_grant_command(package_id: &str) -> String {
    format!("adb shell pm grant {package_id} android.permission.WRITE_SECURE_SETTINGS")
}

pub fn status_message(enabled: bool, address: Option<&str>) -> String {
    match (enabled, address) {
        (false, _) => "Wireless ADB disabled".to_string(),
        (true, Some(address)) => format!("Wireless ADB running: {address}"),
        (true, None) => "Wireless ADB enabled, service not discovered yet".to_string(),
    }
}

/// Drives the wireless-debugging switch of one headset through `adb shell`.
pub struct AdbDebugBridge {
    pub adb_program: String,
    pub serial: String,
    pub package_id: String,
    pub command_timeout: Duration,
    pub port_lookup_timeout: Duration,
    pub trace_id: String,
}

impl AdbDebugBridge {
    fn shell(&self, shell_args: &[&str]) -> Result<CommandOutput, AppError> {
        let args = device_shell_args(&self.serial, shell_args);
        run_command_with_timeout(&self.adb_program, &args, self.command_timeout, &self.trace_id)
    }

    fn device_state(&self) -> Option<String> {
        let args = vec!["devices".to_string(), "-l".to_string()];
        let output =
            run_command_with_timeout(&self.adb_program, &args, self.command_timeout, &self.trace_id)
                .ok()?;
        parse_adb_devices(&output.stdout)
            .into_iter()
            .find(|device| device.serial == self.serial)
            .map(|device| device.state)
    }

    fn write_setting(&self, value: &str) -> Result<(), AppError> {
        if !self.has_permission() {
            return Err(AppError::permission(
                format!(
                    "Device {} is not authorized. Accept the debugging prompt or run: {}",
                    self.serial,
                    self.permission_command()
                ),
                &self.trace_id,
            ));
        }
        let output = self.shell(&["settings", "put", "global", ADB_WIFI_SETTING, value])?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("settings put failed: {}", output.detail()),
                &self.trace_id,
            ));
        }
        info!(
            trace_id = %self.trace_id,
            serial = %self.serial,
            value = %value,
            "wrote adb_wifi_enabled"
        );
        Ok(())
    }

    fn read_ip(&self) -> String {
        match self.shell(&["ip", "-f", "inet", "addr", "show", "wlan0"]) {
            Ok(output) => parse_inet_address(&output.stdout).unwrap_or_default(),
            Err(err) => {
                warn!(trace_id = %self.trace_id, error = %err, "failed to read wlan0 address");
                String::new()
            }
        }
    }

    fn read_port(&self, ip: &str) -> u16 {
        let published = self
            .shell(&["getprop", "service.adb.tls.port"])
            .ok()
            .and_then(|output| parse_port(&output.stdout));
        if let Some(port) = published {
            return port;
        }
        if ip.is_empty() {
            return 0;
        }
        debug!(trace_id = %self.trace_id, ip = %ip, "tls port not published, asking mDNS");
        find_service_port(ip, self.port_lookup_timeout, &self.trace_id).unwrap_or(0)
    }
}

impl DebugBridge for AdbDebugBridge {
    fn has_permission(&self) -> bool {
        self.device_state().as_deref() == Some("device")
    }

    fn permission_command(&self) -> String {
        permission_grant_command(&self.package_id)
    }

    fn enable(&self) -> Result<(), AppError> {
        self.write_setting("1")
    }

    fn disable(&self) -> Result<(), AppError> {
        self.write_setting("0")
    }

    fn query_status(&self) -> Result<ConnectionStatus, AppError> {
        let output = self.shell(&["settings", "get", "global", ADB_WIFI_SETTING])?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("settings get failed: {}", output.detail()),
                &self.trace_id,
            ));
        }
        let enabled = parse_settings_bool(&output.stdout).unwrap_or(false);
        if !enabled {
            return Ok(ConnectionStatus {
                enabled,
                ip: String::new(),
                port: 0,
                message: status_message(false, None),
            });
        }
        let ip = self.read_ip();
        let port = self.read_port(&ip);
        let mut status = ConnectionStatus {
            enabled,
            ip,
            port,
            message: String::new(),
        };
        status.message = status_message(true, status.address().as_deref());
        Ok(status)
    }
}
