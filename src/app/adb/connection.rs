use std::time::Duration;

use serde::Serialize;

use tracing::{info, warn};

use crate::app::adb::parse::{connect_succeeded, parse_adb_devices};
use crate::app::adb::runner::{device_shell_args, run_adb, run_command_with_timeout, CommandOutput};
use crate::app::error::AppError;
use crate::app::models::{CommandResult, DeviceSummary, HostCommandResult};

pub const SECURE_SETTINGS_PERMISSION: &str = "android.permission.WRITE_SECURE_SETTINGS";

fn host_result(output: CommandOutput) -> HostCommandResult {
    HostCommandResult {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_code,
    }
}

pub fn list_adb_devices(adb_program: &str, trace_id: &str) -> Result<Vec<DeviceSummary>, AppError> {
    let args = vec!["devices".to_string(), "-l".to_string()];
    let output = run_adb(adb_program, &args, trace_id)?;
    if !output.success() {
        return Err(AppError::dependency(
            format!("adb devices failed: {}", output.detail()),
            trace_id,
        ));
    }
    Ok(parse_adb_devices(&output.stdout))
}

pub fn connect_address(
    adb_program: &str,
    address: &str,
    trace_id: &str,
) -> Result<HostCommandResult, AppError> {
    let args = vec!["connect".to_string(), address.to_string()];
    let output = run_command_with_timeout(adb_program, &args, Duration::from_secs(10), trace_id)?;
    if !output.success() || !connect_succeeded(&output.stdout, &output.stderr) {
        warn!(trace_id = %trace_id, address = %address, detail = %output.detail(), "adb connect failed");
        return Err(AppError::dependency(
            format!("adb connect failed: {}", output.detail()),
            trace_id,
        ));
    }
    info!(trace_id = %trace_id, address = %address, "adb connected");
    Ok(host_result(output))
}

/// `None` disconnects every wireless transport.
pub fn disconnect_address(
    adb_program: &str,
    address: Option<&str>,
    trace_id: &str,
) -> Result<HostCommandResult, AppError> {
    let mut args = vec!["disconnect".to_string()];
    if let Some(address) = address {
        args.push(address.to_string());
    }
    let output = run_adb(adb_program, &args, trace_id)?;
    if !output.success() {
        return Err(AppError::dependency(
            format!("adb disconnect failed: {}", output.detail()),
            trace_id,
        ));
    }
    info!(trace_id = %trace_id, address = ?address, "adb disconnected");
    Ok(host_result(output))
}

/// `pm grant` or `pm revoke` of [`SECURE_SETTINGS_PERMISSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionChange {
    Grant,
    Revoke,
}

impl PermissionChange {
    pub fn verb(self) -> &'static str {
        match self {
            PermissionChange::Grant => "grant",
            PermissionChange::Revoke => "revoke",
        }
    }
}

pub fn build_permission_args(serial: &str, package_id: &str, change: PermissionChange) -> Vec<String> {
    device_shell_args(
        serial,
        &["pm", change.verb(), package_id, SECURE_SETTINGS_PERMISSION],
    )
}

pub fn build_grant_args(serial: &str, package_id: &str) -> Vec<String> {
    build_permission_args(serial, package_id, PermissionChange::Grant)
}

pub fn build_revoke_args(serial: &str, package_id: &str) -> Vec<String> {
    build_permission_args(serial, package_id, PermissionChange::Revoke)
}

/// Lets the on-headset companion flip `adb_wifi_enabled` itself, or takes that right back.
fn change_secure_settings(
    adb_program: &str,
    serial: &str,
    package_id: &str,
    change: PermissionChange,
    trace_id: &str,
) -> Result<CommandResult, AppError> {
    let args = build_permission_args(serial, package_id, change);
    let output = run_adb(adb_program, &args, trace_id)?;
    // `pm grant` and `pm revoke` print nothing on success.
    if !output.success() || !output.detail().is_empty() {
        return Err(AppError::dependency(
            format!("pm {} failed on {serial}: {}", change.verb(), output.detail()),
            trace_id,
        ));
    }
    info!(
        trace_id = %trace_id,
        serial = %serial,
        package_id = %package_id,
        change = change.verb(),
        "secure settings permission changed"
    );
    Ok(CommandResult {
        serial: serial.to_string(),
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_code,
    })
}

pub fn grant_secure_settings(
    adb_program: &str,
    serial: &str,
    package_id: &str,
    trace_id: &str,
) -> Result<CommandResult, AppError> {
    change_secure_settings(adb_program, serial, package_id, PermissionChange::Grant, trace_id)
}

pub fn revoke_secure_settings(
    adb_program: &str,
    serial: &str,
    package_id: &str,
    trace_id: &str,
) -> Result<CommandResult, AppError> {
    change_secure_settings(adb_program, serial, package_id, PermissionChange::Revoke, trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_grant_args() {
        assert_eq!(
            build_grant_args("1WMHH0", "com.ChuJiao.quest3_wireless_adb"),
            vec![
                "-s",
                "1WMHH0",
                "shell",
                "pm",
                "grant",
                "com.ChuJiao.quest3_wireless_adb",
                "android.permission.WRITE_SECURE_SETTINGS"
            ]
        );
    }

    #[test]
    fn builds_revoke_args() {
        assert_eq!(
            build_revoke_args("192.168.1.20:37000", "com.ChuJiao.quest3_wireless_adb"),
            vec![
                "-s",
                "192.168.1.20:37000",
                "shell",
                "pm",
                "revoke",
                "com.ChuJiao.quest3_wireless_adb",
                "android.permission.WRITE_SECURE_SETTINGS"
            ]
        );
    }

    #[test]
    fn revoke_without_adb_names_the_change() {
        let err = revoke_secure_settings("/definitely/not/a/real/adb", "ABC", "com.x", "trace-revoke")
            .expect_err("spawn");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert_eq!(err.trace_id, "trace-revoke");
    }

    #[test]
    fn missing_adb_surfaces_dependency_error() {
        let err = list_adb_devices("/definitely/not/a/real/adb", "trace-devices").expect_err("spawn");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        let err = connect_address("/definitely/not/a/real/adb", "10.0.0.2:5555", "trace-connect")
            .expect_err("spawn");
        assert_eq!(err.trace_id, "trace-connect");
    }
}
