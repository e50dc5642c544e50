use tracing::info;

use crate::app::adb::runner::{device_shell_args, run_adb};
use crate::app::error::AppError;
use crate::app::models::CommandResult;
use crate::app::remote_command::RemoteCommand;

pub fn build_broadcast_args(serial: &str, action: &str) -> Vec<String> {
    device_shell_args(serial, &["am", "broadcast", "-a", action])
}

/// `am broadcast` exits 0 even when nothing was delivered; it always prints this line on success.
pub fn broadcast_delivered(stdout: &str) -> bool {
    stdout.contains("Broadcast completed")
}

pub fn send_remote_command(
    adb_program: &str,
    serial: &str,
    command: RemoteCommand,
    package_id: &str,
    trace_id: &str,
) -> Result<CommandResult, AppError> {
    let action = command.action(package_id);
    let output = run_adb(adb_program, &build_broadcast_args(serial, &action), trace_id)?;
    if !output.success() || !broadcast_delivered(&output.stdout) {
        return Err(AppError::dependency(
            format!("am broadcast failed: {}", output.detail()),
            trace_id,
        ));
    }
    info!(trace_id = %trace_id, serial = %serial, action = %action, "remote command sent");
    Ok(CommandResult {
        serial: serial.to_string(),
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_am_broadcast_args() {
        let action = RemoteCommand::FindDevice.action("com.ChuJiao.quest3_wireless_adb");
        assert_eq!(
            build_broadcast_args("ABC", &action),
            vec![
                "-s",
                "ABC",
                "shell",
                "am",
                "broadcast",
                "-a",
                "com.ChuJiao.quest3_wireless_adb.FIND_DEVICE"
            ]
        );
    }

    #[test]
    fn detects_delivery() {
        assert!(broadcast_delivered(
            "Broadcasting: Intent { act=com.x.PLAY_SOUND flg=0x400000 }\nBroadcast completed: result=0\n"
        ));
        assert!(!broadcast_delivered("Error: Activity not started"));
    }
}
