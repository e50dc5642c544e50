use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::runner::run_command_with_timeout;
use crate::app::error::AppError;
use crate::app::platform::PackageInstaller;

pub struct AdbInstaller {
    pub adb_program: String,
    pub serial: String,
    pub replace_existing: bool,
    pub timeout: Duration,
    pub trace_id: String,
}

pub fn build_install_args(serial: &str, apk_path: &Path, replace_existing: bool) -> Vec<String> {
    let mut args = vec!["-s".to_string(), serial.to_string(), "install".to_string()];
    if replace_existing {
        args.push("-r".to_string());
    }
    args.push(apk_path.to_string_lossy().to_string());
    args
}

/// `adb install` can exit 0 and still print `Failure [...]`.
pub fn install_succeeded(exit_code: Option<i32>, stdout: &str) -> bool {
    exit_code == Some(0) && stdout.contains("Success")
}

impl PackageInstaller for AdbInstaller {
    fn install(&self, apk_path: &Path) -> Result<String, AppError> {
        if self.serial.trim().is_empty() {
            return Err(AppError::validation("serial is required", &self.trace_id));
        }
        let args = build_install_args(&self.serial, apk_path, self.replace_existing);
        let output = run_command_with_timeout(&self.adb_program, &args, self.timeout, &self.trace_id)?;
        if install_succeeded(output.exit_code, &output.stdout) {
            info!(
                trace_id = %self.trace_id,
                serial = %self.serial,
                apk = %apk_path.display(),
                "apk installed"
            );
            return Ok(format!("Installed {}", apk_path.display()));
        }
        warn!(
            trace_id = %self.trace_id,
            serial = %self.serial,
            apk = %apk_path.display(),
            detail = %output.detail(),
            "apk install failed"
        );
        Err(AppError::dependency(
            format!("adb install failed: {}", output.detail()),
            &self.trace_id,
        ))
    }
}
