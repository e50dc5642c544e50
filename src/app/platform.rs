//! Seams to the headset. Each trait covers one platform capability; the adb-backed
//! implementations live under `app::adb`, tests provide their own fakes.

use std::path::Path;

use crate::app::error::AppError;
use crate::app::models::{ConnectionStatus, LocalPackage};

/// Wireless-debugging switch of one device.
pub trait DebugBridge: Send + Sync {
    /// False when the bridge could not be initialized; every other call then fails.
    fn is_available(&self) -> bool {
        true
    }

    fn has_permission(&self) -> bool;

    /// Command the user has to run once to grant the missing permission.
    fn permission_command(&self) -> String;

    fn enable(&self) -> Result<(), AppError>;

    fn disable(&self) -> Result<(), AppError>;

    fn query_status(&self) -> Result<ConnectionStatus, AppError>;
}

pub trait PackageSource: Send + Sync {
    /// Third-party packages only, system-prefix exclusions already applied.
    fn installed_packages(&self) -> Result<Vec<LocalPackage>, AppError>;
}

pub trait PackageInstaller: Send + Sync {
    /// Returns the installer's own success message.
    fn install(&self, apk_path: &Path) -> Result<String, AppError>;
}

/// Bridge used when no device can be reached; reports the feature set as disabled.
pub struct UnavailableBridge {
    reason: String,
}

impl UnavailableBridge {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl DebugBridge for UnavailableBridge {
    fn is_available(&self) -> bool {
        false
    }

    fn has_permission(&self) -> bool {
        false
    }

    fn permission_command(&self) -> String {
        String::new()
    }

    fn enable(&self) -> Result<(), AppError> {
        Err(AppError::dependency(
            format!("Wireless debugging unavailable: {}", self.reason),
            "",
        ))
    }

    fn disable(&self) -> Result<(), AppError> {
        self.enable()
    }

    fn query_status(&self) -> Result<ConnectionStatus, AppError> {
        Ok(ConnectionStatus {
            enabled: false,
            ip: String::new(),
            port: 0,
            message: format!("Initialization failed: {}", self.reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_bridge_reports_disabled_state() {
        let bridge = UnavailableBridge::new("adb not found");
        assert!(!bridge.is_available());
        assert!(!bridge.has_permission());
        let err = bridge.enable().expect_err("enable must fail");
        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert!(err.error.contains("adb not found"));
        let status = bridge.query_status().expect("status");
        assert!(!status.enabled);
        assert!(status.message.contains("adb not found"));
    }
}
