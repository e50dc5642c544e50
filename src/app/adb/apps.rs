use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::runner::{device_shell_args, run_command_with_timeout};
use crate::app::error::AppError;
use crate::app::models::LocalPackage;
use crate::app::platform::PackageSource;

/// Package ids from `pm list packages`, one `package:<id>` line each.
pub fn parse_pm_list_packages_output(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("package:"))
        .map(str::trim)
        .filter(|pkg| !pkg.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_dumpsys_version_name(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("versionName=") {
            return Some(value.trim_matches(['\"', '\'']).to_string());
        }
        if let Some((_, tail)) = trimmed.split_once("versionName=") {
            return Some(tail.trim_matches(['\"', '\'']).to_string());
        }
    }
    None
}

pub fn parse_dumpsys_version_code(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("versionCode=") {
            return Some(value.split_whitespace().next().unwrap_or(value).to_string());
        }
        if let Some((_, tail)) = trimmed.split_once("versionCode=") {
            return Some(tail.split_whitespace().next().unwrap_or(tail).to_string());
        }
    }
    None
}

pub fn is_excluded_package(package_name: &str, excluded_prefixes: &[String]) -> bool {
    let lower = package_name.to_lowercase();
    excluded_prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && lower.starts_with(&prefix.to_lowercase()))
}

/// `pm` exposes no app labels, so the catalog only matches packages listed in
/// `packages.display_names`; anything else is shown under its package id.
pub fn display_name_for(package_name: &str, display_names: &HashMap<String, String>) -> String {
    display_names
        .get(package_name)
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(package_name)
        .to_string()
}

/// Lists third-party packages of one device through `pm` and `dumpsys`.
pub struct AdbPackageSource {
    pub adb_program: String,
    pub serial: String,
    pub excluded_prefixes: Vec<String>,
    pub display_names: HashMap<String, String>,
    pub trace_id: String,
}

impl AdbPackageSource {
    fn read_versions(&self, package_name: &str) -> (Option<String>, Option<String>) {
        let args = device_shell_args(&self.serial, &["dumpsys", "package", package_name]);
        match run_command_with_timeout(
            &self.adb_program,
            &args,
            Duration::from_secs(10),
            &self.trace_id,
        ) {
            Ok(out) => (
                parse_dumpsys_version_name(&out.stdout),
                parse_dumpsys_version_code(&out.stdout),
            ),
            Err(err) => {
                warn!(
                    trace_id = %self.trace_id,
                    package_name = %package_name,
                    error = %err,
                    "dumpsys package failed while listing apps"
                );
                (None, None)
            }
        }
    }
}

impl PackageSource for AdbPackageSource {
    fn installed_packages(&self) -> Result<Vec<LocalPackage>, AppError> {
        let args = device_shell_args(&self.serial, &["pm", "list", "packages", "-3"]);
        let output = run_command_with_timeout(
            &self.adb_program,
            &args,
            Duration::from_secs(30),
            &self.trace_id,
        )?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("List apps failed: {}", output.detail()),
                &self.trace_id,
            ));
        }

        let package_names = parse_pm_list_packages_output(&output.stdout);
        let total = package_names.len();
        let mut packages = Vec::new();
        for package_name in package_names {
            if is_excluded_package(&package_name, &self.excluded_prefixes) {
                continue;
            }
            let (version_name, version_code) = self.read_versions(&package_name);
            packages.push(LocalPackage {
                display_name: display_name_for(&package_name, &self.display_names),
                package_name,
                version_name,
                version_code,
            });
        }
        info!(
            trace_id = %self.trace_id,
            serial = %self.serial,
            listed = total,
            kept = packages.len(),
            "enumerated third-party packages"
        );
        Ok(packages)
    }
}
