use std::path::{Path, PathBuf};

#[cfg(windows)]
pub const ADB_EXE_NAME: &str = "adb.exe";

#[cfg(not(windows))]
pub const ADB_EXE_NAME: &str = "adb";

pub const PLATFORM_TOOLS_DIR: &str = "platform-tools";

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Configured path first, then `PATH`, then a `platform-tools` folder under `base_dir`.
pub fn resolve_adb_program_in(config_command_path: &str, base_dir: &Path) -> String {
    let normalized = normalize_command_path(config_command_path);
    if !normalized.is_empty() {
        return normalized;
    }
    if find_on_path(ADB_EXE_NAME).is_some() {
        return "adb".to_string();
    }
    let bundled = bundled_adb_path(base_dir);
    if bundled.is_file() {
        return bundled.to_string_lossy().to_string();
    }
    "adb".to_string()
}

pub fn bundled_adb_path(base_dir: &Path) -> PathBuf {
    base_dir.join(PLATFORM_TOOLS_DIR).join(ADB_EXE_NAME)
}

pub fn resolve_adb_program(config_command_path: &str) -> String {
    let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    resolve_adb_program_in(config_command_path, &base_dir)
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the configured path".to_string());
    }
    Ok(())
}
