//! Fetch Google's platform-tools archive so a machine without an SDK still gets an adb.

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek};
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::locator::{bundled_adb_path, PLATFORM_TOOLS_DIR};
use crate::app::config::{AdbSettings, DownloadSettings};
use crate::app::error::AppError;
use crate::app::models::PlatformToolsInstall;

const PLATFORM_TOOLS_BASE_URL: &str = "https://dl.google.com/android/repository";
const MAX_ARCHIVE_BYTES: u64 = 512 * 1024 * 1024;

fn host_platform() -> &'static str {
    if cfg!(windows) {
        "windows"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    }
}

pub fn platform_tools_url(settings: &AdbSettings) -> String {
    let configured = settings.platform_tools_url.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    format!(
        "{PLATFORM_TOOLS_BASE_URL}/platform-tools-latest-{}.zip",
        host_platform()
    )
}

/// Unpacks every entry under `dest`, skipping names that would escape it.
/// Returns the number of files written.
pub fn extract_platform_tools<R: Read + Seek>(
    reader: R,
    dest: &Path,
    trace_id: &str,
) -> Result<usize, AppError> {
    let mut archive = zip::ZipArchive::new(reader).map_err(|err| {
        AppError::system(format!("Platform tools archive is corrupt: {err}"), trace_id)
    })?;
    let mut written = 0usize;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|err| {
            AppError::system(format!("Failed to read archive entry: {err}"), trace_id)
        })?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(trace_id = %trace_id, name = %entry.name(), "skipping unsafe archive entry");
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| extract_error(&target, err, trace_id))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| extract_error(parent, err, trace_id))?;
        }
        let mut out = File::create(&target).map_err(|err| extract_error(&target, err, trace_id))?;
        io::copy(&mut entry, &mut out).map_err(|err| extract_error(&target, err, trace_id))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))
                    .map_err(|err| extract_error(&target, err, trace_id))?;
            }
        }
        written += 1;
    }
    Ok(written)
}

fn extract_error(path: &Path, err: io::Error, trace_id: &str) -> AppError {
    AppError::system(format!("Failed to extract {}: {err}", path.display()), trace_id)
}

/// Downloads `url` and unpacks it into `base_dir`; the archive must carry `platform-tools/adb`.
pub fn download_platform_tools(
    url: &str,
    download: &DownloadSettings,
    user_agent: &str,
    base_dir: &Path,
    trace_id: &str,
) -> Result<PlatformToolsInstall, AppError> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(download.connect_timeout_secs))
        .timeout_read(Duration::from_secs(download.stall_timeout_secs))
        .user_agent(user_agent)
        .build();
    info!(trace_id = %trace_id, url = %url, "downloading platform tools");
    let response = agent.get(url).call().map_err(|err| match err {
        ureq::Error::Status(code, _) => AppError::network(
            format!("Platform tools download returned HTTP {code}"),
            trace_id,
        ),
        ureq::Error::Transport(transport) => AppError::network(
            format!("Platform tools download failed: {transport}"),
            trace_id,
        ),
    })?;
    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_ARCHIVE_BYTES)
        .read_to_end(&mut body)
        .map_err(|err| {
            AppError::network(format!("Platform tools download interrupted: {err}"), trace_id)
        })?;

    fs::create_dir_all(base_dir).map_err(|err| extract_error(base_dir, err, trace_id))?;
    let files = extract_platform_tools(Cursor::new(body), base_dir, trace_id)?;
    let adb_path = bundled_adb_path(base_dir);
    if !adb_path.is_file() {
        return Err(AppError::dependency(
            format!("Archive from {url} does not contain {}", adb_path.display()),
            trace_id,
        ));
    }
    info!(trace_id = %trace_id, path = %adb_path.display(), files, "platform tools installed");
    Ok(PlatformToolsInstall {
        directory: base_dir.join(PLATFORM_TOOLS_DIR).to_string_lossy().to_string(),
        adb_path: adb_path.to_string_lossy().to_string(),
        downloaded: true,
        files,
    })
}
