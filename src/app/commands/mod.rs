use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::adb::apk::list_local_artifacts;
use crate::app::adb::broadcast::send_remote_command;
use crate::app::adb::connection::{
    connect_address, disconnect_address, grant_secure_settings, list_adb_devices,
    revoke_secure_settings, PermissionChange,
};
use crate::app::adb::locator::{
    bundled_adb_path, normalize_command_path, validate_adb_program, PLATFORM_TOOLS_DIR,
};
use crate::app::adb::parse::parse_adb_version;
use crate::app::adb::platform_tools::{download_platform_tools, platform_tools_url};
use crate::app::adb::runner::run_command_with_timeout;
use crate::app::catalog::CatalogSource;
use crate::app::config::{config_path, devices_path, load_config, save_config, validate_config, AppConfig};
use crate::app::discovery::{discover_adb_services, load_devices, save_devices};
use crate::app::download::{
    resolve_download_dir, run_download, DownloadContext, DownloadEmitter, DownloadEvent,
    DownloadOutcome, DownloadRequest, HttpArtifactSource,
};
use crate::app::error::AppError;
use crate::app::matching::{find_app, refresh_installed_apps};
use crate::app::models::{
    AdbInfo, ArtifactListing, CommandResponse, CommandResult, ConnectAttempt, ConnectionStatus,
    DeviceSummary, DiscoveredDevice, HostCommandResult, InstalledApp, ListenSummary,
    PermissionResult, PlatformToolsInstall,
};
use crate::app::platform::PackageInstaller;
use crate::app::remote_command::{
    BroadcastBus, CommandDispatcher, CommandListener, FeedbackHandler, RemoteCommand,
};
use crate::app::state::AppState;
use crate::app::wireless::StatusObserver;

pub fn resolve_trace_id(input: Option<String>) -> String {
    input
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn ensure_non_empty(value: &str, field: &str, trace_id: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(
            format!("{field} is required"),
            trace_id,
        ));
    }
    Ok(())
}

pub fn get_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = load_config(&trace_id)?;
    Ok(CommandResponse {
        trace_id,
        data: config,
    })
}

pub fn reset_config(trace_id: Option<String>) -> Result<CommandResponse<AppConfig>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let config = validate_config(AppConfig::default());
    save_config(&config, &trace_id)?;
    info!(trace_id = %trace_id, path = %config_path().display(), "config reset");
    Ok(CommandResponse {
        trace_id,
        data: config,
    })
}

pub fn get_config_path(trace_id: Option<String>) -> CommandResponse<String> {
    CommandResponse {
        trace_id: resolve_trace_id(trace_id),
        data: config_path().to_string_lossy().to_string(),
    }
}

pub fn check_adb(
    state: &AppState,
    command_path: Option<String>,
    trace_id: Option<String>,
) -> Result<CommandResponse<AdbInfo>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    info!(trace_id = %trace_id, "check_adb");

    let program = command_path
        .as_deref()
        .map(normalize_command_path)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| state.adb_program.clone());
    let unavailable = |program: String, error: String| AdbInfo {
        available: false,
        version: None,
        version_output: String::new(),
        command_path: program,
        error: Some(error),
    };

    if let Err(message) = validate_adb_program(&program) {
        warn!(trace_id = %trace_id, error = %message, "adb validation failed");
        return Ok(CommandResponse {
            trace_id,
            data: unavailable(program, message),
        });
    }

    let args = vec!["version".to_string()];
    let output = match run_command_with_timeout(&program, &args, Duration::from_secs(5), &trace_id) {
        Ok(output) => output,
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err.error, "adb check failed");
            return Ok(CommandResponse {
                trace_id,
                data: unavailable(program, err.error),
            });
        }
    };

    let available = output.success();
    let info = AdbInfo {
        available,
        version: parse_adb_version(&output.stdout),
        version_output: output.stdout.trim().to_string(),
        error: if available {
            None
        } else if output.detail().is_empty() {
            Some("ADB command returned a non-zero exit code".to_string())
        } else {
            Some(output.detail().to_string())
        },
        command_path: program,
    };
    Ok(CommandResponse { trace_id, data: info })
}

pub fn list_devices(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<DeviceSummary>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let adb_program = state.adb_program(&trace_id)?;
    let devices = list_adb_devices(&adb_program, &trace_id)?
        .into_iter()
        .filter(DeviceSummary::is_online)
        .collect();
    Ok(CommandResponse {
        trace_id,
        data: devices,
    })
}

/// Browses mDNS and replaces the saved device list with what was found.
pub fn scan_devices(
    state: &AppState,
    duration_secs: Option<u64>,
    on_found: impl FnMut(&DiscoveredDevice),
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<DiscoveredDevice>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let duration = Duration::from_secs(
        duration_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(state.config.discovery.scan_secs),
    );
    info!(trace_id = %trace_id, secs = duration.as_secs(), "scanning for wireless adb services");
    let devices = discover_adb_services(duration, None, on_found, &trace_id)?;
    save_devices(&devices_path(&state.config), &devices, &trace_id)?;
    info!(trace_id = %trace_id, found = devices.len(), "scan finished");
    Ok(CommandResponse {
        trace_id,
        data: devices,
    })
}

pub fn saved_devices(state: &AppState, trace_id: Option<String>) -> CommandResponse<Vec<DiscoveredDevice>> {
    CommandResponse {
        trace_id: resolve_trace_id(trace_id),
        data: load_devices(&devices_path(&state.config)),
    }
}

pub fn adb_connect(
    state: &AppState,
    address: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<HostCommandResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&address, "address", &trace_id)?;
    let adb_program = state.adb_program(&trace_id)?;
    let result = connect_address(&adb_program, address.trim(), &trace_id)?;
    Ok(CommandResponse {
        trace_id,
        data: result,
    })
}

pub fn adb_disconnect(
    state: &AppState,
    address: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<HostCommandResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&address, "address", &trace_id)?;
    let adb_program = state.adb_program(&trace_id)?;
    let result = disconnect_address(&adb_program, Some(address.trim()), &trace_id)?;
    Ok(CommandResponse {
        trace_id,
        data: result,
    })
}

/// One attempt per saved device; a failure never stops the rest.
pub fn connect_saved_devices(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<ConnectAttempt>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let adb_program = state.adb_program(&trace_id)?;
    let saved = load_devices(&devices_path(&state.config));
    if saved.is_empty() {
        return Err(AppError::validation(
            "No saved devices, run a scan first",
            &trace_id,
        ));
    }
    let attempts = saved
        .into_iter()
        .map(|device| match connect_address(&adb_program, &device.address, &trace_id) {
            Ok(result) => ConnectAttempt {
                address: device.address,
                connected: true,
                detail: result.stdout.trim().to_string(),
            },
            Err(err) => ConnectAttempt {
                address: device.address,
                connected: false,
                detail: err.error,
            },
        })
        .collect();
    Ok(CommandResponse {
        trace_id,
        data: attempts,
    })
}

pub fn disconnect_all(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<HostCommandResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let adb_program = state.adb_program(&trace_id)?;
    let result = disconnect_address(&adb_program, None, &trace_id)?;
    Ok(CommandResponse {
        trace_id,
        data: result,
    })
}

/// Which devices a permission change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionTargets {
    /// `--serial`, the configured serial, or the only online device.
    Selected,
    Usb,
    All,
}

/// Serials for the list-based targets; `Selected` is resolved through the session instead.
pub fn select_permission_targets(devices: &[DeviceSummary], targets: PermissionTargets) -> Vec<String> {
    devices
        .iter()
        .filter(|device| device.is_online())
        .filter(|device| match targets {
            PermissionTargets::Usb => device.is_usb(),
            PermissionTargets::All | PermissionTargets::Selected => true,
        })
        .map(|device| device.serial.clone())
        .collect()
}

fn change_permission(
    state: &AppState,
    change: PermissionChange,
    targets: PermissionTargets,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<PermissionResult>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let adb_program = state.adb_program(&trace_id)?;
    let serials = match targets {
        PermissionTargets::Selected => vec![state.resolve_serial(&trace_id)?],
        PermissionTargets::Usb | PermissionTargets::All => {
            let devices = list_adb_devices(&adb_program, &trace_id)?;
            select_permission_targets(&devices, targets)
        }
    };
    if serials.is_empty() {
        let message = if targets == PermissionTargets::Usb {
            "No USB device connected"
        } else {
            "No online device found"
        };
        return Err(AppError::validation(message, &trace_id));
    }

    let package_id = &state.config.remote_command.package_id;
    let apply = match change {
        PermissionChange::Grant => grant_secure_settings,
        PermissionChange::Revoke => revoke_secure_settings,
    };
    let results = serials
        .into_iter()
        .map(|serial| {
            match apply(&adb_program, &serial, package_id, &trace_id) {
                Ok(_) => PermissionResult {
                    serial,
                    change,
                    success: true,
                    detail: match change {
                        PermissionChange::Grant => "Permission granted".to_string(),
                        PermissionChange::Revoke => "Permission revoked".to_string(),
                    },
                },
                Err(err) => PermissionResult {
                    serial,
                    change,
                    success: false,
                    detail: err.error,
                },
            }
        })
        .collect();
    Ok(CommandResponse {
        trace_id,
        data: results,
    })
}

/// Lets the companion app toggle wireless debugging without a host attached.
pub fn grant_permission(
    state: &AppState,
    targets: PermissionTargets,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<PermissionResult>>, AppError> {
    change_permission(state, PermissionChange::Grant, targets, trace_id)
}

pub fn revoke_permission(
    state: &AppState,
    targets: PermissionTargets,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<PermissionResult>>, AppError> {
    change_permission(state, PermissionChange::Revoke, targets, trace_id)
}

/// Fetches platform-tools into `directory` (default: the working directory, where the
/// adb lookup searches) unless an adb binary is already there.
pub fn install_adb(
    state: &AppState,
    directory: Option<String>,
    force: bool,
    trace_id: Option<String>,
) -> Result<CommandResponse<PlatformToolsInstall>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let base_dir = match directory.as_deref().map(str::trim).filter(|dir| !dir.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir()
            .map_err(|err| AppError::system(format!("Failed to read working directory: {err}"), &trace_id))?,
    };
    let existing = bundled_adb_path(&base_dir);
    if existing.is_file() && !force {
        info!(trace_id = %trace_id, path = %existing.display(), "platform tools already present");
        return Ok(CommandResponse {
            trace_id,
            data: PlatformToolsInstall {
                directory: base_dir.join(PLATFORM_TOOLS_DIR).to_string_lossy().to_string(),
                adb_path: existing.to_string_lossy().to_string(),
                downloaded: false,
                files: 0,
            },
        });
    }
    let url = platform_tools_url(&state.config.adb);
    let installed = download_platform_tools(
        &url,
        &state.config.download,
        &state.config.catalog.user_agent,
        &base_dir,
        &trace_id,
    )?;
    Ok(CommandResponse {
        trace_id,
        data: installed,
    })
}

pub fn enable_wireless(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<ConnectionStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let manager = state.wireless(&trace_id)?;
    let recheck = manager.enable()?;
    // A one-shot caller waits for the delayed re-check so the printed status is settled.
    if recheck.join().is_err() {
        warn!(trace_id = %trace_id, "status re-check thread panicked");
    }
    Ok(CommandResponse {
        trace_id,
        data: manager.status(),
    })
}

pub fn disable_wireless(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<ConnectionStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let status = state.wireless(&trace_id)?.disable()?;
    Ok(CommandResponse {
        trace_id,
        data: status,
    })
}

pub fn wireless_status(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<ConnectionStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let status = state.wireless(&trace_id)?.poll()?;
    Ok(CommandResponse {
        trace_id,
        data: status,
    })
}

/// Polls on the configured interval until `stop` is raised.
pub fn watch_wireless_status(
    state: &AppState,
    observer: StatusObserver,
    stop: &AtomicBool,
    trace_id: Option<String>,
) -> Result<CommandResponse<ConnectionStatus>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let manager = state.wireless(&trace_id)?;
    manager.subscribe(observer);
    let poller = manager.start_polling(Duration::from_secs(state.config.status.poll_interval_secs));
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }
    poller.stop();
    Ok(CommandResponse {
        trace_id,
        data: manager.status(),
    })
}

pub fn list_installed_apps(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<InstalledApp>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    state.adb_program(&trace_id)?;
    let serial = state.resolve_serial(&trace_id)?;
    let apps = refresh_installed_apps(
        &state.package_source(&serial, &trace_id),
        &state.catalog(&trace_id),
        &trace_id,
    )?;
    Ok(CommandResponse {
        trace_id,
        data: apps,
    })
}

/// Downloads the catalog build of an installed app and installs it on the session's device.
pub fn download_app(
    state: &AppState,
    name: String,
    emitter: DownloadEmitter,
    trace_id: Option<String>,
) -> Result<CommandResponse<DownloadOutcome>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&name, "name", &trace_id)?;
    let apps = list_installed_apps(state, Some(trace_id.clone()))?.data;
    let app = find_app(&apps, &name)
        .ok_or_else(|| AppError::validation(format!("App not installed: {name}"), &trace_id))?;
    if !app.is_matched {
        return Err(AppError::validation(
            format!("{} is not in the catalog", app.display_name),
            &trace_id,
        ));
    }
    info!(trace_id = %trace_id, app_name = %app.display_name, "download requested");
    let handle = state.downloads(&trace_id)?.start(app, emitter, &trace_id)?;
    let outcome = handle.join()?;
    Ok(CommandResponse {
        trace_id,
        data: outcome,
    })
}

/// Fetches every catalog build missing from the local store; nothing is installed.
pub fn sync_catalog(
    state: &AppState,
    emitter: DownloadEmitter,
    trace_id: Option<String>,
) -> Result<CommandResponse<Vec<DownloadOutcome>>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let catalog = state.catalog(&trace_id).fetch()?;
    let context = DownloadContext::from_config(
        &state.config,
        Arc::new(HttpArtifactSource::new(
            &state.config.download,
            &state.config.catalog.user_agent,
        )),
        None,
    );
    let present: Vec<String> = resolve_download_dir(&state.config.download)
        .map(|dir| list_local_artifacts(&dir))
        .unwrap_or_default()
        .into_iter()
        .map(|artifact| artifact.file_name.to_lowercase())
        .collect();

    let cancel = AtomicBool::new(false);
    let emit = |event: DownloadEvent| emitter(event);
    let mut outcomes = Vec::new();
    for entry in &catalog {
        let request = match DownloadRequest::for_catalog_entry(entry) {
            Ok(request) => request,
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "skipping catalog entry");
                continue;
            }
        };
        if present.contains(&request.file_name().to_lowercase()) {
            continue;
        }
        let outcome = run_download(&context, &request, &cancel, &emit, &trace_id);
        emitter(DownloadEvent::Finished(outcome.clone()));
        outcomes.push(outcome);
    }
    info!(
        trace_id = %trace_id,
        catalog = catalog.len(),
        downloaded = outcomes.iter().filter(|outcome| outcome.success).count(),
        "catalog sync finished"
    );
    Ok(CommandResponse {
        trace_id,
        data: outcomes,
    })
}

pub fn list_artifacts(
    state: &AppState,
    trace_id: Option<String>,
) -> Result<CommandResponse<ArtifactListing>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let directory = resolve_download_dir(&state.config.download)
        .ok_or_else(|| AppError::system("No writable download directory", &trace_id))?;
    Ok(CommandResponse {
        data: ArtifactListing {
            directory: directory.to_string_lossy().to_string(),
            artifacts: list_local_artifacts(&directory),
        },
        trace_id,
    })
}

fn resolve_artifact_path(file: &str, download_dir: Option<PathBuf>) -> Option<PathBuf> {
    let direct = Path::new(file);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }
    download_dir
        .map(|dir| dir.join(file))
        .filter(|candidate| candidate.is_file())
}

pub fn install_artifact(
    state: &AppState,
    file: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<String>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    ensure_non_empty(&file, "file", &trace_id)?;
    let path = resolve_artifact_path(file.trim(), resolve_download_dir(&state.config.download))
        .ok_or_else(|| AppError::validation(format!("APK not found: {file}"), &trace_id))?;
    state.adb_program(&trace_id)?;
    let serial = state.resolve_serial(&trace_id)?;
    let message = state.installer(&serial, &trace_id).install(&path)?;
    Ok(CommandResponse {
        trace_id,
        data: message,
    })
}

pub fn send_command(
    state: &AppState,
    command: String,
    trace_id: Option<String>,
) -> Result<CommandResponse<CommandResult>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let command = RemoteCommand::parse_name(&command).ok_or_else(|| {
        AppError::validation(
            format!("Unknown command: {command} (expected sound, vibrate or locate)"),
            &trace_id,
        )
    })?;
    let adb_program = state.adb_program(&trace_id)?;
    let serial = state.resolve_serial(&trace_id)?;
    let result = send_remote_command(
        &adb_program,
        &serial,
        command,
        &state.config.remote_command.package_id,
        &trace_id,
    )?;
    Ok(CommandResponse {
        trace_id,
        data: result,
    })
}

/// Feeds broadcast actions read line by line into a registered command listener.
///
/// `resume` and `focus` lines simulate the app returning to the foreground.
pub fn listen_for_commands<R: BufRead>(
    state: &AppState,
    input: R,
    feedback: Arc<dyn FeedbackHandler>,
    trace_id: Option<String>,
) -> Result<CommandResponse<ListenSummary>, AppError> {
    let trace_id = resolve_trace_id(trace_id);
    let bus = Arc::new(BroadcastBus::new());
    let dispatcher = Arc::new(CommandDispatcher::new(feedback, &state.config.remote_command));
    let listener = CommandListener::new(
        bus.clone(),
        dispatcher,
        &state.config.remote_command.package_id,
        &trace_id,
    );
    listener.register()?;
    info!(trace_id = %trace_id, actions = ?listener.actions(), "listening for broadcast actions");

    let mut summary = ListenSummary::default();
    for line in input.lines() {
        let line = line.map_err(|err| AppError::system(format!("Failed to read input: {err}"), &trace_id))?;
        let action = line.trim();
        if action.is_empty() {
            continue;
        }
        match action {
            "resume" | "focus" => {
                listener.on_resume()?;
                summary.reregistered += 1;
            }
            _ => {
                summary.received += 1;
                if bus.send(action) > 0 {
                    summary.dispatched += 1;
                } else {
                    summary.ignored += 1;
                }
            }
        }
    }
    // End of input must not cut a running locate pattern short.
    listener.wait_idle();
    listener.unregister();
    Ok(CommandResponse {
        trace_id,
        data: summary,
    })
}

#[cfg(test)]
mod tests;
