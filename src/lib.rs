pub mod app;

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;

use app::adb::apk::format_size;
use app::commands::{
    adb_connect, adb_disconnect, check_adb, connect_saved_devices, disable_wireless, disconnect_all,
    download_app, enable_wireless, get_config, get_config_path, grant_permission,
    install_adb, install_artifact, list_artifacts, list_devices, list_installed_apps, listen_for_commands,
    reset_config, resolve_trace_id, revoke_permission, saved_devices, scan_devices, send_command, sync_catalog,
    watch_wireless_status, wireless_status,
};
use app::download::{DownloadEmitter, DownloadEvent, DownloadOutcome};
use app::error::AppError;
use app::logging::init_logging;
use app::commands::PermissionTargets;
use app::models::{CommandResponse, ConnectionStatus, HostCommandResult, PermissionResult};
use app::remote_command::TracingFeedback;
use app::state::AppState;
use app::wireless::{StatusEvent, StatusObserver};

#[derive(Parser, Debug)]
#[command(name = "quest_wireless_adb")]
#[command(about = "Wireless ADB and app updates for Quest headsets", version)]
struct Cli {
    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Device serial to target instead of the configured or only device
    #[arg(short, long, global = true, env = "QUEST_WIRELESS_ADB_SERIAL")]
    serial: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the adb executable
    CheckAdb {
        /// adb path to check instead of the configured one
        #[arg(long)]
        path: Option<String>,
    },

    /// List online adb devices
    Devices,

    /// Browse the network for wireless debugging services
    Scan {
        /// Scan duration in seconds
        #[arg(long)]
        secs: Option<u64>,
    },

    /// Show devices saved by the last scan
    Saved,

    /// Connect to a device over the network
    Connect { address: String },

    /// Connect every saved device
    ConnectAll,

    /// Disconnect one network device
    Disconnect { address: String },

    /// Disconnect every network device
    DisconnectAll,

    /// Grant the companion app secure-settings access
    GrantPermission {
        /// Every online device instead of the selected one
        #[arg(long)]
        all: bool,

        /// Every USB-attached device
        #[arg(long, conflicts_with = "all")]
        usb: bool,
    },

    /// Revoke the companion app's secure-settings access
    RevokePermission {
        /// Every online device instead of the selected one
        #[arg(long)]
        all: bool,

        /// Every USB-attached device
        #[arg(long, conflicts_with = "all")]
        usb: bool,
    },

    /// Download Google's platform-tools so adb is found without an SDK
    InstallAdb {
        /// Parent directory for platform-tools (default: working directory)
        #[arg(long)]
        dir: Option<String>,

        /// Download again even if adb is already there
        #[arg(long)]
        force: bool,
    },

    /// Turn on wireless debugging on the headset
    Enable,

    /// Turn off wireless debugging on the headset
    Disable,

    /// Show wireless debugging status
    Status {
        /// Keep polling and print every change
        #[arg(long)]
        watch: bool,

        /// Stop watching after this many seconds
        #[arg(long, requires = "watch")]
        for_secs: Option<u64>,
    },

    /// List installed apps matched against the catalog
    Apps,

    /// Download and install the catalog build of an installed app
    Download { name: String },

    /// Download every catalog build missing from the local store
    Sync,

    /// List downloaded APKs
    Artifacts,

    /// Install a downloaded APK on the device
    Install { file: String },

    /// Send a remote command to the headset (sound, vibrate, locate)
    Send { command: String },

    /// Read broadcast actions from stdin and run them locally
    Listen,

    /// Show or reset the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    Reset,
    Path,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => error!(error = %err, "failed to serialize output"),
    }
}

/// JSON mode prints the whole response; text mode hands the data to `human`.
fn render<T: Serialize>(json: bool, response: CommandResponse<T>, human: impl FnOnce(&T)) {
    if json {
        print_json(&response);
    } else {
        human(&response.data);
    }
}

fn print_host_output(result: &HostCommandResult) {
    let text = if result.stdout.trim().is_empty() {
        result.stderr.trim()
    } else {
        result.stdout.trim()
    };
    if !text.is_empty() {
        println!("{text}");
    }
}

fn print_status(status: &ConnectionStatus) {
    println!("enabled: {}", status.enabled);
    if let Some(address) = status.address() {
        println!("address: {address}");
    }
    println!("{}", status.message);
}

fn print_outcome(outcome: &DownloadOutcome) {
    let mark = if outcome.success { "ok" } else { "failed" };
    println!("[{mark}] {}: {}", outcome.app_name, outcome.message);
}

fn download_emitter(json: bool) -> DownloadEmitter {
    let last_percent = Arc::new(AtomicU32::new(u32::MAX));
    Arc::new(move |event: DownloadEvent| {
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
            return;
        }
        match event {
            DownloadEvent::Started { app_name, file_name } => {
                last_percent.store(u32::MAX, Ordering::Relaxed);
                eprintln!("Downloading {app_name} -> {file_name}");
            }
            DownloadEvent::Progress {
                fraction,
                received_bytes,
                ..
            } => {
                let percent = (fraction * 100.0) as u32;
                if last_percent.swap(percent, Ordering::Relaxed) != percent {
                    eprint!("\r  {percent:>3}% ({})", format_size(received_bytes));
                    let _ = io::stderr().flush();
                }
            }
            DownloadEvent::Finished(_) => eprintln!(),
        }
    })
}

fn status_printer(json: bool) -> StatusObserver {
    Arc::new(move |event: StatusEvent| {
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
            return;
        }
        match event {
            StatusEvent::EnabledChanged { enabled } => println!("enabled: {enabled}"),
            StatusEvent::ConnectionInfoChanged { ip, port } => println!("address: {ip}:{port}"),
            StatusEvent::MessageChanged { message } => println!("{message}"),
        }
    })
}

fn permission_targets(all: bool, usb: bool) -> PermissionTargets {
    match (all, usb) {
        (true, _) => PermissionTargets::All,
        (false, true) => PermissionTargets::Usb,
        (false, false) => PermissionTargets::Selected,
    }
}

fn report_permission(
    json: bool,
    response: CommandResponse<Vec<PermissionResult>>,
    trace_id: &str,
) -> Result<(), AppError> {
    let any_failed = response.data.iter().any(|result| !result.success);
    render(json, response, |results| {
        for result in results {
            let mark = if result.success { "ok" } else { "failed" };
            println!("[{mark}] {} {}: {}", result.change.verb(), result.serial, result.detail);
        }
    });
    if any_failed {
        return Err(AppError::dependency("Permission change failed on some devices", trace_id));
    }
    Ok(())
}

fn execute(cli: Cli, trace_id: String) -> Result<(), AppError> {
    let json = cli.json;
    let trace = Some(trace_id.clone());

    if let Command::Config { action } = &cli.command {
        match action {
            ConfigAction::Show => render(json, get_config(trace)?, print_json),
            ConfigAction::Reset => render(json, reset_config(trace)?, |_| {
                println!("Configuration reset to defaults");
            }),
            ConfigAction::Path => render(json, get_config_path(trace), |path| println!("{path}")),
        }
        return Ok(());
    }

    let state = AppState::load(cli.serial.clone(), &trace_id)?;
    match cli.command {
        Command::CheckAdb { path } => {
            let response = check_adb(&state, path, trace)?;
            let available = response.data.available;
            let command_path = response.data.command_path.clone();
            render(json, response, |info| {
                if let Some(version) = &info.version {
                    println!("adb {version} ({})", info.command_path);
                } else if let Some(err) = &info.error {
                    println!("adb unavailable: {err}");
                }
            });
            if !available {
                return Err(AppError::dependency(
                    format!("adb is not usable at {command_path}"),
                    &trace_id,
                ));
            }
        }
        Command::Devices => render(json, list_devices(&state, trace)?, |devices| {
            if devices.is_empty() {
                println!("No online devices");
            }
            for device in devices {
                let model = device.model.as_deref().unwrap_or("-");
                let link = if device.is_usb() { "usb" } else { "wifi" };
                println!("{}\t{model}\t{link}", device.serial);
            }
        }),
        Command::Scan { secs } => {
            let on_found = |device: &app::models::DiscoveredDevice| {
                if !json {
                    println!("Found {} at {}", device.name, device.address);
                }
            };
            render(json, scan_devices(&state, secs, on_found, trace)?, |devices| {
                println!("{} device(s) saved", devices.len());
            });
        }
        Command::Saved => render(json, saved_devices(&state, trace), |devices| {
            if devices.is_empty() {
                println!("No saved devices");
            }
            for device in devices {
                println!("{}\t{}", device.address, device.name);
            }
        }),
        Command::Connect { address } => {
            render(json, adb_connect(&state, address, trace)?, print_host_output)
        }
        Command::ConnectAll => {
            let response = connect_saved_devices(&state, trace)?;
            let any_connected = response.data.iter().any(|attempt| attempt.connected);
            render(json, response, |attempts| {
                for attempt in attempts {
                    let mark = if attempt.connected { "ok" } else { "failed" };
                    println!("[{mark}] {}: {}", attempt.address, attempt.detail);
                }
            });
            if !any_connected {
                return Err(AppError::dependency("No saved device could be connected", &trace_id));
            }
        }
        Command::Disconnect { address } => {
            render(json, adb_disconnect(&state, address, trace)?, print_host_output)
        }
        Command::DisconnectAll => render(json, disconnect_all(&state, trace)?, print_host_output),
        Command::GrantPermission { all, usb } => {
            let response = grant_permission(&state, permission_targets(all, usb), trace)?;
            report_permission(json, response, &trace_id)?;
        }
        Command::RevokePermission { all, usb } => {
            let response = revoke_permission(&state, permission_targets(all, usb), trace)?;
            report_permission(json, response, &trace_id)?;
        }
        Command::InstallAdb { dir, force } => {
            render(json, install_adb(&state, dir, force, trace)?, |installed| {
                if installed.downloaded {
                    println!("Installed {} files, adb at {}", installed.files, installed.adb_path);
                } else {
                    println!("adb already present at {} (use --force to refresh)", installed.adb_path);
                }
            })
        }
        Command::Enable => render(json, enable_wireless(&state, trace)?, print_status),
        Command::Disable => render(json, disable_wireless(&state, trace)?, print_status),
        Command::Status { watch: false, .. } => {
            render(json, wireless_status(&state, trace)?, print_status)
        }
        Command::Status {
            watch: true,
            for_secs,
        } => {
            let stop = Arc::new(AtomicBool::new(false));
            if let Some(secs) = for_secs {
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_secs(secs));
                    stop.store(true, Ordering::Relaxed);
                });
            }
            let response = watch_wireless_status(&state, status_printer(json), &stop, trace)?;
            render(json, response, print_status);
        }
        Command::Apps => render(json, list_installed_apps(&state, trace)?, |apps| {
            for app in apps {
                let local = app.local_version_name.as_deref().unwrap_or("?");
                let remote = match (&app.remote_version, app.has_update()) {
                    (Some(remote), true) => format!("update available: {remote}"),
                    (Some(_), false) => "up to date".to_string(),
                    (None, _) => "not in catalog".to_string(),
                };
                println!("{}\t{}\t{local}\t{remote}", app.display_name, app.package_name);
            }
        }),
        Command::Download { name } => {
            let response = download_app(&state, name, download_emitter(json), trace)?;
            let outcome = response.data.clone();
            render(json, response, print_outcome);
            if !outcome.success {
                return Err(AppError::system(
                    outcome.error.unwrap_or(outcome.message),
                    &trace_id,
                ));
            }
        }
        Command::Sync => render(json, sync_catalog(&state, download_emitter(json), trace)?, |outcomes| {
            if outcomes.is_empty() {
                println!("Local store is up to date");
            }
            for outcome in outcomes {
                print_outcome(outcome);
            }
        }),
        Command::Artifacts => render(json, list_artifacts(&state, trace)?, |listing| {
            println!("{}", listing.directory);
            for artifact in &listing.artifacts {
                println!("  {}\t{}", artifact.file_name, format_size(artifact.size_bytes));
            }
        }),
        Command::Install { file } => {
            render(json, install_artifact(&state, file, trace)?, |message| println!("{message}"))
        }
        Command::Send { command } => render(json, send_command(&state, command, trace)?, |result| {
            println!("Sent to {}", result.serial);
        }),
        Command::Listen => {
            let stdin = io::stdin();
            let response =
                listen_for_commands(&state, stdin.lock(), Arc::new(TracingFeedback), trace)?;
            render(json, response, |summary| {
                println!(
                    "received {}, dispatched {}, ignored {}",
                    summary.received, summary.dispatched, summary.ignored
                );
            });
        }
        Command::Config { .. } => {}
    }
    Ok(())
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let trace_id = resolve_trace_id(None);
    let json = cli.json;

    match execute(cli, trace_id) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(trace_id = %err.trace_id, code = %err.code, error = %err.error, "command failed");
            if json {
                print_json(&err);
            } else {
                eprintln!("error: {} [{}] trace_id={}", err.error, err.code, err.trace_id);
            }
            ExitCode::FAILURE
        }
    }
}
