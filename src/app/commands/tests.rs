use super::*;

use std::io::Cursor;
use std::sync::Mutex;

use crate::app::adb::apk::tests::sample_apk_bytes;
use crate::app::catalog::tests::serve_once;
use crate::app::remote_command::{Hand, HapticPulse, Tone};
use tempfile::TempDir;

fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
        .lock()
        .expect("env lock")
}

const MISSING_ADB: &str = "/definitely/not/a/real/adb";

fn offline_state(dir: &TempDir) -> AppState {
    let mut config = AppConfig::default();
    config.adb.command_path = MISSING_ADB.to_string();
    config.download.directory = dir.path().join("apks").to_string_lossy().to_string();
    config.discovery.devices_path = dir.path().join("devices.json").to_string_lossy().to_string();
    AppState::new(config, None)
}

#[derive(Default)]
struct RecordingFeedback {
    calls: Mutex<Vec<String>>,
}

impl FeedbackHandler for RecordingFeedback {
    fn play_tone(&self, tone: &Tone) {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("tone:{}", tone.frequency_hz));
    }

    fn vibrate(&self, hand: Hand, _pulse: &HapticPulse) {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("vibrate:{hand:?}"));
    }
}

#[test]
fn resolve_trace_id_generates_when_blank() {
    assert_eq!(resolve_trace_id(Some("abc".to_string())), "abc");
    let generated = resolve_trace_id(Some("  ".to_string()));
    assert!(Uuid::parse_str(&generated).is_ok());
    assert!(Uuid::parse_str(&resolve_trace_id(None)).is_ok());
}

#[test]
fn config_commands_follow_env_override() {
    let _guard = env_lock();
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("config.json");
    std::env::set_var("QUEST_WIRELESS_ADB_CONFIG_PATH", &path);

    let shown = get_config_path(Some("trace-path".to_string()));
    assert_eq!(shown.trace_id, "trace-path");
    assert_eq!(shown.data, path.to_string_lossy());

    let reset = reset_config(None).expect("reset");
    assert!(path.exists());
    let loaded = get_config(None).expect("load");
    assert_eq!(loaded.data, reset.data);

    std::env::remove_var("QUEST_WIRELESS_ADB_CONFIG_PATH");
}

#[test]
fn check_adb_reports_missing_binary() {
    let dir = TempDir::new().expect("tempdir");
    let state = offline_state(&dir);
    let response = check_adb(&state, None, Some("trace-adb".to_string())).expect("response");
    assert!(!response.data.available);
    assert!(response.data.version.is_none());
    assert!(response.data.error.is_some());
    assert_eq!(response.data.command_path, MISSING_ADB);
}

#[test]
fn adb_commands_validate_before_running() {
    let dir = TempDir::new().expect("tempdir");
    let state = offline_state(&dir);

    let err = adb_connect(&state, " ".to_string(), Some("trace-1".to_string())).expect_err("empty");
    assert_eq!(err.code, "ERR_VALIDATION");
    assert_eq!(err.trace_id, "trace-1");

    let err = send_command(&state, "dance".to_string(), None).expect_err("unknown");
    assert_eq!(err.code, "ERR_VALIDATION");
    assert!(err.error.contains("Unknown command"));

    let err = list_devices(&state, None).expect_err("no adb");
    assert_eq!(err.code, "ERR_DEPENDENCY");

    let emitter: DownloadEmitter = Arc::new(|_| {});
    let err = download_app(&state, "".to_string(), emitter, None).expect_err("empty name");
    assert_eq!(err.code, "ERR_VALIDATION");
}

#[test]
fn connect_saved_requires_a_scan() {
    let dir = TempDir::new().expect("tempdir");
    let mut state = offline_state(&dir);
    // Any existing file passes validation, so the saved list is consulted.
    let fake_adb = dir.path().join("adb");
    std::fs::write(&fake_adb, b"").expect("fake adb");
    state.adb_program = fake_adb.to_string_lossy().to_string();
    let err = connect_saved_devices(&state, None).expect_err("nothing saved");
    assert_eq!(err.code, "ERR_VALIDATION");
    assert!(err.error.contains("scan"));
}

#[test]
fn saved_devices_reads_the_devices_file() {
    let dir = TempDir::new().expect("tempdir");
    let state = offline_state(&dir);
    assert!(saved_devices(&state, None).data.is_empty());

    let device = DiscoveredDevice {
        ip: "192.168.1.20".to_string(),
        port: 37000,
        name: "Quest 3".to_string(),
        address: "192.168.1.20:37000".to_string(),
    };
    save_devices(&devices_path(&state.config), &[device.clone()], "trace").expect("save");
    assert_eq!(saved_devices(&state, None).data, vec![device]);
}

#[test]
fn listen_dispatches_known_actions_only() {
    let dir = TempDir::new().expect("tempdir");
    let state = offline_state(&dir);
    let package_id = state.config.remote_command.package_id.clone();
    let input = format!(
        "{sound}\n\ncom.other.app.PLAY_SOUND\nresume\n{vibrate}\n",
        sound = RemoteCommand::PlaySound.action(&package_id),
        vibrate = RemoteCommand::Vibrate.action(&package_id),
    );
    let feedback = Arc::new(RecordingFeedback::default());

    let summary = listen_for_commands(&state, Cursor::new(input), feedback.clone(), None)
        .expect("listen")
        .data;

    assert_eq!(
        summary,
        ListenSummary {
            received: 3,
            dispatched: 2,
            ignored: 1,
            reregistered: 1,
        }
    );
    let calls = feedback.calls.lock().expect("calls").clone();
    assert_eq!(calls, vec!["tone:880", "vibrate:Right", "vibrate:Left"]);
}

#[test]
fn listen_waits_for_locate_pattern() {
    let dir = TempDir::new().expect("tempdir");
    let mut state = offline_state(&dir);
    state.config.remote_command.locate_repeats = 5;
    state.config.remote_command.locate_interval_ms = 20;
    let input = format!(
        "{}\n",
        RemoteCommand::FindDevice.action(&state.config.remote_command.package_id)
    );
    let feedback = Arc::new(RecordingFeedback::default());

    let summary = listen_for_commands(&state, Cursor::new(input), feedback.clone(), None)
        .expect("listen")
        .data;

    assert_eq!(summary.dispatched, 1);
    let calls = feedback.calls.lock().expect("calls").clone();
    assert_eq!(calls.iter().filter(|call| call.starts_with("tone:")).count(), 5);
    assert_eq!(calls.iter().filter(|call| call.starts_with("vibrate:")).count(), 10);
}

fn device(serial: &str, state: &str) -> DeviceSummary {
    DeviceSummary {
        serial: serial.to_string(),
        state: state.to_string(),
        model: Some("Quest_3".to_string()),
        product: None,
        device: None,
        transport_id: None,
    }
}

#[test]
fn permission_targets_filter_online_devices() {
    let devices = vec![
        device("1WMHH0", "device"),
        device("192.168.1.20:37000", "device"),
        device("2XKQQ1", "unauthorized"),
        device("3ABCD2", "device"),
    ];
    assert_eq!(
        select_permission_targets(&devices, PermissionTargets::Usb),
        vec!["1WMHH0", "3ABCD2"]
    );
    assert_eq!(
        select_permission_targets(&devices, PermissionTargets::All),
        vec!["1WMHH0", "192.168.1.20:37000", "3ABCD2"]
    );
    assert!(select_permission_targets(&[device("ZZZ", "offline")], PermissionTargets::All).is_empty());
}

#[test]
fn permission_change_needs_adb() {
    let dir = TempDir::new().expect("tempdir");
    let state = offline_state(&dir);
    let err = revoke_permission(&state, PermissionTargets::All, Some("trace-perm".to_string()))
        .expect_err("no adb");
    assert_eq!(err.code, "ERR_DEPENDENCY");
    assert_eq!(err.trace_id, "trace-perm");
}

#[cfg(unix)]
#[test]
fn permission_change_targets_the_selected_serial() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().expect("tempdir");
    let mut state = offline_state(&dir);
    // Succeeds silently for grant and complains on stderr for revoke, like `pm` does.
    let script = dir.path().join("adb");
    std::fs::write(
        &script,
        "#!/bin/sh\n[ \"$2\" = \"ABC\" ] || exit 3\n[ \"$5\" = \"revoke\" ] && echo 'SecurityException' >&2\nexit 0\n",
    )
    .expect("script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    state.adb_program = script.to_string_lossy().to_string();
    state.config.adb.device_serial = "ABC".to_string();

    let granted = grant_permission(&state, PermissionTargets::Selected, None)
        .expect("grant")
        .data;
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].serial, "ABC");
    assert_eq!(granted[0].change, PermissionChange::Grant);
    assert!(granted[0].success, "{:?}", granted[0]);

    let revoked = revoke_permission(&state, PermissionTargets::Selected, None)
        .expect("revoke")
        .data;
    assert_eq!(revoked[0].change, PermissionChange::Revoke);
    assert!(!revoked[0].success);
    assert!(revoked[0].detail.contains("pm revoke failed on ABC"));
}

#[test]
fn install_adb_keeps_existing_platform_tools() {
    let dir = TempDir::new().expect("tempdir");
    let mut state = offline_state(&dir);
    // Any request would fail against the closed port.
    state.config.adb.platform_tools_url = "http://127.0.0.1:9/tools.zip".to_string();
    let existing = bundled_adb_path(dir.path());
    std::fs::create_dir_all(existing.parent().expect("parent")).expect("tools dir");
    std::fs::write(&existing, b"adb").expect("adb");

    let installed = install_adb(
        &state,
        Some(dir.path().to_string_lossy().to_string()),
        false,
        None,
    )
    .expect("install")
    .data;
    assert!(!installed.downloaded);
    assert_eq!(installed.adb_path, existing.to_string_lossy());

    let err = install_adb(&state, Some(dir.path().to_string_lossy().to_string()), true, None)
        .expect_err("forced download hits the closed port");
    assert_eq!(err.code, "ERR_NETWORK");
}

#[test]
fn sync_downloads_missing_catalog_builds() {
    let dir = TempDir::new().expect("tempdir");
    let mut state = offline_state(&dir);
    let apk_dir = dir.path().join("apks");
    std::fs::create_dir_all(&apk_dir).expect("apk dir");
    std::fs::write(apk_dir.join("Present_2.0.apk"), sample_apk_bytes(2048)).expect("existing");

    let apk = sample_apk_bytes(4096);
    let apk_url = serve_once(
        "200 OK",
        &[("Content-Length", apk.len().to_string())],
        apk,
    );
    let catalog = serde_json::json!([
        {"app_name": "Moss", "latest_version": "1.0", "apk_url": format!("{apk_url}/moss.apk")},
        // Never fetched: the port is closed, so a request would fail the outcome.
        {"app_name": "Present", "latest_version": "2.0", "apk_url": "http://127.0.0.1:9/present.apk"},
        {"app_name": "Broken"}
    ]);
    state.config.catalog.url = serve_once(
        "200 OK",
        &[("Content-Type", "application/json".to_string())],
        catalog.to_string().into_bytes(),
    );

    let events = Arc::new(Mutex::new(Vec::<DownloadEvent>::new()));
    let sink = Arc::clone(&events);
    let emitter: DownloadEmitter = Arc::new(move |event: DownloadEvent| sink.lock().expect("events").push(event));

    let outcomes = sync_catalog(&state, emitter, None).expect("sync").data;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success, "{:?}", outcomes[0]);
    assert!(!outcomes[0].installed);
    assert!(apk_dir.join("Moss_1.0.apk").is_file());
    assert!(events
        .lock()
        .expect("events")
        .iter()
        .any(|event| matches!(event, DownloadEvent::Finished(outcome) if outcome.app_name == "Moss")));

    let listing = list_artifacts(&state, None).expect("artifacts").data;
    let names: Vec<&str> = listing
        .artifacts
        .iter()
        .map(|artifact| artifact.file_name.as_str())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"Moss_1.0.apk"));
    assert!(names.contains(&"Present_2.0.apk"));
}

#[test]
fn install_artifact_rejects_unknown_file() {
    let dir = TempDir::new().expect("tempdir");
    let state = offline_state(&dir);
    let err = install_artifact(&state, "Nope_1.0.apk".to_string(), None).expect_err("missing");
    assert_eq!(err.code, "ERR_VALIDATION");
    assert!(err.error.contains("APK not found"));
}

#[test]
fn artifact_path_falls_back_to_download_dir() {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("Moss_1.0.apk"), b"apk").expect("write");
    assert_eq!(
        resolve_artifact_path("Moss_1.0.apk", Some(dir.path().to_path_buf())),
        Some(dir.path().join("Moss_1.0.apk"))
    );
    assert_eq!(resolve_artifact_path("Moss_1.0.apk", None), None);
}
