use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use quest_wireless_adb_lib::app::commands::{
    check_adb, list_artifacts, list_devices, list_installed_apps, send_command, wireless_status,
};
use quest_wireless_adb_lib::app::state::AppState;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    out_dir: Option<PathBuf>,
    with_catalog: bool,
    send: Option<String>,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    adb_program: String,
    out_dir: String,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|warn
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

const USAGE: &str =
    "Usage: cargo run --bin smoke -- [--serial SERIAL] [--out DIR] [--with-catalog] [--send sound|vibrate|locate]\n";

fn parse_args() -> Result<Args, String> {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut out_dir: Option<PathBuf> = None;
    let mut with_catalog = false;
    let mut send: Option<String> = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--out" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--out requires a value".to_string())?;
                out_dir = Some(PathBuf::from(value));
            }
            "--with-catalog" => {
                with_catalog = true;
            }
            "--send" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--send requires a value".to_string())?;
                send = Some(value);
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}\n{USAGE}")),
        }
    }

    Ok(Args {
        serial,
        out_dir,
        with_catalog,
        send,
    })
}

fn write_artifact<T: Serialize>(out_dir: &Path, name: &str, value: &T) -> Result<String, (String, String)> {
    let path = out_dir.join(format!("{name}.json"));
    let body = serde_json::to_string_pretty(value)
        .map_err(|err| ("ERR_JSON".to_string(), err.to_string()))?;
    fs::write(&path, body)
        .map_err(|err| ("ERR_IO".to_string(), format!("Failed to write {name}: {err}")))?;
    Ok(path.to_string_lossy().to_string())
}

/// A failing `required` check fails the run; anything else only warns.
fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, required: bool, f: F) -> bool
where
    F: FnOnce() -> Result<String, (String, String)>,
{
    let start = Instant::now();
    let (status, artifact, error_code, error) = match f() {
        Ok(artifact) => ("pass", Some(artifact), None, None),
        Err((code, err)) => (if required { "fail" } else { "warn" }, None, Some(code), Some(err)),
    };
    checks.push(SmokeCheck {
        name,
        status,
        duration_ms: start.elapsed().as_millis(),
        artifact,
        error_code,
        error,
    });
    status != "fail"
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let out_dir = args.out_dir.clone().unwrap_or_else(|| {
        let mut p = std::env::temp_dir();
        p.push(format!("quest_wireless_adb_smoke_{trace_id}"));
        p
    });
    if let Err(err) = fs::create_dir_all(&out_dir) {
        eprintln!("Failed to create dir {}: {err}", out_dir.display());
        std::process::exit(1);
    }

    let state = match AppState::load(args.serial.clone(), &trace_id) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("load_config failed: {err}");
            std::process::exit(1);
        }
    };
    let trace = || Some(trace_id.clone());
    let mut checks = Vec::new();
    let mut ok = true;

    ok &= run_check(&mut checks, "check_adb", true, || {
        let resp = check_adb(&state, None, trace()).map_err(|err| (err.code.clone(), err.error))?;
        if !resp.data.available {
            return Err((
                "ERR_DEPENDENCY".to_string(),
                resp.data.error.unwrap_or_else(|| "adb unavailable".to_string()),
            ));
        }
        write_artifact(&out_dir, "check_adb", &resp.data)
    });

    if ok {
        ok &= run_check(&mut checks, "list_devices", true, || {
            let resp = list_devices(&state, trace()).map_err(|err| (err.code.clone(), err.error))?;
            if resp.data.is_empty() {
                return Err(("ERR_VALIDATION".to_string(), "No online devices".to_string()));
            }
            write_artifact(&out_dir, "devices", &resp.data)
        });
    }

    if ok {
        run_check(&mut checks, "wireless_status", false, || {
            let resp = wireless_status(&state, trace()).map_err(|err| (err.code.clone(), err.error))?;
            write_artifact(&out_dir, "wireless_status", &resp.data)
        });

        if args.with_catalog {
            ok &= run_check(&mut checks, "installed_apps", true, || {
                let resp =
                    list_installed_apps(&state, trace()).map_err(|err| (err.code.clone(), err.error))?;
                write_artifact(&out_dir, "installed_apps", &resp.data)
            });
        }

        if let Some(command) = args.send.clone() {
            ok &= run_check(&mut checks, "send_command", true, || {
                let resp =
                    send_command(&state, command, trace()).map_err(|err| (err.code.clone(), err.error))?;
                write_artifact(&out_dir, "send_command", &resp.data)
            });
        }
    }

    run_check(&mut checks, "local_artifacts", false, || {
        let resp = list_artifacts(&state, trace()).map_err(|err| (err.code.clone(), err.error))?;
        write_artifact(&out_dir, "artifacts", &resp.data)
    });

    let summary = SmokeSummary {
        tool: "quest_wireless_adb_smoke",
        status: if ok { "pass" } else { "fail" },
        trace_id: trace_id.clone(),
        serial: args.serial,
        adb_program: state.adb_program.clone(),
        out_dir: out_dir.to_string_lossy().to_string(),
        checks,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    );
    if !ok {
        std::process::exit(1);
    }
}
