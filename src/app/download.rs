//! Download, validate and install one APK from the catalog.
//!
//! The transfer writes into `<artifact>.part` and only renames once the file passed every
//! check, so a half-written or HTML error page never sits under the final artifact name.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::app::adb::apk::{
    artifact_file_name, format_size, has_apk_signature, inspect_archive, remove_stale_artifacts,
};
use crate::app::config::{AppConfig, DownloadSettings};
use crate::app::error::AppError;
use crate::app::models::{CatalogEntry, DownloadSession, InstalledApp};
use crate::app::platform::PackageInstaller;

const READ_CHUNK: usize = 8192;
const UNKNOWN_TOTAL_PROGRESS_STEP: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("No download URL for {0}")]
    MissingUrl(String),
    #[error("No catalog version for {0}")]
    MissingVersion(String),
    #[error("No writable download directory")]
    NoWritableDirectory,
    #[error("Download stalled: no data received for {0}s")]
    Stalled(u64),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Server returned HTTP {0}")]
    HttpStatus(u16),
    #[error("Incomplete download: received {received} of {expected} bytes")]
    ShortContent { received: u64, expected: u64 },
    #[error("File too small ({0} bytes), not a valid APK")]
    TooSmall(u64),
    #[error("Downloaded file is not an APK (bad header)")]
    BadHeader,
    #[error("Downloaded APK is corrupt: {0}")]
    BadArchive(String),
    #[error("File error: {0}")]
    Io(#[from] io::Error),
    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn into_app_error(self, trace_id: &str) -> AppError {
        let message = self.to_string();
        match self {
            DownloadError::Stalled(_)
            | DownloadError::Network(_)
            | DownloadError::HttpStatus(_)
            | DownloadError::ShortContent { .. } => AppError::network(message, trace_id),
            DownloadError::MissingUrl(_)
            | DownloadError::MissingVersion(_)
            | DownloadError::Cancelled => {
                AppError::validation(message, trace_id)
            }
            _ => AppError::system(message, trace_id),
        }
    }
}

pub struct ArtifactStream {
    /// `None` when the server sent no usable `Content-Length`.
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

pub trait ArtifactSource: Send + Sync {
    fn open(&self, url: &str) -> Result<ArtifactStream, DownloadError>;
}

pub struct HttpArtifactSource {
    agent: ureq::Agent,
}

impl HttpArtifactSource {
    /// The read timeout doubles as the stall window for a socket that stops delivering bytes.
    pub fn new(settings: &DownloadSettings, user_agent: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(settings.connect_timeout_secs))
            .timeout_read(Duration::from_secs(settings.stall_timeout_secs))
            .user_agent(user_agent)
            .build();
        Self { agent }
    }
}

impl ArtifactSource for HttpArtifactSource {
    fn open(&self, url: &str) -> Result<ArtifactStream, DownloadError> {
        let response = self.agent.get(url).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => DownloadError::HttpStatus(code),
            ureq::Error::Transport(transport) => DownloadError::Network(transport.to_string()),
        })?;
        let content_length = response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|len| *len > 0);
        Ok(ArtifactStream {
            content_length,
            reader: Box::new(response.into_reader()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub app_name: String,
    pub version: String,
    pub url: String,
    /// Catalog size, used for progress when the server omits `Content-Length`.
    pub expected_size: Option<u64>,
    pub install: bool,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl DownloadRequest {
    pub fn for_app(app: &InstalledApp) -> Result<Self, DownloadError> {
        let url = non_empty(app.download_url.as_deref())
            .ok_or_else(|| DownloadError::MissingUrl(app.display_name.clone()))?;
        let version = non_empty(app.remote_version.as_deref())
            .ok_or_else(|| DownloadError::MissingVersion(app.display_name.clone()))?;
        Ok(Self {
            app_name: app.display_name.clone(),
            version,
            url,
            expected_size: app.remote_file_size,
            install: true,
        })
    }

    /// Host-side sync: fetch into the local store without installing.
    pub fn for_catalog_entry(entry: &CatalogEntry) -> Result<Self, DownloadError> {
        if entry.latest_version.trim().is_empty() {
            return Err(DownloadError::MissingVersion(entry.app_name.clone()));
        }
        if !entry.is_complete() {
            return Err(DownloadError::MissingUrl(entry.app_name.clone()));
        }
        Ok(Self {
            app_name: entry.app_name.clone(),
            version: entry.latest_version.trim().to_string(),
            url: entry.apk_url.trim().to_string(),
            expected_size: entry.file_size,
            install: false,
        })
    }

    pub fn file_name(&self) -> String {
        artifact_file_name(&self.app_name, &self.version)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        app_name: String,
        file_name: String,
    },
    Progress {
        app_name: String,
        fraction: f32,
        received_bytes: u64,
        total_bytes: Option<u64>,
    },
    Finished(DownloadOutcome),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub app_name: String,
    pub success: bool,
    pub installed: bool,
    pub message: String,
    pub artifact_path: Option<String>,
    pub error: Option<String>,
}

impl DownloadOutcome {
    fn failed(app_name: &str, err: &DownloadError) -> Self {
        Self {
            app_name: app_name.to_string(),
            success: false,
            installed: false,
            message: format!("Download failed: {err}"),
            artifact_path: None,
            error: Some(err.to_string()),
        }
    }
}

pub type DownloadEmitter = Arc<dyn Fn(DownloadEvent) + Send + Sync>;

pub fn download_dir_candidates(settings: &DownloadSettings) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let configured = settings.directory.trim();
    if !configured.is_empty() {
        candidates.push(PathBuf::from(configured));
    }
    if let Some(downloads) = dirs::download_dir() {
        candidates.push(downloads.join("QuestApks"));
    }
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join("quest_wireless_adb").join("apks"));
    }
    candidates.push(std::env::temp_dir().join("QuestApks"));
    candidates
}

fn is_writable_dir(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(".write_check");
    match fs::write(&marker, b"ok") {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
            true
        }
        Err(_) => false,
    }
}

/// First candidate that can be created and written to.
pub fn resolve_download_dir_from(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|dir| is_writable_dir(dir)).cloned()
}

pub fn resolve_download_dir(settings: &DownloadSettings) -> Option<PathBuf> {
    resolve_download_dir_from(&download_dir_candidates(settings))
}

pub struct DownloadContext {
    pub source: Arc<dyn ArtifactSource>,
    pub installer: Option<Arc<dyn PackageInstaller>>,
    pub directory_candidates: Vec<PathBuf>,
    pub stall_timeout: Duration,
    pub min_artifact_bytes: u64,
}

impl DownloadContext {
    pub fn from_config(
        config: &AppConfig,
        source: Arc<dyn ArtifactSource>,
        installer: Option<Arc<dyn PackageInstaller>>,
    ) -> Self {
        Self {
            source,
            installer,
            directory_candidates: download_dir_candidates(&config.download),
            stall_timeout: Duration::from_secs(config.download.stall_timeout_secs),
            min_artifact_bytes: config.download.min_artifact_bytes,
        }
    }
}

/// Size checks first, then the ZIP signature, then the central directory.
pub fn validate_artifact(
    path: &Path,
    received: u64,
    content_length: Option<u64>,
    min_bytes: u64,
) -> Result<(), DownloadError> {
    if let Some(expected) = content_length {
        if received < expected {
            return Err(DownloadError::ShortContent { received, expected });
        }
    }
    if received < min_bytes {
        return Err(DownloadError::TooSmall(received));
    }
    if !has_apk_signature(path)? {
        return Err(DownloadError::BadHeader);
    }
    inspect_archive(path).map_err(DownloadError::BadArchive)?;
    Ok(())
}

fn progress_event(request: &DownloadRequest, received: u64, total: Option<u64>) -> DownloadEvent {
    let fraction = match total {
        Some(total) if total > 0 => (received as f32 / total as f32).min(1.0),
        _ => 0.0,
    };
    DownloadEvent::Progress {
        app_name: request.app_name.clone(),
        fraction,
        received_bytes: received,
        total_bytes: total,
    }
}

/// Streams the response into `part_path`; returns received bytes and the announced length.
fn transfer(
    context: &DownloadContext,
    request: &DownloadRequest,
    part_path: &Path,
    cancel: &AtomicBool,
    emit: &dyn Fn(DownloadEvent),
) -> Result<(u64, Option<u64>), DownloadError> {
    let ArtifactStream {
        content_length,
        mut reader,
    } = context.source.open(&request.url)?;
    let total = content_length.or(request.expected_size);
    let mut file = File::create(part_path)?;
    let mut buffer = [0u8; READ_CHUNK];
    let mut received: u64 = 0;
    let mut last_data = Instant::now();
    let mut last_percent: i64 = -1;
    let mut last_step: u64 = 0;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(DownloadError::Cancelled);
        }
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => {
                file.write_all(&buffer[..count])?;
                received += count as u64;
                last_data = Instant::now();
                let notify = match total {
                    Some(total) if total > 0 => {
                        let percent = (received.min(total) * 100 / total) as i64;
                        let changed = percent != last_percent;
                        last_percent = percent;
                        changed
                    }
                    _ => {
                        let step = received / UNKNOWN_TOTAL_PROGRESS_STEP;
                        let changed = step != last_step;
                        last_step = step;
                        changed
                    }
                };
                if notify {
                    emit(progress_event(request, received, total));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                if last_data.elapsed() >= context.stall_timeout {
                    return Err(DownloadError::Stalled(context.stall_timeout.as_secs()));
                }
            }
            Err(err) => return Err(DownloadError::Network(err.to_string())),
        }
    }
    file.flush()?;
    Ok((received, content_length))
}

fn install_artifact(
    context: &DownloadContext,
    request: &DownloadRequest,
    path: &Path,
    reused: bool,
    trace_id: &str,
) -> DownloadOutcome {
    let display_path = path.display().to_string();
    let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    let mut outcome = DownloadOutcome {
        app_name: request.app_name.clone(),
        success: true,
        installed: false,
        message: if reused {
            format!("Already downloaded: {display_path}")
        } else {
            format!("Downloaded {} ({})", display_path, format_size(size))
        },
        artifact_path: Some(display_path.clone()),
        error: None,
    };
    let installer = match (&context.installer, request.install) {
        (Some(installer), true) => installer,
        _ => return outcome,
    };
    match installer.install(path) {
        Ok(_) => {
            outcome.installed = true;
            outcome.message = format!("Installed {} {}", request.app_name, request.version);
        }
        Err(err) => {
            warn!(
                trace_id = %trace_id,
                app_name = %request.app_name,
                error = %err,
                "install after download failed"
            );
            outcome.message = format!(
                "Install failed ({}). Please install manually: {display_path}",
                err.error
            );
            outcome.error = Some(err.error);
        }
    }
    outcome
}

fn download_and_install(
    context: &DownloadContext,
    request: &DownloadRequest,
    cancel: &AtomicBool,
    emit: &dyn Fn(DownloadEvent),
    trace_id: &str,
) -> Result<DownloadOutcome, DownloadError> {
    let dir = resolve_download_dir_from(&context.directory_candidates)
        .ok_or(DownloadError::NoWritableDirectory)?;
    let file_name = request.file_name();
    let target = dir.join(&file_name);

    let removed = remove_stale_artifacts(&dir, &request.app_name, &file_name);
    if !removed.is_empty() {
        debug!(trace_id = %trace_id, removed = removed.len(), "removed previous versions");
    }

    emit(DownloadEvent::Started {
        app_name: request.app_name.clone(),
        file_name: file_name.clone(),
    });

    if target.is_file() {
        info!(
            trace_id = %trace_id,
            app_name = %request.app_name,
            path = %target.display(),
            "artifact already present, skipping transfer"
        );
        return Ok(install_artifact(context, request, &target, true, trace_id));
    }

    let part_path = dir.join(format!("{file_name}.part"));
    let checked = transfer(context, request, &part_path, cancel, emit).and_then(
        |(received, content_length)| {
            validate_artifact(&part_path, received, content_length, context.min_artifact_bytes)
                .map(|_| received)
        },
    );
    let received = match checked {
        Ok(received) => received,
        Err(err) => {
            let _ = fs::remove_file(&part_path);
            return Err(err);
        }
    };
    if let Err(err) = fs::rename(&part_path, &target) {
        let _ = fs::remove_file(&part_path);
        return Err(DownloadError::Io(err));
    }
    info!(
        trace_id = %trace_id,
        app_name = %request.app_name,
        bytes = received,
        path = %target.display(),
        "artifact downloaded"
    );
    Ok(install_artifact(context, request, &target, false, trace_id))
}

/// Runs the whole pipeline on the calling thread. Never panics; failures become outcomes.
pub fn run_download(
    context: &DownloadContext,
    request: &DownloadRequest,
    cancel: &AtomicBool,
    emit: &dyn Fn(DownloadEvent),
    trace_id: &str,
) -> DownloadOutcome {
    match download_and_install(context, request, cancel, emit, trace_id) {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                trace_id = %trace_id,
                app_name = %request.app_name,
                error = %err,
                "download failed"
            );
            DownloadOutcome::failed(&request.app_name, &err)
        }
    }
}

pub struct DownloadHandle {
    cancel_flag: Arc<AtomicBool>,
    join: JoinHandle<DownloadOutcome>,
    trace_id: String,
}

impl DownloadHandle {
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<DownloadOutcome, AppError> {
        self.join
            .join()
            .map_err(|_| AppError::system("Download worker panicked", &self.trace_id))
    }
}

/// Owns the single download session. A second `start` while one runs is rejected.
pub struct DownloadManager {
    context: Arc<DownloadContext>,
    session: Arc<Mutex<Option<DownloadSession>>>,
}

impl DownloadManager {
    pub fn new(context: DownloadContext) -> Self {
        Self {
            context: Arc::new(context),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn session(&self) -> Option<DownloadSession> {
        self.session.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn is_active(&self) -> bool {
        self.session().is_some()
    }

    pub fn start(
        &self,
        app: &InstalledApp,
        emitter: DownloadEmitter,
        trace_id: &str,
    ) -> Result<DownloadHandle, AppError> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| AppError::system("Download state lock poisoned", trace_id))?;
        if let Some(active) = guard.as_ref() {
            warn!(
                trace_id = %trace_id,
                active = %active.app.display_name,
                requested = %app.display_name,
                "download rejected, another one is active"
            );
            return Err(AppError::validation(
                format!("Download already in progress: {}", active.app.display_name),
                trace_id,
            ));
        }
        let request = DownloadRequest::for_app(app).map_err(|err| err.into_app_error(trace_id))?;
        *guard = Some(DownloadSession {
            app: app.clone(),
            progress: 0.0,
            in_progress: true,
        });
        drop(guard);

        let cancel_flag = Arc::new(AtomicBool::new(false));
        let cancel_thread = Arc::clone(&cancel_flag);
        let context = Arc::clone(&self.context);
        let session = Arc::clone(&self.session);
        let worker_trace = trace_id.to_string();

        let join = thread::spawn(move || {
            let emit = |event: DownloadEvent| {
                if let DownloadEvent::Progress { fraction, .. } = &event {
                    if let Ok(mut guard) = session.lock() {
                        if let Some(active) = guard.as_mut() {
                            active.progress = *fraction;
                        }
                    }
                }
                emitter(event);
            };
            let outcome = run_download(&context, &request, &cancel_thread, &emit, &worker_trace);
            if let Ok(mut guard) = session.lock() {
                *guard = None;
            }
            emitter(DownloadEvent::Finished(outcome.clone()));
            outcome
        });

        Ok(DownloadHandle {
            cancel_flag,
            join,
            trace_id: trace_id.to_string(),
        })
    }
}
