use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::error::AppError;
use crate::app::models::ConnectionStatus;
use crate::app::platform::DebugBridge;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    EnabledChanged { enabled: bool },
    ConnectionInfoChanged { ip: String, port: u16 },
    MessageChanged { message: String },
}

pub type StatusObserver = Arc<dyn Fn(StatusEvent) + Send + Sync>;

/// Events for every field that differs between two snapshots; IP and port travel together.
pub fn diff_status(old: &ConnectionStatus, new: &ConnectionStatus) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    if old.enabled != new.enabled {
        events.push(StatusEvent::EnabledChanged {
            enabled: new.enabled,
        });
    }
    if old.ip != new.ip || old.port != new.port {
        events.push(StatusEvent::ConnectionInfoChanged {
            ip: new.ip.clone(),
            port: new.port,
        });
    }
    if old.message != new.message {
        events.push(StatusEvent::MessageChanged {
            message: new.message.clone(),
        });
    }
    events
}

pub struct WirelessDebugManager {
    bridge: Arc<dyn DebugBridge>,
    status: Mutex<ConnectionStatus>,
    observers: Mutex<Vec<StatusObserver>>,
    recheck_delay: Duration,
    trace_id: String,
}

impl WirelessDebugManager {
    pub fn new(bridge: Arc<dyn DebugBridge>, recheck_delay: Duration, trace_id: &str) -> Self {
        Self {
            bridge,
            status: Mutex::new(ConnectionStatus::not_initialized()),
            observers: Mutex::new(Vec::new()),
            recheck_delay,
            trace_id: trace_id.to_string(),
        }
    }

    pub fn subscribe(&self, observer: StatusObserver) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    pub fn is_available(&self) -> bool {
        self.bridge.is_available()
    }

    pub fn permission_command(&self) -> String {
        self.bridge.permission_command()
    }

    fn notify(&self, events: Vec<StatusEvent>) {
        if events.is_empty() {
            return;
        }
        // Snapshot so an observer may subscribe again without deadlocking.
        let observers = match self.observers.lock() {
            Ok(observers) => observers.clone(),
            Err(_) => return,
        };
        for event in events {
            for observer in &observers {
                observer(event.clone());
            }
        }
    }

    fn apply(&self, next: ConnectionStatus) {
        let events = match self.status.lock() {
            Ok(mut current) => {
                let events = diff_status(&current, &next);
                *current = next;
                events
            }
            Err(_) => return,
        };
        self.notify(events);
    }

    fn set_message(&self, message: String) {
        let mut next = self.status();
        next.message = message;
        self.apply(next);
    }

    /// Re-reads the device state; observers only hear about fields that changed.
    pub fn poll(&self) -> Result<ConnectionStatus, AppError> {
        match self.bridge.query_status() {
            Ok(status) => {
                debug!(
                    trace_id = %self.trace_id,
                    enabled = status.enabled,
                    ip = %status.ip,
                    port = status.port,
                    "wireless status polled"
                );
                self.apply(status.clone());
                Ok(status)
            }
            Err(err) => {
                warn!(trace_id = %self.trace_id, error = %err, "wireless status poll failed");
                self.set_message(format!("Status update failed: {}", err.error));
                Err(err)
            }
        }
    }

    /// Turns wireless debugging on and schedules one delayed re-check.
    ///
    /// The returned handle belongs to the re-check; dropping it detaches the thread.
    pub fn enable(self: &Arc<Self>) -> Result<JoinHandle<()>, AppError> {
        if !self.bridge.is_available() {
            let status = self.bridge.query_status().unwrap_or_default();
            return Err(AppError::dependency(status.message, &self.trace_id));
        }
        if !self.bridge.has_permission() {
            let message = format!(
                "Missing permission. Run on your computer:\n{}",
                self.bridge.permission_command()
            );
            warn!(trace_id = %self.trace_id, "enable rejected, permission missing");
            self.set_message(message.clone());
            return Err(AppError::permission(message, &self.trace_id));
        }
        if let Err(err) = self.bridge.enable() {
            self.set_message(format!("Enable failed: {}", err.error));
            return Err(err);
        }
        info!(trace_id = %self.trace_id, "wireless debugging enabled");
        self.set_message("Starting wireless ADB...".to_string());

        let manager: Weak<Self> = Arc::downgrade(self);
        let delay = self.recheck_delay;
        Ok(thread::spawn(move || {
            thread::sleep(delay);
            if let Some(manager) = manager.upgrade() {
                let _ = manager.poll();
            }
        }))
    }

    pub fn disable(&self) -> Result<ConnectionStatus, AppError> {
        if let Err(err) = self.bridge.disable() {
            self.set_message(format!("Disable failed: {}", err.error));
            return Err(err);
        }
        info!(trace_id = %self.trace_id, "wireless debugging disabled");
        self.poll()
    }

    /// Polls now and then every `interval` until the handle is stopped.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) -> StatusPollerHandle {
        let (sender, receiver) = mpsc::channel::<PollSignal>();
        let manager = Arc::clone(self);
        let join = thread::spawn(move || {
            let _ = manager.poll();
            loop {
                match receiver.recv_timeout(interval) {
                    Ok(PollSignal::Refresh) | Err(RecvTimeoutError::Timeout) => {
                        let _ = manager.poll();
                    }
                    Ok(PollSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(trace_id = %manager.trace_id, "status poller stopped");
        });
        StatusPollerHandle { sender, join }
    }
}

enum PollSignal {
    Refresh,
    Stop,
}

pub struct StatusPollerHandle {
    sender: Sender<PollSignal>,
    join: JoinHandle<()>,
}

impl StatusPollerHandle {
    pub fn refresh(&self) {
        let _ = self.sender.send(PollSignal::Refresh);
    }

    /// The host came back to the foreground; state may have changed meanwhile.
    pub fn on_resume(&self) {
        self.refresh();
    }

    pub fn stop(self) {
        let _ = self.sender.send(PollSignal::Stop);
        let _ = self.join.join();
    }
}
