use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tracing::{debug, info, warn};

use crate::app::error::AppError;
use crate::app::models::DiscoveredDevice;

/// Wireless debugging advertises itself under both names depending on the Android build.
pub const ADB_SERVICE_TYPES: [&str; 2] = [
    "_adb-tls-connect._tcp.local.",
    "_adb_secure_connect._tcp.local.",
];

/// Deduplicates resolved services by `ip:port`, keeping discovery order.
#[derive(Debug, Default)]
pub struct DeviceCollector {
    devices: Vec<DiscoveredDevice>,
}

impl DeviceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the device only the first time its address is seen.
    pub fn record(&mut self, ip: &str, port: u16, name: &str) -> Option<DiscoveredDevice> {
        if ip.is_empty() || port == 0 {
            return None;
        }
        let address = format!("{ip}:{port}");
        if self.devices.iter().any(|device| device.address == address) {
            return None;
        }
        let device = DiscoveredDevice {
            ip: ip.to_string(),
            port,
            name: name.to_string(),
            address,
        };
        self.devices.push(device.clone());
        Some(device)
    }

    pub fn into_devices(self) -> Vec<DiscoveredDevice> {
        self.devices
    }
}

/// Browses both ADB service types until `duration` elapses or `stop` is raised.
pub fn discover_adb_services(
    duration: Duration,
    stop: Option<&AtomicBool>,
    mut on_found: impl FnMut(&DiscoveredDevice),
    trace_id: &str,
) -> Result<Vec<DiscoveredDevice>, AppError> {
    let daemon = ServiceDaemon::new()
        .map_err(|err| AppError::system(format!("Failed to start mDNS: {err}"), trace_id))?;
    let mut receivers = Vec::new();
    for service_type in ADB_SERVICE_TYPES {
        match daemon.browse(service_type) {
            Ok(receiver) => receivers.push(receiver),
            Err(err) => warn!(
                trace_id = %trace_id,
                service_type = %service_type,
                error = %err,
                "failed to browse mDNS service"
            ),
        }
    }
    if receivers.is_empty() {
        let _ = daemon.shutdown();
        return Err(AppError::system("mDNS browse failed", trace_id));
    }

    let mut collector = DeviceCollector::new();
    let start = Instant::now();
    while start.elapsed() < duration {
        if stop.map(|flag| flag.load(Ordering::Relaxed)).unwrap_or(false) {
            debug!(trace_id = %trace_id, "discovery stopped early");
            break;
        }
        let mut idle = true;
        for receiver in &receivers {
            while let Ok(event) = receiver.try_recv() {
                idle = false;
                let ServiceEvent::ServiceResolved(info) = event else {
                    continue;
                };
                let port = info.get_port();
                for addr in info.get_addresses().iter() {
                    let ip = addr.to_string();
                    if ip.contains(':') {
                        continue;
                    }
                    if let Some(device) = collector.record(&ip, port, info.get_fullname()) {
                        info!(trace_id = %trace_id, address = %device.address, "found adb service");
                        on_found(&device);
                    }
                }
            }
        }
        if idle {
            thread::sleep(Duration::from_millis(50));
        }
    }

    let _ = daemon.shutdown();
    Ok(collector.into_devices())
}

/// Port of the wireless-debugging service advertised by `ip`, if any shows up in time.
pub fn find_service_port(ip: &str, timeout: Duration, trace_id: &str) -> Option<u16> {
    let stop = AtomicBool::new(false);
    let mut port = None;
    let result = discover_adb_services(
        timeout,
        Some(&stop),
        |device| {
            if device.ip == ip && port.is_none() {
                port = Some(device.port);
                stop.store(true, Ordering::Relaxed);
            }
        },
        trace_id,
    );
    if let Err(err) = result {
        warn!(trace_id = %trace_id, error = %err, "mDNS port lookup failed");
    }
    port
}

pub fn load_devices(path: &Path) -> Vec<DiscoveredDevice> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str::<BTreeMap<String, DiscoveredDevice>>(&raw) {
        Ok(map) => map.into_values().collect(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable devices file");
            Vec::new()
        }
    }
}

/// Overwrites the file; an empty scan clears the saved list.
pub fn save_devices(path: &Path, devices: &[DiscoveredDevice], trace_id: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let map: BTreeMap<String, DiscoveredDevice> = devices
        .iter()
        .map(|device| (device.address.clone(), device.clone()))
        .collect();
    let payload = serde_json::to_string_pretty(&map)
        .map_err(|err| AppError::system(format!("Failed to serialize devices: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write devices: {err}"), trace_id))?;
    Ok(())
}
