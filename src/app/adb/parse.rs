use regex::Regex;

use crate::app::models::DeviceSummary;

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let serial = tokens[0].to_string();
            let state = tokens[1].to_string();
            let mut model = None;
            let mut product = None;
            let mut device = None;
            let mut transport_id = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("device:") {
                    device = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    transport_id = Some(value.to_string());
                }
            }
            Some(DeviceSummary {
                serial,
                state,
                model,
                product,
                device,
                transport_id,
            })
        })
        .collect()
}

pub fn parse_settings_bool(output: &str) -> Option<bool> {
    let value = output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())?;
    if let Ok(num) = value.parse::<i32>() {
        return Some(num != 0);
    }
    match value.to_lowercase().as_str() {
        "true" | "on" | "enabled" => Some(true),
        "false" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// First IPv4 address from `ip -f inet addr show <iface>`.
pub fn parse_inet_address(output: &str) -> Option<String> {
    let inet_re = Regex::new(r"\binet\s+(\d{1,3}(?:\.\d{1,3}){3})").ok()?;
    output
        .lines()
        .filter_map(|line| inet_re.captures(line))
        .map(|caps| caps[1].to_string())
        .find(|ip| ip != "127.0.0.1")
}

/// `getprop service.adb.tls.port`; empty, zero or garbage means the port is not published.
pub fn parse_port(output: &str) -> Option<u16> {
    let value = output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())?;
    match value.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

pub fn parse_adb_version(output: &str) -> Option<String> {
    let version_re = Regex::new(r"(?i)android debug bridge version\s+([0-9][0-9.]*)").ok()?;
    version_re
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// `adb connect` exits 0 even when it could not reach the target, so the text decides.
pub fn connect_succeeded(stdout: &str, stderr: &str) -> bool {
    let combined = format!("{stdout}{stderr}").to_lowercase();
    if combined.contains("failed") || combined.contains("unable") || combined.contains("cannot") {
        return false;
    }
    combined.contains("connected to") || combined.contains("already connected")
}
