use std::path::Path;

use crate::app::config::AdbSettings;
use crate::app::error::TransportError;

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Resolves the configured adb executable; empty means `adb` from PATH.
pub fn resolve_adb_program(settings: &AdbSettings) -> Result<String, TransportError> {
    let normalized = normalize_command_path(&settings.command_path);
    if normalized.is_empty() || normalized == "adb" {
        return Ok("adb".to_string());
    }
    let path = Path::new(&normalized);
    if path.is_dir() {
        return Err(TransportError::refused(
            "adb path must point to an executable file",
        ));
    }
    if !path.exists() {
        return Err(TransportError::refused(format!(
            "adb executable not found at {normalized}"
        )));
    }
    Ok(normalized)
}

/// `host:port`, bracketing bare IPv6 literals.
pub fn endpoint(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// `-s <serial>` when a device is pinned in the config.
pub fn device_selector(settings: &AdbSettings) -> Vec<String> {
    let serial = settings.serial.trim();
    if serial.is_empty() {
        Vec::new()
    } else {
        vec!["-s".to_string(), serial.to_string()]
    }
}
