//! Serial device discovery.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use super::{RadioConnector, SelfInfo};

#[cfg(target_os = "macos")]
const MAC_PREFIXES: &[&str] = &["cu.usb", "cu.wchusbserial", "cu.SLAB_USBtoUART"];
#[cfg_attr(target_os = "macos", allow(dead_code))]
const LINUX_PREFIXES: &[&str] = &["ttyACM", "ttyUSB"];
#[cfg_attr(target_os = "macos", allow(dead_code))]
const BY_ID_DIR: &str = "/dev/serial/by-id";

/// Entries of `dir` whose file name starts with one of `prefixes`.
fn entries_with_prefixes(dir: &Path, prefixes: &[&str]) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|name| prefixes.iter().any(|p| name.starts_with(p)))
                .unwrap_or(false)
        })
        .collect()
}

/// Candidate device paths, sorted.
///
/// On Linux the persistent `/dev/serial/by-id` names come first in preference; raw
/// `ttyACM*`/`ttyUSB*` nodes are only added when no by-id link already points at them.
pub fn detect_serial_devices() -> Vec<String> {
    #[cfg(target_os = "macos")]
    {
        let mut devices: Vec<String> = entries_with_prefixes(Path::new("/dev"), MAC_PREFIXES)
            .into_iter()
            .map(|p| p.display().to_string())
            .collect();
        devices.sort();
        devices
    }
    #[cfg(not(target_os = "macos"))]
    {
        detect_linux_devices(Path::new(BY_ID_DIR), Path::new("/dev"))
    }
}

#[cfg_attr(target_os = "macos", allow(dead_code))]
fn detect_linux_devices(by_id: &Path, dev: &Path) -> Vec<String> {
    let mut devices: Vec<PathBuf> = match std::fs::read_dir(by_id) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    };

    let resolved: HashSet<PathBuf> = devices
        .iter()
        .filter_map(|p| std::fs::canonicalize(p).ok())
        .collect();

    for candidate in entries_with_prefixes(dev, LINUX_PREFIXES) {
        let canonical = std::fs::canonicalize(&candidate).unwrap_or_else(|_| candidate.clone());
        if !resolved.contains(&canonical) {
            devices.push(candidate);
        }
    }

    let mut devices: Vec<String> = devices.into_iter().map(|p| p.display().to_string()).collect();
    devices.sort();
    devices
}

/// Open `path` and return its self info if a radio answers within `timeout`.
/// The probe session is closed again either way.
pub async fn probe_device(
    connector: &dyn RadioConnector,
    path: &str,
    timeout: Duration,
) -> Option<SelfInfo> {
    debug!("Testing serial device {}", path);
    match tokio::time::timeout(timeout, connector.open(path, timeout)).await {
        Ok(Ok(session)) => {
            let info = session.self_info().clone();
            session.disconnect().await;
            if info.public_key.is_empty() {
                debug!("Device {} answered without self info", path);
                None
            } else {
                debug!("Device {} responded with valid self info", path);
                Some(info)
            }
        }
        Ok(Err(e)) => {
            debug!("Device {} failed: {}", path, e);
            None
        }
        Err(_) => {
            debug!("Device {} timed out", path);
            None
        }
    }
}

/// First candidate path with a responding radio.
pub async fn find_radio_port(connector: &dyn RadioConnector, timeout: Duration) -> Option<String> {
    let devices = connector.candidate_paths();
    if devices.is_empty() {
        warn!("No serial devices found");
        return None;
    }
    info!(
        "Found {} serial device(s), testing for MeshCore radio...",
        devices.len()
    );

    for device in devices {
        if probe_device(connector, &device, timeout).await.is_some() {
            info!("Found MeshCore radio at {}", device);
            return Some(device);
        }
    }
    warn!("No MeshCore radio found on any serial device");
    None
}
