//! Audio device enumeration and USB port arbitration.
//!
//! The [`DeviceManager`] wraps cpal's host: it enumerates inputs and
//! outputs, tracks the active output selection and owns the process-wide
//! [`UsbReservationTable`]. The table is the single authority for USB
//! ownership: a USB-bound source reserves its port during initialize and
//! the reservation is released on dispose, so two sources can never open
//! the same capture port.

use std::collections::HashMap;

use cpal::traits::{DeviceTrait, HostTrait};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// A reservation table entry owner is a source id.
type OwnerId = String;

/// Linearizable map from USB port path to owning source.
///
/// All access goes through one mutex, so `reserve`, `release` and
/// `is_in_use` observe a single total order: of two concurrent
/// reservations for the same path exactly one succeeds.
#[derive(Debug, Default)]
pub struct UsbReservationTable {
    ports: Mutex<HashMap<String, OwnerId>>,
}

impl UsbReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `port_path` for `owner_id`.
    ///
    /// Re-reserving a port you already hold is a no-op; a port held by
    /// anyone else fails with `Conflict`.
    pub fn reserve(&self, port_path: &str, owner_id: &str) -> Result<()> {
        if port_path.is_empty() {
            return Err(Error::invalid_argument("port path must be non-empty"));
        }
        let mut ports = self.ports.lock();
        match ports.get(port_path) {
            Some(owner) if owner == owner_id => Ok(()),
            Some(owner) => Err(Error::conflict(format!(
                "port {port_path} is reserved by {owner}"
            ))),
            None => {
                ports.insert(port_path.to_string(), owner_id.to_string());
                tracing::debug!(port = port_path, owner = owner_id, "usb port reserved");
                Ok(())
            }
        }
    }

    /// Release a port. No-op when the port is not held.
    pub fn release(&self, port_path: &str) {
        if self.ports.lock().remove(port_path).is_some() {
            tracing::debug!(port = port_path, "usb port released");
        }
    }

    /// Release every port held by `owner_id` (source disposal).
    pub fn release_owned_by(&self, owner_id: &str) {
        self.ports.lock().retain(|_, owner| owner != owner_id);
    }

    pub fn is_in_use(&self, port_path: &str) -> bool {
        self.ports.lock().contains_key(port_path)
    }

    pub fn owner(&self, port_path: &str) -> Option<OwnerId> {
        self.ports.lock().get(port_path).cloned()
    }

    /// Snapshot of all reservations (port -> owner).
    pub fn snapshot(&self) -> Vec<(String, OwnerId)> {
        let mut entries: Vec<_> = self
            .ports
            .lock()
            .iter()
            .map(|(port, owner)| (port.clone(), owner.clone()))
            .collect();
        entries.sort();
        entries
    }
}

/// Direction of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DeviceDirection {
    Input,
    Output,
}

/// An enumerated audio device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceInfo {
    /// Stable id (host device name; unique per host)
    pub id: String,
    pub name: String,
    pub direction: DeviceDirection,
    pub is_default: bool,
    pub max_channels: u16,
    pub sample_rates: Vec<u32>,
    pub is_usb: bool,
    /// Synthesized port path for USB devices, used by the reservation table
    pub usb_port_path: Option<String>,
}

/// Enumerates devices and holds the active output selection.
pub struct DeviceManager {
    outputs: RwLock<Vec<DeviceInfo>>,
    inputs: RwLock<Vec<DeviceInfo>>,
    active_output: RwLock<Option<DeviceInfo>>,
    /// Bumped on every output change; the local output polls it to
    /// rebuild its stream at a one-frame boundary
    output_generation: std::sync::atomic::AtomicU64,
    reservations: UsbReservationTable,
}

impl DeviceManager {
    /// Create a manager and run an initial enumeration.
    pub fn new() -> Self {
        let manager = Self {
            outputs: RwLock::new(Vec::new()),
            inputs: RwLock::new(Vec::new()),
            active_output: RwLock::new(None),
            output_generation: std::sync::atomic::AtomicU64::new(0),
            reservations: UsbReservationTable::new(),
        };
        manager.refresh();
        manager
    }

    /// Re-enumerate all devices. Enumeration failures leave the previous
    /// lists in place and log.
    pub fn refresh(&self) {
        let host = cpal::default_host();

        let default_output_name = host
            .default_output_device()
            .and_then(|d| d.name().ok());
        match host.output_devices() {
            Ok(devices) => {
                let list: Vec<DeviceInfo> = devices
                    .filter_map(|d| {
                        describe_output(&d, default_output_name.as_deref())
                    })
                    .collect();
                tracing::info!("Enumerated {} output devices", list.len());
                *self.outputs.write() = list;
            }
            Err(e) => tracing::warn!("Output enumeration failed: {e}"),
        }

        let default_input_name = host
            .default_input_device()
            .and_then(|d| d.name().ok());
        match host.input_devices() {
            Ok(devices) => {
                let list: Vec<DeviceInfo> = devices
                    .filter_map(|d| describe_input(&d, default_input_name.as_deref()))
                    .collect();
                tracing::info!("Enumerated {} input devices", list.len());
                *self.inputs.write() = list;
            }
            Err(e) => tracing::warn!("Input enumeration failed: {e}"),
        }
    }

    pub fn list_outputs(&self) -> Vec<DeviceInfo> {
        self.outputs.read().clone()
    }

    pub fn list_inputs(&self) -> Vec<DeviceInfo> {
        self.inputs.read().clone()
    }

    pub fn default_output(&self) -> Option<DeviceInfo> {
        self.outputs.read().iter().find(|d| d.is_default).cloned()
    }

    /// Select the active output device by id.
    ///
    /// The swap itself is atomic; the local output picks it up at its
    /// next stream rebuild, which re-primes within one frame.
    pub fn set_output(&self, device_id: &str) -> Result<DeviceInfo> {
        if device_id.trim().is_empty() {
            return Err(Error::invalid_argument("device id must be non-empty"));
        }
        let device = self
            .outputs
            .read()
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("output device {device_id}")))?;
        *self.active_output.write() = Some(device.clone());
        self.output_generation
            .fetch_add(1, std::sync::atomic::Ordering::Release);
        tracing::info!(device = %device.name, "active output changed");
        Ok(device)
    }

    pub fn active_output(&self) -> Option<DeviceInfo> {
        self.active_output.read().clone()
    }

    /// Monotonic counter bumped on every `set_output`.
    pub fn output_generation(&self) -> u64 {
        self.output_generation
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Find the cpal capture device matching a reserved USB port path.
    pub fn find_input_by_port(&self, port_path: &str) -> Option<DeviceInfo> {
        self.inputs
            .read()
            .iter()
            .find(|d| d.usb_port_path.as_deref() == Some(port_path))
            .cloned()
    }

    pub fn reservations(&self) -> &UsbReservationTable {
        &self.reservations
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_output(device: &cpal::Device, default_name: Option<&str>) -> Option<DeviceInfo> {
    let name = device.name().ok()?;
    let mut max_channels = 0u16;
    let mut sample_rates = Vec::new();
    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            max_channels = max_channels.max(config.channels());
            push_unique(&mut sample_rates, config.min_sample_rate().0);
            push_unique(&mut sample_rates, config.max_sample_rate().0);
        }
    }
    Some(describe(name, DeviceDirection::Output, default_name, max_channels, sample_rates))
}

fn describe_input(device: &cpal::Device, default_name: Option<&str>) -> Option<DeviceInfo> {
    let name = device.name().ok()?;
    let mut max_channels = 0u16;
    let mut sample_rates = Vec::new();
    if let Ok(configs) = device.supported_input_configs() {
        for config in configs {
            max_channels = max_channels.max(config.channels());
            push_unique(&mut sample_rates, config.min_sample_rate().0);
            push_unique(&mut sample_rates, config.max_sample_rate().0);
        }
    }
    Some(describe(name, DeviceDirection::Input, default_name, max_channels, sample_rates))
}

fn describe(
    name: String,
    direction: DeviceDirection,
    default_name: Option<&str>,
    max_channels: u16,
    mut sample_rates: Vec<u32>,
) -> DeviceInfo {
    sample_rates.sort_unstable();
    let is_usb = looks_like_usb(&name);
    DeviceInfo {
        id: name.clone(),
        is_default: default_name == Some(name.as_str()),
        usb_port_path: is_usb.then(|| usb_port_path_for(&name)),
        name,
        direction,
        max_channels,
        sample_rates,
        is_usb,
    }
}

fn push_unique(rates: &mut Vec<u32>, rate: u32) {
    if !rates.contains(&rate) {
        rates.push(rate);
    }
}

/// Heuristic: hosts expose USB interfaces with "USB" in the device name.
fn looks_like_usb(name: &str) -> bool {
    name.to_ascii_uppercase().contains("USB")
}

/// Stable synthesized port path for a USB device name.
fn usb_port_path_for(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("usb:{slug}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    #[test]
    fn test_reserve_release_cycle() {
        let table = UsbReservationTable::new();
        assert!(!table.is_in_use("/dev/ttyUSB0"));

        table.reserve("/dev/ttyUSB0", "S1").unwrap();
        assert!(table.is_in_use("/dev/ttyUSB0"));

        let err = table.reserve("/dev/ttyUSB0", "S2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        table.release("/dev/ttyUSB0");
        assert!(!table.is_in_use("/dev/ttyUSB0"));
        table.reserve("/dev/ttyUSB0", "S2").unwrap();
    }

    #[test]
    fn test_reserve_is_idempotent_per_owner() {
        let table = UsbReservationTable::new();
        table.reserve("usb:deck", "S1").unwrap();
        table.reserve("usb:deck", "S1").unwrap();
        assert_eq!(table.owner("usb:deck").as_deref(), Some("S1"));
    }

    #[test]
    fn test_release_unheld_is_noop() {
        let table = UsbReservationTable::new();
        table.release("usb:ghost");
        assert!(!table.is_in_use("usb:ghost"));
    }

    #[test]
    fn test_release_owned_by() {
        let table = UsbReservationTable::new();
        table.reserve("usb:a", "S1").unwrap();
        table.reserve("usb:b", "S1").unwrap();
        table.reserve("usb:c", "S2").unwrap();
        table.release_owned_by("S1");
        assert!(!table.is_in_use("usb:a"));
        assert!(!table.is_in_use("usb:b"));
        assert!(table.is_in_use("usb:c"));
    }

    #[test]
    fn test_concurrent_reservation_single_winner() {
        let table = Arc::new(UsbReservationTable::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                table.reserve("/dev/ttyUSB0", &format!("S{i}")).is_ok()
            }));
        }
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&b| b)
            .count();
        assert_eq!(successes, 1);
        assert!(table.is_in_use("/dev/ttyUSB0"));
    }

    #[test]
    fn test_usb_heuristics() {
        assert!(looks_like_usb("USB Audio CODEC"));
        assert!(!looks_like_usb("Built-in Output"));
        assert_eq!(usb_port_path_for("USB Audio CODEC"), "usb:usb-audio-codec");
    }
}
