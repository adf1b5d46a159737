//! Serial device discovery.
//!
//! Enumeration is fresh on every call. Candidates that look like the SMU
//! (known vendor id, or a descriptor matching the name pattern) are preferred;
//! when nothing looks like it the whole list is returned so the user can still
//! pick by hand.

use super::error::ScanError;
use regex::Regex;
use serde::Serialize;
use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

/// Raspberry Pi (RP2040 based boards, including the Pico SMU).
pub const VID_RASPBERRY_PI: u16 = 0x2E8A;

pub const DEFAULT_NAME_PATTERN: &str = "smu|pico";

/// One enumerated serial device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    pub path: String,
    /// Human readable `"<path>: <description>"`.
    pub label: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    /// Whether the device matched the SMU heuristic.
    pub matched: bool,
}

/// Source of raw port information.
#[cfg_attr(test, mockall::automock)]
pub trait PortEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<SerialPortInfo>, ScanError>;
}

/// Enumerates ports through the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnumerator;

impl PortEnumerator for SystemEnumerator {
    fn enumerate(&self) -> Result<Vec<SerialPortInfo>, ScanError> {
        Ok(serialport::available_ports()?)
    }
}

/// Heuristic used to recognise the instrument.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub vendor_ids: Vec<u16>,
    pub name_pattern: Regex,
}

impl DeviceFilter {
    /// Build a filter; `pattern` is matched case-insensitively.
    pub fn new(vendor_ids: Vec<u16>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            vendor_ids,
            name_pattern: Regex::new(&format!("(?i){pattern}"))?,
        })
    }

    fn matches(&self, descriptor: &PortDescriptor) -> bool {
        descriptor
            .vid
            .map(|vid| self.vendor_ids.contains(&vid))
            .unwrap_or(false)
            || self.name_pattern.is_match(&descriptor.label)
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            vendor_ids: vec![VID_RASPBERRY_PI],
            name_pattern: Regex::new(&format!("(?i){DEFAULT_NAME_PATTERN}"))
                .expect("built-in device pattern compiles"),
        }
    }
}

fn describe(info: SerialPortInfo) -> PortDescriptor {
    let (description, vid, pid) = match info.port_type {
        SerialPortType::UsbPort(usb) => {
            let parts: Vec<&str> = [usb.manufacturer.as_deref(), usb.product.as_deref()]
                .into_iter()
                .flatten()
                .filter(|s| !s.is_empty())
                .collect();
            let text = if parts.is_empty() {
                "USB Serial".to_string()
            } else {
                parts.join(" ")
            };
            (text, Some(usb.vid), Some(usb.pid))
        }
        SerialPortType::PciPort => ("PCI".to_string(), None, None),
        SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None),
        SerialPortType::Unknown => ("Serial".to_string(), None, None),
    };

    PortDescriptor {
        label: format!("{}: {}", info.port_name, description),
        path: info.port_name,
        vid,
        pid,
        matched: false,
    }
}

/// Lists candidate ports through a `PortEnumerator`.
pub struct PortScanner {
    enumerator: Box<dyn PortEnumerator>,
    filter: DeviceFilter,
}

impl PortScanner {
    pub fn new(enumerator: Box<dyn PortEnumerator>, filter: DeviceFilter) -> Self {
        Self { enumerator, filter }
    }

    /// Candidate ports sorted by path.
    ///
    /// Only matching devices are returned when at least one matches;
    /// otherwise every enumerated device is. No devices is an empty list.
    pub fn list_candidates(&self) -> Result<Vec<PortDescriptor>, ScanError> {
        let mut all: Vec<PortDescriptor> = self
            .enumerator
            .enumerate()?
            .into_iter()
            .map(describe)
            .map(|mut d| {
                d.matched = self.filter.matches(&d);
                d
            })
            .collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));

        let total = all.len();
        if all.iter().any(|d| d.matched) {
            all.retain(|d| d.matched);
        }
        debug!(total, candidates = all.len(), "port scan finished");
        Ok(all)
    }

    /// First candidate that matched the heuristic, if any.
    pub fn best_match(&self) -> Result<Option<PortDescriptor>, ScanError> {
        Ok(self.list_candidates()?.into_iter().find(|d| d.matched))
    }
}

impl std::fmt::Debug for PortScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortScanner")
            .field("filter", &self.filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb(path: &str, vid: u16, product: Option<&str>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: path.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid: 0x000A,
                serial_number: None,
                manufacturer: None,
                product: product.map(str::to_string),
            }),
        }
    }

    fn plain(path: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: path.to_string(),
            port_type: SerialPortType::Unknown,
        }
    }

    fn scanner_over(ports: Vec<SerialPortInfo>) -> PortScanner {
        let mut mock = MockPortEnumerator::new();
        mock.expect_enumerate().returning(move || Ok(ports.clone()));
        PortScanner::new(Box::new(mock), DeviceFilter::default())
    }

    #[test]
    fn test_matching_devices_only_when_present() {
        let scanner = scanner_over(vec![
            plain("/dev/ttyS0"),
            usb("/dev/ttyACM1", VID_RASPBERRY_PI, None),
            usb("/dev/ttyUSB0", 0x0403, Some("FT232R")),
        ]);

        let candidates = scanner.list_candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].path, "/dev/ttyACM1");
        assert_eq!(candidates[0].label, "/dev/ttyACM1: USB Serial");
        assert!(candidates[0].matched);
    }

    #[test]
    fn test_fail_open_when_nothing_matches() {
        let scanner = scanner_over(vec![usb("/dev/ttyUSB1", 0x0403, None), plain("/dev/ttyS0")]);

        let candidates = scanner.list_candidates().unwrap();
        let paths: Vec<_> = candidates.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/ttyS0", "/dev/ttyUSB1"]);
        assert!(scanner.best_match().unwrap().is_none());
    }

    #[test]
    fn test_descriptor_pattern_is_case_insensitive() {
        let scanner = scanner_over(vec![
            usb("COM4", 0x1234, Some("Bench SMU")),
            usb("COM3", 0x0403, Some("FT232R")),
        ]);

        let best = scanner.best_match().unwrap().unwrap();
        assert_eq!(best.path, "COM4");
        assert_eq!(best.label, "COM4: Bench SMU");
    }

    #[test]
    fn test_empty_enumeration_is_not_an_error() {
        let scanner = scanner_over(Vec::new());
        assert!(scanner.list_candidates().unwrap().is_empty());
    }

    #[test]
    fn test_enumeration_failure() {
        let mut mock = MockPortEnumerator::new();
        mock.expect_enumerate()
            .returning(|| Err(ScanError::Other("no udev".into())));
        let scanner = PortScanner::new(Box::new(mock), DeviceFilter::default());
        assert!(scanner.list_candidates().is_err());
    }

    #[test]
    fn test_custom_filter() {
        let filter = DeviceFilter::new(vec![0x0403], "never").unwrap();
        let mut mock = MockPortEnumerator::new();
        mock.expect_enumerate()
            .returning(|| Ok(vec![usb("/dev/ttyUSB0", 0x0403, None)]));
        let scanner = PortScanner::new(Box::new(mock), filter);
        assert!(scanner.best_match().unwrap().is_some());
    }
}
