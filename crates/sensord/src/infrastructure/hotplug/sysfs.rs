//! Sysfs classification and diffing of USB interfaces.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{HotplugAction, HotplugError, HotplugEvent};

/// USB vendor ID of the smart sensor boards.
pub const SMART_SENSOR_VENDOR_ID: u16 = 0x2341;
/// USB product ID of the smart sensor boards.
pub const SMART_SENSOR_PRODUCT_ID: u16 = 0x8037;

/// Default root of the USB device tree.
pub const USB_DEVICES_ROOT: &str = "/sys/bus/usb/devices";
/// Default directory holding serial device nodes.
pub const DEV_ROOT: &str = "/dev";

// ── Classification ────────────────────────────────────────────────────────────

/// Parses a `uevent` file into its `KEY=value` pairs.
pub fn parse_uevent(contents: &str) -> HashMap<&str, &str> {
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

/// Parses a `PRODUCT=vid/pid/bcd` value (hex, no leading zeros) into `(vid, pid)`.
pub fn parse_product(product: &str) -> Option<(u16, u16)> {
    let mut fields = product.split('/');
    let vendor = u16::from_str_radix(fields.next()?, 16).ok()?;
    let product = u16::from_str_radix(fields.next()?, 16).ok()?;
    Some((vendor, product))
}

/// Whether a `uevent` describes a smart sensor USB interface.
pub fn is_smart_sensor(uevent: &str) -> bool {
    let fields = parse_uevent(uevent);
    fields.get("DEVTYPE") == Some(&"usb_interface")
        && fields
            .get("PRODUCT")
            .and_then(|p| parse_product(p))
            .is_some_and(|ids| ids == (SMART_SENSOR_VENDOR_ID, SMART_SENSOR_PRODUCT_ID))
}

/// Serial device paths belonging to the interface at `device_path`.
///
/// Candidates are `tty*` children of the interface, either direct or under a
/// `tty/` subdirectory, mapped into `dev_root`.  Only candidates that also
/// appear in `enumerated` are returned, sorted.
pub fn resolve_ports(device_path: &Path, dev_root: &Path, enumerated: &HashSet<String>) -> Vec<String> {
    let mut ports: Vec<String> = [device_path.to_path_buf(), device_path.join("tty")]
        .iter()
        .filter_map(|dir| fs::read_dir(dir).ok())
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("tty") && name.len() > "tty".len())
        .map(|name| dev_root.join(name).to_string_lossy().into_owned())
        .filter(|port| enumerated.contains(port))
        .collect();
    ports.sort();
    ports.dedup();
    ports
}

/// Serial ports the operating system currently lists.
pub fn enumerate_serial_ports() -> HashSet<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            debug!("serial port enumeration failed: {e}");
            HashSet::new()
        }
    }
}

/// Bus address the kernel gave a USB device when it enumerated.
///
/// A device that is unplugged and plugged back in (or resets) between two
/// scans keeps its sysfs path but gets a new device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbAddress {
    pub busnum: u32,
    pub devnum: u32,
}

/// Reads the address of the USB device that owns the interface at
/// `interface_path`, from the parent device's `busnum` and `devnum` files.
///
/// Interface directories are named `<device>:<config>.<interface>`; the
/// parent device is the sibling named `<device>`.
pub fn usb_address(interface_path: &Path) -> Option<UsbAddress> {
    let name = interface_path.file_name()?.to_str()?;
    let (device, _) = name.split_once(':')?;
    let parent = interface_path.parent()?.join(device);
    let read = |file: &str| -> Option<u32> { fs::read_to_string(parent.join(file)).ok()?.trim().parse().ok() };
    Some(UsbAddress {
        busnum: read("busnum")?,
        devnum: read("devnum")?,
    })
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// Diffs the USB device tree between scans.
#[derive(Debug)]
pub struct SysfsScanner {
    root: PathBuf,
    dev_root: PathBuf,
    /// Smart sensor interfaces seen so far.
    known: BTreeMap<PathBuf, KnownInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KnownInterface {
    /// Ports last announced.
    ports: Vec<String>,
    address: Option<UsbAddress>,
}

impl SysfsScanner {
    pub fn new(root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dev_root: dev_root.into(),
            known: BTreeMap::new(),
        }
    }

    /// Scanner over the live system tree.
    pub fn system() -> Self {
        Self::new(USB_DEVICES_ROOT, DEV_ROOT)
    }

    /// Smart sensor interfaces currently present.  Unreadable entries are
    /// skipped; only an unreadable root is an error.
    fn present(&self) -> Result<Vec<PathBuf>, HotplugError> {
        let entries = fs::read_dir(&self.root).map_err(|source| HotplugError::DeviceTree {
            path: self.root.clone(),
            source,
        })?;

        let mut found = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            match classify(&path) {
                Ok(true) => found.push(path),
                Ok(false) => {}
                Err(e) => trace!(path = %path.display(), "skipping unreadable device: {e}"),
            }
        }
        found.sort();
        Ok(found)
    }

    /// Compares the tree with the previous scan and returns the events that
    /// describe the difference.
    ///
    /// An interface first seen without ports is announced again once its
    /// ports show up.  An interface whose USB address changed since the last
    /// scan was re-enumerated and is reported as removed, then added.
    pub fn scan(&mut self, enumerated: &HashSet<String>) -> Result<Vec<HotplugEvent>, HotplugError> {
        let present = self.present()?;
        let mut events = Vec::new();

        let gone: Vec<PathBuf> = self
            .known
            .keys()
            .filter(|path| !present.contains(path))
            .cloned()
            .collect();
        for path in gone {
            self.known.remove(&path);
            debug!(path = %path.display(), "smart sensor removed");
            events.push(HotplugEvent::new(HotplugAction::Unbind, path.clone(), Vec::new()));
            events.push(HotplugEvent::new(HotplugAction::Remove, path, Vec::new()));
        }

        for path in present {
            let ports = resolve_ports(&path, &self.dev_root, enumerated);
            let address = usb_address(&path);
            match self.known.get(&path) {
                None => {
                    debug!(path = %path.display(), ?ports, "smart sensor added");
                    push_added(&mut events, &path, &ports);
                }
                Some(previous) if reenumerated(previous.address, address) => {
                    debug!(
                        path = %path.display(),
                        ?ports,
                        old = ?previous.address,
                        new = ?address,
                        "smart sensor re-enumerated"
                    );
                    events.push(HotplugEvent::new(HotplugAction::Unbind, path.clone(), Vec::new()));
                    events.push(HotplugEvent::new(HotplugAction::Remove, path.clone(), Vec::new()));
                    push_added(&mut events, &path, &ports);
                }
                Some(previous) if previous.ports.is_empty() && !ports.is_empty() => {
                    debug!(path = %path.display(), ?ports, "smart sensor ports appeared");
                    events.push(HotplugEvent::new(HotplugAction::Add, path.clone(), ports.clone()));
                }
                Some(_) => {
                    if let (Some(known), Some(_)) = (self.known.get_mut(&path), address) {
                        known.address = address;
                    }
                    continue;
                }
            }
            self.known.insert(path, KnownInterface { ports, address });
        }
        Ok(events)
    }

    /// Drops `path` from the known set so the next scan announces it again.
    pub fn forget(&mut self, path: &Path) {
        self.known.remove(path);
    }
}

fn push_added(events: &mut Vec<HotplugEvent>, path: &Path, ports: &[String]) {
    events.push(HotplugEvent::new(HotplugAction::Add, path, ports.to_vec()));
    events.push(HotplugEvent::new(HotplugAction::Bind, path, Vec::new()));
}

/// Only two readable addresses that differ count; a failed read never does.
fn reenumerated(previous: Option<UsbAddress>, current: Option<UsbAddress>) -> bool {
    matches!((previous, current), (Some(a), Some(b)) if a != b)
}

fn classify(path: &Path) -> io::Result<bool> {
    let uevent = fs::read_to_string(path.join("uevent"))?;
    Ok(is_smart_sensor(&uevent))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
