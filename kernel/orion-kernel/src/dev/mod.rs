//! The device subsystem.
//!
//! Buses register by type name; drivers register against a bus type with
//! a `check_device` predicate. When a bus enumerates a device, each
//! candidate driver is asked in registration order and the first
//! accepting driver attaches and owns it. Accepted devices receive a
//! `(major, minor, unit)` identity — the minor from a per-major counter
//! — and are published on the device-events channel that the devfs
//! population thread consumes to synthesize `/dev` names.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write as _;

use orion_syscall::{Errno, Stat};

use crate::sync::{Condvar, Mutex, SpinMutex};

/// A device identity: `(major, minor, unit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceId {
    /// The device class.
    pub major: u32,
    /// The instance within the class.
    pub minor: u32,
    /// The sub-unit (partition); 0 for the whole device.
    pub unit: u8,
}

impl DeviceId {
    /// The `st_rdev` encoding.
    #[must_use]
    pub fn rdev(self) -> u64 {
        Stat::make_rdev(self.major, self.minor, self.unit)
    }
}

/// Block or character device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Block-addressed.
    Block,
    /// Byte-stream.
    Char,
}

/// The I/O surface a driver gives its devices.
pub trait DeviceOps: Send + Sync {
    /// Reads from the device at a byte offset.
    fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize, Errno>;
    /// Writes to the device at a byte offset.
    fn write(&self, off: u64, buf: &[u8]) -> Result<usize, Errno>;
    /// Device control.
    fn ioctl(&self, _request: u32, _arg: usize) -> Result<usize, Errno> {
        Err(Errno::ENOTTY)
    }
    /// Device size in bytes (block devices).
    fn size(&self) -> u64 {
        0
    }
}

/// What a bus reports about an unclaimed device.
#[derive(Debug, Clone)]
pub struct BusDeviceInfo {
    /// The enumerating bus type.
    pub bus: &'static str,
    /// Bus-specific identity (slot, port, address).
    pub ident: u64,
    /// Bus-specific class/vendor code drivers match on.
    pub class_code: u32,
}

/// A device driver: claims bus devices and builds [`Device`]s.
pub trait Driver: Send + Sync {
    /// Driver name.
    fn name(&self) -> &'static str;
    /// The bus type this driver serves.
    fn bus_type(&self) -> &'static str;
    /// Whether this driver claims the device.
    fn check_device(&self, dev: &BusDeviceInfo) -> bool;
    /// Attaches, returning the device kind, its class major, and ops.
    fn attach(&self, dev: &BusDeviceInfo) -> Result<(DeviceKind, u32, Box<dyn DeviceOps>), Errno>;
}

/// An attached device.
pub struct Device {
    /// Block or character.
    pub kind: DeviceKind,
    /// Assigned identity.
    pub id: DeviceId,
    /// The owning driver.
    pub driver: &'static str,
    /// The bus it came from, if any.
    pub bus: Option<&'static str>,
    /// The I/O surface.
    pub ops: Box<dyn DeviceOps>,
    /// Sub-devices (partitions).
    children: SpinMutex<Vec<Arc<Device>>>,
    /// Names synthesized for this device (devfs bookkeeping).
    entries: SpinMutex<Vec<String>>,
}

impl Device {
    /// Adds a sub-unit device (partition).
    pub fn add_child(&self, child: &Arc<Device>) {
        self.children.lock().push(child.clone());
    }

    /// Sub-devices.
    #[must_use]
    pub fn children(&self) -> Vec<Arc<Device>> {
        self.children.lock().clone()
    }

    /// Records a published name.
    pub fn add_entry(&self, name: &str) {
        self.entries.lock().push(String::from(name));
    }

    /// Published names.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Name synthesis
// ---------------------------------------------------------------------------

/// How minors map to name suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameScheme {
    /// Decimal minor suffix (`hd3`).
    Numbered,
    /// Base-26 letter suffix (`hda`, `hdb`, …, `hdaa`).
    Lettered,
}

/// A devfs naming registration for a device class.
#[derive(Debug, Clone)]
pub struct DeviceClass {
    /// The class major.
    pub major: u32,
    /// When set, only this minor matches — and gets the bare prefix.
    pub minor: Option<u32>,
    /// The name stem.
    pub prefix: &'static str,
    /// Suffix scheme for class-wide registrations.
    pub scheme: NameScheme,
}

/// Synthesizes the devfs name for a device under a class registration.
///
/// A specific-minor match yields the bare prefix. Otherwise the minor is
/// rendered per the scheme, and a nonzero unit appends `s<unit>`.
#[must_use]
pub fn device_name(class: &DeviceClass, id: DeviceId) -> Option<String> {
    if id.major != class.major {
        return None;
    }
    let mut name = String::from(class.prefix);
    match class.minor {
        Some(minor) => {
            if minor != id.minor {
                return None;
            }
        }
        None => match class.scheme {
            NameScheme::Numbered => {
                let _ = write!(name, "{}", id.minor);
            }
            NameScheme::Lettered => name.push_str(&letters(id.minor)),
        },
    }
    if id.unit != 0 {
        let _ = write!(name, "s{}", id.unit);
    }
    Some(name)
}

/// Base-26 suffix: 0 → "a", 25 → "z", 26 → "aa".
fn letters(mut n: u32) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'a' + (n % 26) as u8);
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    out.reverse();
    String::from_utf8(out).expect("ascii")
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// A device lifecycle event for the devfs population thread.
pub enum DeviceEvent {
    /// A device was attached.
    Added(Arc<Device>),
    /// A device went away.
    Removed(DeviceId),
}

struct Registry {
    buses: Vec<&'static str>,
    drivers: Vec<Arc<dyn Driver>>,
    devices: BTreeMap<(u32, u32, u8), Arc<Device>>,
    classes: Vec<DeviceClass>,
    /// Next minor per major.
    next_minor: BTreeMap<u32, u32>,
}

static REGISTRY: SpinMutex<Registry> = SpinMutex::named(
    "DEV_REGISTRY",
    Registry {
        buses: Vec::new(),
        drivers: Vec::new(),
        devices: BTreeMap::new(),
        classes: Vec::new(),
        next_minor: BTreeMap::new(),
    },
);

static EVENTS: Mutex<VecDeque<DeviceEvent>> = Mutex::named("DEV_EVENTS", VecDeque::new());
static EVENTS_COND: Condvar = Condvar::new("dev_events");

/// Registers a bus type by name.
pub fn register_bus(name: &'static str) {
    let mut reg = REGISTRY.lock();
    if !reg.buses.contains(&name) {
        reg.buses.push(name);
    }
}

/// Registers a driver against its bus type.
pub fn register_driver(driver: Arc<dyn Driver>) {
    REGISTRY.lock().drivers.push(driver);
}

/// Registers a devfs naming class.
pub fn register_class(class: DeviceClass) {
    REGISTRY.lock().classes.push(class);
}

/// Returns the class registrations (devfs naming).
#[must_use]
pub fn classes() -> Vec<DeviceClass> {
    REGISTRY.lock().classes.clone()
}

/// Looks up an attached device.
#[must_use]
pub fn lookup(id: DeviceId) -> Option<Arc<Device>> {
    REGISTRY.lock().devices.get(&(id.major, id.minor, id.unit)).cloned()
}

/// Offers a bus-enumerated device to the registered drivers.
///
/// The first driver whose `check_device` accepts attaches it; the new
/// device is assigned the next minor in its class and published on the
/// event channel. Returns the device, or `None` when no driver claims
/// it.
pub fn probe(info: &BusDeviceInfo) -> Option<Arc<Device>> {
    let candidates: Vec<Arc<dyn Driver>> = {
        let reg = REGISTRY.lock();
        reg.drivers
            .iter()
            .filter(|d| d.bus_type() == info.bus)
            .cloned()
            .collect()
    };

    for driver in candidates {
        if !driver.check_device(info) {
            continue;
        }
        let Ok((kind, major, ops)) = driver.attach(info) else {
            crate::kwarn!("dev: {} failed to attach {}:{:x}", driver.name(), info.bus, info.ident);
            continue;
        };
        let device = {
            let mut reg = REGISTRY.lock();
            let minor_slot = reg.next_minor.entry(major).or_insert(0);
            let minor = *minor_slot;
            *minor_slot += 1;
            let device = Arc::new(Device {
                kind,
                id: DeviceId { major, minor, unit: 0 },
                driver: driver.name(),
                bus: Some(info.bus),
                ops,
                children: SpinMutex::new(Vec::new()),
                entries: SpinMutex::new(Vec::new()),
            });
            reg.devices.insert((major, minor, 0), device.clone());
            device
        };
        crate::kinfo!(
            "dev: {} claimed {}:{:x} as ({}, {}, 0)",
            driver.name(),
            info.bus,
            info.ident,
            device.id.major,
            device.id.minor
        );
        publish(DeviceEvent::Added(device.clone()));
        return Some(device);
    }
    None
}

/// Registers a bus-less device (console, pseudo-devices) under `major`.
pub fn register_device(
    kind: DeviceKind,
    major: u32,
    ops: Box<dyn DeviceOps>,
    driver: &'static str,
) -> Arc<Device> {
    let device = {
        let mut reg = REGISTRY.lock();
        let minor_slot = reg.next_minor.entry(major).or_insert(0);
        let minor = *minor_slot;
        *minor_slot += 1;
        let device = Arc::new(Device {
            kind,
            id: DeviceId { major, minor, unit: 0 },
            driver,
            bus: None,
            ops,
            children: SpinMutex::new(Vec::new()),
            entries: SpinMutex::new(Vec::new()),
        });
        reg.devices.insert((major, minor, 0), device.clone());
        device
    };
    publish(DeviceEvent::Added(device.clone()));
    device
}

/// Pushes an event for the devfs thread.
fn publish(event: DeviceEvent) {
    EVENTS.lock().push_back(event);
    EVENTS_COND.signal();
}

/// Blocks until the next device event (the devfs population thread).
pub fn next_event() -> DeviceEvent {
    let mut queue = EVENTS.lock();
    loop {
        if let Some(event) = queue.pop_front() {
            return event;
        }
        queue = EVENTS_COND.wait(queue);
        #[cfg(not(target_os = "none"))]
        {
            // Host builds cannot block; behave like try_next_event.
            if queue.is_empty() {
                continue;
            }
        }
    }
}

/// Non-blocking event poll.
#[must_use]
pub fn try_next_event() -> Option<DeviceEvent> {
    EVENTS.lock().pop_front()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDev;
    impl DeviceOps for NullDev {
        fn read(&self, _off: u64, _buf: &mut [u8]) -> Result<usize, Errno> {
            Ok(0)
        }
        fn write(&self, _off: u64, buf: &[u8]) -> Result<usize, Errno> {
            Ok(buf.len())
        }
    }

    struct RamDriver;
    impl Driver for RamDriver {
        fn name(&self) -> &'static str {
            "rd"
        }
        fn bus_type(&self) -> &'static str {
            "testbus"
        }
        fn check_device(&self, dev: &BusDeviceInfo) -> bool {
            dev.class_code == 0x100
        }
        fn attach(&self, _dev: &BusDeviceInfo) -> Result<(DeviceKind, u32, Box<dyn DeviceOps>), Errno> {
            Ok((DeviceKind::Block, 1, Box::new(NullDev)))
        }
    }

    fn drain_events() {
        while try_next_event().is_some() {}
    }

    #[test]
    fn numbered_and_lettered_names() {
        let numbered = DeviceClass {
            major: 1,
            minor: None,
            prefix: "rd",
            scheme: NameScheme::Numbered,
        };
        assert_eq!(device_name(&numbered, DeviceId { major: 1, minor: 0, unit: 0 }).unwrap(), "rd0");
        assert_eq!(device_name(&numbered, DeviceId { major: 1, minor: 3, unit: 0 }).unwrap(), "rd3");
        assert_eq!(
            device_name(&numbered, DeviceId { major: 1, minor: 3, unit: 2 }).unwrap(),
            "rd3s2"
        );
        assert!(device_name(&numbered, DeviceId { major: 2, minor: 0, unit: 0 }).is_none());

        let lettered = DeviceClass {
            major: 8,
            minor: None,
            prefix: "hd",
            scheme: NameScheme::Lettered,
        };
        assert_eq!(device_name(&lettered, DeviceId { major: 8, minor: 0, unit: 0 }).unwrap(), "hda");
        assert_eq!(device_name(&lettered, DeviceId { major: 8, minor: 1, unit: 0 }).unwrap(), "hdb");
        assert_eq!(
            device_name(&lettered, DeviceId { major: 8, minor: 26, unit: 0 }).unwrap(),
            "hdaa"
        );
        assert_eq!(
            device_name(&lettered, DeviceId { major: 8, minor: 0, unit: 1 }).unwrap(),
            "hdas1"
        );
    }

    #[test]
    fn specific_minor_gets_bare_prefix() {
        let class = DeviceClass {
            major: 5,
            minor: Some(1),
            prefix: "console",
            scheme: NameScheme::Numbered,
        };
        assert_eq!(
            device_name(&class, DeviceId { major: 5, minor: 1, unit: 0 }).unwrap(),
            "console"
        );
        assert!(device_name(&class, DeviceId { major: 5, minor: 2, unit: 0 }).is_none());
    }

    #[test]
    fn probe_first_accepting_driver_wins() {
        register_bus("testbus");
        register_driver(Arc::new(RamDriver));

        // A device the driver rejects stays unclaimed.
        assert!(probe(&BusDeviceInfo { bus: "testbus", ident: 1, class_code: 0x999 }).is_none());

        // A matching device is claimed and published.
        let dev = probe(&BusDeviceInfo { bus: "testbus", ident: 2, class_code: 0x100 })
            .expect("claimed");
        assert_eq!(dev.kind, DeviceKind::Block);
        assert_eq!(dev.id.major, 1);
        assert_eq!(dev.driver, "rd");
        assert!(lookup(dev.id).is_some());

        // Minors increment per major.
        let dev2 = probe(&BusDeviceInfo { bus: "testbus", ident: 3, class_code: 0x100 })
            .expect("claimed");
        assert_eq!(dev2.id.minor, dev.id.minor + 1);
        drain_events();
    }

    #[test]
    fn events_are_published_in_order() {
        drain_events();
        let a = register_device(DeviceKind::Char, 900, Box::new(NullDev), "null");
        let b = register_device(DeviceKind::Char, 900, Box::new(NullDev), "null");

        let mut seen = Vec::new();
        while let Some(DeviceEvent::Added(d)) = try_next_event() {
            if d.id.major == 900 {
                seen.push(d.id.minor);
            }
        }
        assert_eq!(seen, vec![a.id.minor, b.id.minor]);
    }

    #[test]
    fn rdev_encoding_matches_identity() {
        let id = DeviceId { major: 1, minor: 0, unit: 0 };
        assert_eq!(Stat::split_rdev(id.rdev()), (1, 0, 0));
    }
}
