//! Well-known device nodes emulated by empty files under `dev/`.

use std::collections::HashMap;

use crate::vfs::attrs::{S_IFBLK, S_IFCHR};
use crate::vfs::VfsPath;

/// Final component of the directory whose entries may be devices.
pub const DEVICE_DIR: &str = "dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block,
    Char,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub kind: DeviceKind,
    pub major: u32,
    pub minor: u32,
}

impl Device {
    /// Guest device number: `major << 8 | minor`.
    pub fn rdev(&self) -> u32 {
        (self.major << 8) | self.minor
    }

    /// Mode format bits for this kind of device.
    pub fn format(&self) -> u32 {
        match self.kind {
            DeviceKind::Block => S_IFBLK,
            DeviceKind::Char => S_IFCHR,
        }
    }
}

const BLOCK_DEVICES: &[(&str, u32, u32)] = &[
    ("fd0a", 1, 0),
    ("fd0b", 1, 1),
    ("od0a", 2, 0),
    ("od0b", 2, 1),
    ("sd0a", 6, 0),
    ("sd0b", 6, 1),
    ("sd0c", 6, 2),
    ("sd0d", 6, 3),
    ("sd0e", 6, 4),
    ("sd0f", 6, 5),
    ("sd0g", 6, 6),
    ("sd0h", 6, 7),
    ("sd1a", 6, 8),
    ("sd1b", 6, 9),
];

const CHAR_DEVICES: &[(&str, u32, u32)] = &[
    ("console", 0, 0),
    ("tty", 2, 0),
    ("mem", 3, 0),
    ("kmem", 3, 1),
    ("null", 3, 2),
    ("klog", 6, 0),
    ("ttya", 11, 0),
    ("ttyb", 11, 1),
    ("rsd0a", 14, 0),
    ("rsd0b", 14, 1),
    ("rsd0c", 14, 2),
    ("rsd0h", 14, 7),
    ("rsd1a", 14, 8),
    ("rfd0a", 41, 0),
    ("rfd0b", 41, 1),
];

/// Device name lookup. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct DeviceTable {
    devices: HashMap<&'static str, Device>,
}

impl DeviceTable {
    pub fn new() -> Self {
        let mut devices = HashMap::new();
        for (kind, list) in [
            (DeviceKind::Block, BLOCK_DEVICES),
            (DeviceKind::Char, CHAR_DEVICES),
        ] {
            for &(name, major, minor) in list {
                devices.insert(name, Device { kind, major, minor });
            }
        }
        Self { devices }
    }

    /// The device `path` names, if its parent is a `dev` directory and its
    /// file name is a known device.
    pub fn lookup(&self, path: &VfsPath) -> Option<Device> {
        if path.parent().file_name() != Some(DEVICE_DIR) {
            return None;
        }
        self.devices.get(path.file_name()?).copied()
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}
