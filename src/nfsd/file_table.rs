//! Handle table: stable 64-bit handles for canonical guest paths.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::devices::{Device, DeviceTable};
use crate::vfs::attrs::S_IFMT;
use crate::vfs::{Errno, FileAttrs, HostResult, Stat, VfsPath, VirtualFs};

/// A [`VirtualFs`] plus the handle-to-path map and device emulation.
///
/// Every method that touches the map holds the table lock for its whole
/// body, host calls included, so a handle and the file it names are always
/// observed together. Plain [`VirtualFs`] calls via [`FileTable::vfs`] do
/// not take the lock.
#[derive(Debug)]
pub struct FileTable {
    vfs: VirtualFs,
    devices: DeviceTable,
    handles: Mutex<HashMap<u64, VfsPath>>,
}

impl FileTable {
    pub fn new(vfs: VirtualFs) -> Self {
        Self {
            vfs,
            devices: DeviceTable::new(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn vfs(&self) -> &VirtualFs {
        &self.vfs
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, VfsPath>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emulated device for `path`, if any.
    pub fn is_device(&self, path: &VfsPath) -> Option<Device> {
        self.devices.lookup(&self.vfs.canonical(path))
    }

    /// Merged stat; well-known device names without a stored device number
    /// report the device type and number from the device table.
    pub fn stat(&self, path: &VfsPath) -> HostResult<Stat> {
        let _guard = self.lock();
        let (mut st, overlay) = self.vfs.stat_with_overlay(path)?;
        if overlay.rdev.is_none() {
            if let Some(dev) = self.is_device(path) {
                st.mode = (st.mode & !S_IFMT) | dev.format();
                st.rdev = dev.rdev() as u64;
            }
        }
        Ok(st)
    }

    /// Handle for `path`, recorded in the table. 0 if the path cannot be
    /// stat'ed.
    pub fn get_file_handle(&self, path: &VfsPath) -> u64 {
        let mut handles = self.lock();
        let canonical = self.vfs.canonical(path);
        let handle = self.vfs.get_file_handle(&canonical);
        if handle != 0 {
            if let Some(old) = handles.insert(handle, canonical.clone()) {
                if old != canonical {
                    debug!("nfsd: handle {:#x} moved {} -> {}", handle, old, canonical);
                }
            }
        }
        handle
    }

    /// Path a handle was issued for; `None` for unknown or removed handles.
    pub fn get_canonical_path(&self, handle: u64) -> Option<VfsPath> {
        self.lock().get(&handle).cloned()
    }

    pub fn get_file_attrs(&self, path: &VfsPath) -> HostResult<FileAttrs> {
        let _guard = self.lock();
        self.vfs.get_file_attrs(path)
    }

    pub fn set_file_attrs(&self, path: &VfsPath, attrs: &FileAttrs) {
        let _guard = self.lock();
        self.vfs.set_file_attrs(path, attrs)
    }

    /// Canonical form of `path`; the export root itself is refused.
    fn below_root(&self, path: &VfsPath) -> HostResult<VfsPath> {
        let path = self.vfs.canonical(path);
        if &path == self.vfs.alias() {
            return Err(Errno::EACCES);
        }
        Ok(path)
    }

    /// Move `from` to `to` on the host, then repoint the handles of `from`
    /// and everything below it. Handles that named `to` are dropped.
    pub fn rename(&self, from: &VfsPath, to: &VfsPath) -> HostResult<()> {
        let mut handles = self.lock();
        let from = self.below_root(from)?;
        let to = self.below_root(to)?;
        self.vfs.rename(&from, &to)?;
        if from == to {
            return Ok(());
        }
        handles.retain(|_, p| !p.starts_with(&to));
        for path in handles.values_mut() {
            if let Some(rest) = path.strip_prefix(&from) {
                *path = &to / &rest;
            }
        }
        debug!("nfsd: moved {} -> {}", from, to);
        Ok(())
    }

    /// Remove a file or empty directory, then forget its handles.
    pub fn remove(&self, path: &VfsPath) -> HostResult<()> {
        let mut handles = self.lock();
        let path = self.below_root(path)?;
        self.vfs.remove(&path)?;
        handles.retain(|_, p| !p.starts_with(&path));
        Ok(())
    }

    /// Remove a directory tree, then forget the handles below it.
    pub fn purge(&self, path: &VfsPath) -> HostResult<()> {
        let mut handles = self.lock();
        let path = self.below_root(path)?;
        self.vfs.purge(&path)?;
        handles.retain(|_, p| !p.starts_with(&path));
        Ok(())
    }

    /// Number of issued handles.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
