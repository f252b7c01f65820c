//! In-memory write shadow for write-protected exports.
//!
//! Writes land in 4 KiB blocks copied from the host file on first touch.
//! Nothing here is ever written back, and host files are only opened
//! read-only with their mode untouched; dropping the store discards it.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::vfs::{HostResult, VfsFile, VfsPath, VirtualFs};

pub const SHADOW_BLOCK_SIZE: u64 = 4096;

#[derive(Debug)]
struct ShadowFile {
    /// Length the guest sees.
    size: u64,
    /// Host bytes at or past this offset read as zero (after a truncate).
    host_limit: u64,
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl ShadowFile {
    fn new(host_size: u64) -> Self {
        Self {
            size: host_size,
            host_limit: host_size,
            blocks: BTreeMap::new(),
        }
    }
}

fn load_block(host: &VfsFile, index: u64, host_limit: u64) -> HostResult<Vec<u8>> {
    let mut block = vec![0u8; SHADOW_BLOCK_SIZE as usize];
    let start = index * SHADOW_BLOCK_SIZE;
    if start < host_limit {
        let len = (host_limit - start).min(SHADOW_BLOCK_SIZE) as usize;
        host.read_at(start, &mut block[..len])?;
    }
    Ok(block)
}

#[derive(Debug, Default)]
pub struct ShadowStore {
    files: Mutex<HashMap<VfsPath, ShadowFile>>,
}

impl ShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<VfsPath, ShadowFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shadowed length of `path`, if it has been written.
    pub fn size(&self, path: &VfsPath) -> Option<u64> {
        self.lock().get(path).map(|f| f.size)
    }

    pub fn write(
        &self,
        vfs: &VirtualFs,
        path: &VfsPath,
        offset: u64,
        data: &[u8],
    ) -> HostResult<()> {
        let host = vfs.open_readonly(path)?;
        let mut files = self.lock();
        let file = match files.entry(path.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => e.insert(ShadowFile::new(host.len()?)),
        };

        let end = offset + data.len() as u64;
        let mut pos = offset;
        while pos < end {
            let index = pos / SHADOW_BLOCK_SIZE;
            let within = (pos % SHADOW_BLOCK_SIZE) as usize;
            let n = ((SHADOW_BLOCK_SIZE as usize) - within).min((end - pos) as usize);
            let block = match file.blocks.entry(index) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(load_block(&host, index, file.host_limit)?),
            };
            let src = (pos - offset) as usize;
            block[within..within + n].copy_from_slice(&data[src..src + n]);
            pos += n as u64;
        }
        file.size = file.size.max(end);
        trace!(
            "nfsd: shadow write {} offset={} len={} size={}",
            path,
            offset,
            data.len(),
            file.size
        );
        Ok(())
    }

    /// Shadowed contents of `path`, or `None` if it was never written.
    pub fn read(
        &self,
        vfs: &VirtualFs,
        path: &VfsPath,
        offset: u64,
        count: usize,
    ) -> HostResult<Option<Vec<u8>>> {
        let files = self.lock();
        let Some(file) = files.get(path) else {
            return Ok(None);
        };
        let end = (offset + count as u64).min(file.size);
        if offset >= end {
            return Ok(Some(Vec::new()));
        }
        let host = vfs.open_readonly(path)?;
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = pos / SHADOW_BLOCK_SIZE;
            let within = (pos % SHADOW_BLOCK_SIZE) as usize;
            let n = ((SHADOW_BLOCK_SIZE as usize) - within).min((end - pos) as usize);
            match file.blocks.get(&index) {
                Some(block) => out.extend_from_slice(&block[within..within + n]),
                None => {
                    let block = load_block(&host, index, file.host_limit)?;
                    out.extend_from_slice(&block[within..within + n]);
                }
            }
            pos += n as u64;
        }
        Ok(Some(out))
    }

    /// Set the shadowed length of `path`; the host file is untouched.
    pub fn truncate(&self, vfs: &VirtualFs, path: &VfsPath, size: u64) -> HostResult<()> {
        let host_size = vfs.open_readonly(path)?.len()?;
        let mut files = self.lock();
        let file = files
            .entry(path.clone())
            .or_insert_with(|| ShadowFile::new(host_size));
        file.size = size;
        file.host_limit = file.host_limit.min(size);
        let first_dropped = size.div_ceil(SHADOW_BLOCK_SIZE);
        file.blocks.retain(|&index, _| index < first_dropped);
        let within = (size % SHADOW_BLOCK_SIZE) as usize;
        if within != 0 {
            if let Some(block) = file.blocks.get_mut(&(size / SHADOW_BLOCK_SIZE)) {
                block[within..].fill(0);
            }
        }
        trace!("nfsd: shadow truncate {} size={}", path, size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup(contents: &[u8]) -> (tempfile::TempDir, VirtualFs, VfsPath) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), contents).unwrap();
        let vfs = VirtualFs::new(dir.path(), "/");
        (dir, vfs, VfsPath::new("/f"))
    }

    #[test]
    fn test_unwritten_file_not_shadowed() {
        let (_dir, vfs, path) = setup(b"hello");
        let shadow = ShadowStore::new();
        assert!(shadow.read(&vfs, &path, 0, 5).unwrap().is_none());
        assert!(shadow.size(&path).is_none());
    }

    #[test]
    fn test_write_overlays_host_without_touching_it() {
        let (dir, vfs, path) = setup(b"hello world");
        let shadow = ShadowStore::new();
        shadow.write(&vfs, &path, 6, b"WORLD").unwrap();

        let data = shadow.read(&vfs, &path, 0, 64).unwrap().unwrap();
        assert_eq!(data, b"hello WORLD");
        assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"hello world");
    }

    #[test]
    fn test_write_across_blocks_extends() {
        let (_dir, vfs, path) = setup(b"abc");
        let shadow = ShadowStore::new();
        let data = vec![7u8; 5000];
        shadow.write(&vfs, &path, 4000, &data).unwrap();
        assert_eq!(shadow.size(&path), Some(9000));

        let out = shadow.read(&vfs, &path, 0, 9000).unwrap().unwrap();
        assert_eq!(&out[..3], b"abc");
        assert!(out[3..4000].iter().all(|&b| b == 0));
        assert!(out[4000..].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_truncate_hides_host_tail() {
        let (_dir, vfs, path) = setup(b"0123456789");
        let shadow = ShadowStore::new();
        shadow.truncate(&vfs, &path, 2).unwrap();
        assert_eq!(shadow.read(&vfs, &path, 0, 10).unwrap().unwrap(), b"01");

        // Extending again must not resurrect the old host bytes.
        shadow.write(&vfs, &path, 5, b"x").unwrap();
        let out = shadow.read(&vfs, &path, 0, 10).unwrap().unwrap();
        assert_eq!(out, b"01\0\0\0x");
    }

    #[test]
    fn test_unreadable_host_file_is_left_alone() {
        use std::os::unix::fs::PermissionsExt;
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let (dir, vfs, path) = setup(b"locked");
        let host = dir.path().join("f");
        fs::set_permissions(&host, fs::Permissions::from_mode(0o000)).unwrap();

        let shadow = ShadowStore::new();
        assert!(shadow.write(&vfs, &path, 0, b"x").is_err());
        assert!(shadow.truncate(&vfs, &path, 0).is_err());
        let mode = fs::metadata(&host).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o000);
        fs::set_permissions(&host, fs::Permissions::from_mode(0o600)).unwrap();
    }
}

