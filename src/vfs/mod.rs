//! Guest-to-host path translation and the attribute overlay.
//!
//! A [`VirtualFs`] binds a guest-visible alias (e.g. `/` or `/netboot`) to a
//! host directory. Every guest path is canonicalized, checked against the
//! alias and re-anchored under the host root before any host call.
//!
//! Guest semantics the host cannot store natively (device files, foreign
//! uids, owner permission bits) live in an extended attribute on the host
//! file, see [`FileAttrs`]. No attribute state is cached in memory.

pub mod attrs;
pub mod file;
pub mod host;
pub mod path;

use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

pub use attrs::{FileAttrs, TimeVal};
pub use file::{OpenMode, VfsFile};
pub use host::{DirEntry, Errno, FsStat, HostResult, Stat};
pub use path::{HostPath, VfsPath};

use attrs::{
    file_format, is_special_format, PERM_MASK, S_IFMT, S_IRUSR, S_ISVTX, S_IWUSR,
};

/// Extended attribute holding the serialized overlay.
#[cfg(target_os = "linux")]
pub const OVERLAY_XATTR: &str = "user.nfsd_fattrs";
#[cfg(not(target_os = "linux"))]
pub const OVERLAY_XATTR: &str = ".nfsd_fattrs";

/// Mode bits the overlay decides; the rest of the mode comes from the host.
const OVERLAY_MODE_BITS: u32 = S_IRUSR | S_IWUSR | S_ISVTX;

/// Fold a host device id and inode into a handle. Never 0.
pub fn file_handle(dev: u64, ino: u64) -> u64 {
    match dev.rotate_left(32) ^ ino {
        0 => u64::MAX,
        h => h,
    }
}

/// 31-bit file id for the wire.
pub fn file_id(ino: u64) -> u32 {
    ((ino ^ (ino >> 32)) & 0x7FFF_FFFF) as u32
}

/// Apply an overlay to a host stat.
pub fn merge_overlay(st: &mut Stat, overlay: &FileAttrs) {
    if let Some(mode) = overlay.mode {
        let host_mode = st.mode;
        st.mode = (host_mode & !OVERLAY_MODE_BITS) | (mode & OVERLAY_MODE_BITS);
        if st.is_file() && st.size == 0 && is_special_format(mode) {
            st.mode = (st.mode & !S_IFMT) | file_format(mode);
        }
    }
    if let Some(uid) = overlay.uid {
        st.uid = uid;
    }
    if let Some(gid) = overlay.gid {
        st.gid = gid;
    }
    if let Some(rdev) = overlay.rdev {
        st.rdev = rdev as u64;
    }
}

#[derive(Debug, Clone)]
pub struct VirtualFs {
    host_root: PathBuf,
    alias: VfsPath,
}

impl VirtualFs {
    pub fn new<P: Into<PathBuf>>(host_root: P, alias: &str) -> Self {
        Self {
            host_root: host_root.into(),
            alias: VfsPath::new(alias).to_absolute().canonicalize(),
        }
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    /// Guest path of the export root.
    pub fn alias(&self) -> &VfsPath {
        &self.alias
    }

    /// Canonical guest path, anchored at `/`.
    pub fn canonical(&self, path: &VfsPath) -> VfsPath {
        path.to_absolute().canonicalize()
    }

    /// Strip the export alias and re-anchor the rest at `/`.
    ///
    /// The path is canonicalized first; a result that does not lie under
    /// the alias is refused with `EACCES`.
    pub fn remove_alias(&self, path: &VfsPath) -> HostResult<VfsPath> {
        let canonical = self.canonical(path);
        match canonical.strip_prefix(&self.alias) {
            Some(rest) => Ok(rest.to_absolute()),
            None => {
                debug!("nfsd: {} is outside export {}", canonical, self.alias);
                Err(Errno::EACCES)
            }
        }
    }

    pub fn to_host_path(&self, path: &VfsPath) -> HostResult<HostPath> {
        let inner = self.remove_alias(path)?;
        let root = HostPath::new(&self.host_root.to_string_lossy());
        Ok(&root / &HostPath::from_path(&inner))
    }

    fn host(&self, path: &VfsPath) -> HostResult<PathBuf> {
        Ok(self.to_host_path(path)?.to_path_buf())
    }

    // -----------------------------------------------------------------------
    // Overlay
    // -----------------------------------------------------------------------

    fn read_overlay(&self, host_path: &Path) -> Option<FileAttrs> {
        match host::get_xattr(host_path, OVERLAY_XATTR) {
            Ok(Some(raw)) => match String::from_utf8_lossy(&raw).parse() {
                Ok(attrs) => Some(attrs),
                Err(e) => {
                    warn!("nfsd: ignoring overlay on {}: {}", host_path.display(), e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                trace!("nfsd: no overlay on {}: {}", host_path.display(), e);
                None
            }
        }
    }

    /// Host `lstat` merged with the overlay, plus the overlay itself.
    pub fn stat_with_overlay(&self, path: &VfsPath) -> HostResult<(Stat, FileAttrs)> {
        let host_path = self.host(path)?;
        let mut st = host::lstat(&host_path)?;
        let overlay = self.read_overlay(&host_path).unwrap_or_default();
        merge_overlay(&mut st, &overlay);
        Ok((st, overlay))
    }

    pub fn stat(&self, path: &VfsPath) -> HostResult<Stat> {
        Ok(self.stat_with_overlay(path)?.0)
    }

    /// The stored overlay, or attributes derived from the host file when
    /// none is stored.
    pub fn get_file_attrs(&self, path: &VfsPath) -> HostResult<FileAttrs> {
        let host_path = self.host(path)?;
        match self.read_overlay(&host_path) {
            Some(attrs) => Ok(attrs),
            None => Ok(FileAttrs::from_stat(&host::lstat(&host_path)?)),
        }
    }

    /// Persist mode/uid/gid/rdev. Failures are logged, never returned.
    pub fn set_file_attrs(&self, path: &VfsPath, attrs: &FileAttrs) {
        let host_path = match self.host(path) {
            Ok(p) => p,
            Err(e) => {
                warn!("nfsd: cannot store attributes for {}: {}", path, e);
                return;
            }
        };
        let value = attrs.overlay_fields().to_string();
        match host::set_xattr(&host_path, OVERLAY_XATTR, value.as_bytes()) {
            Ok(()) => trace!("nfsd: overlay {} = {}", host_path.display(), value),
            Err(e) => warn!(
                "nfsd: failed to store attributes on {}: {}",
                host_path.display(),
                e
            ),
        }
    }

    /// Handle for `path`, or 0 if the host file cannot be stat'ed.
    pub fn get_file_handle(&self, path: &VfsPath) -> u64 {
        match self.host(path).and_then(|p| host::lstat(&p)) {
            Ok(st) => file_handle(st.dev, st.ino),
            Err(e) => {
                debug!("nfsd: no handle for {}: {}", path, e);
                0
            }
        }
    }

    // -----------------------------------------------------------------------
    // Host wrappers
    // -----------------------------------------------------------------------

    /// Apply permission bits on the host, always keeping owner read/write so
    /// the server can still reach the file. Symlinks are left alone.
    pub fn chmod(&self, path: &VfsPath, mode: u32) -> HostResult<()> {
        let host_path = self.host(path)?;
        if host::lstat(&host_path)?.is_symlink() {
            return Ok(());
        }
        host::set_mode(&host_path, (mode & PERM_MASK) | S_IRUSR | S_IWUSR)
    }

    pub fn access(&self, path: &VfsPath, mode: i32) -> HostResult<()> {
        host::access(&self.host(path)?, mode)
    }

    pub fn read_dir(&self, path: &VfsPath) -> HostResult<Vec<DirEntry>> {
        host::read_dir(&self.host(path)?)
    }

    pub fn remove(&self, path: &VfsPath) -> HostResult<()> {
        host::remove(&self.host(path)?)
    }

    pub fn rename(&self, from: &VfsPath, to: &VfsPath) -> HostResult<()> {
        host::rename(&self.host(from)?, &self.host(to)?)
    }

    pub fn read_link(&self, path: &VfsPath) -> HostResult<String> {
        host::read_link(&self.host(path)?)
    }

    /// Hard link `to` to the existing `from`.
    pub fn link(&self, from: &VfsPath, to: &VfsPath) -> HostResult<()> {
        host::hard_link(&self.host(from)?, &self.host(to)?)
    }

    /// Symlink at `link`; the target string is stored as given.
    pub fn symlink(&self, target: &str, link: &VfsPath) -> HostResult<()> {
        host::symlink(target, &self.host(link)?)
    }

    pub fn mkdir(&self, path: &VfsPath, mode: u32) -> HostResult<()> {
        host::mkdir(&self.host(path)?, mode)
    }

    pub fn walk_tree<F>(&self, path: &VfsPath, visit: F) -> HostResult<()>
    where
        F: FnMut(&Path, &Stat) -> HostResult<()>,
    {
        host::walk_tree(&self.host(path)?, visit)
    }

    /// Remove `path` and everything below it, granting access on the way.
    pub fn purge(&self, path: &VfsPath) -> HostResult<()> {
        self.walk_tree(path, |p, st| {
            if !st.is_symlink() {
                host::set_mode(p, 0o777)?;
            }
            host::remove(p)
        })
    }

    pub fn statvfs(&self, path: &VfsPath) -> HostResult<FsStat> {
        host::statvfs(&self.host(path)?)
    }

    pub fn utimes(&self, path: &VfsPath, atime: TimeVal, mtime: TimeVal) -> HostResult<()> {
        host::set_times(
            &self.host(path)?,
            (atime.sec as i64, atime.usec as i64 * 1000),
            (mtime.sec as i64, mtime.usec as i64 * 1000),
        )
    }

    pub fn open(&self, path: &VfsPath, mode: OpenMode) -> HostResult<VfsFile> {
        VfsFile::open(&self.host(path)?, mode)
    }

    /// Read-only open that leaves the host file's mode alone.
    pub fn open_readonly(&self, path: &VfsPath) -> HostResult<VfsFile> {
        VfsFile::open_readonly(&self.host(path)?)
    }

    /// Create `path` as an empty file if it does not exist.
    pub fn touch(&self, path: &VfsPath) -> HostResult<()> {
        self.open(path, OpenMode::Create).map(drop)
    }
}
