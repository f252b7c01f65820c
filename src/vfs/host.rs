//! Thin host-syscall wrappers.
//!
//! Nothing here panics or raises: every call returns `HostResult`, with the
//! host's error code normalized into an [`Errno`].

use std::ffi::CString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::attrs::{TimeVal, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

/// Normalized host error code. Success is `Ok`, so this is never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

pub type HostResult<T> = std::result::Result<T, Errno>;

impl Errno {
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EISDIR: Errno = Errno(libc::EISDIR);

    pub fn new(code: i32) -> Self {
        if code == 0 {
            Errno(libc::EIO)
        } else {
            Errno(code)
        }
    }

    /// `errno` of the last failed libc call.
    pub fn last() -> Self {
        Self::from(&std::io::Error::last_os_error())
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

impl From<&std::io::Error> for Errno {
    fn from(e: &std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Errno::new(code),
            None => match e.kind() {
                std::io::ErrorKind::NotFound => Errno(libc::ENOENT),
                std::io::ErrorKind::PermissionDenied => Errno(libc::EACCES),
                std::io::ErrorKind::AlreadyExists => Errno(libc::EEXIST),
                std::io::ErrorKind::InvalidInput => Errno(libc::EINVAL),
                std::io::ErrorKind::WouldBlock => Errno(libc::EAGAIN),
                _ => Errno(libc::EIO),
            },
        }
    }
}

impl From<std::io::Error> for Errno {
    fn from(e: std::io::Error) -> Self {
        Errno::from(&e)
    }
}

fn cstring(path: &Path) -> HostResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

// ---------------------------------------------------------------------------
// stat
// ---------------------------------------------------------------------------

/// Owned copy of the fields of a host `lstat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blksize: u64,
    pub rdev: u64,
    pub blocks: u64,
    pub atime_sec: i64,
    pub atime_nsec: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

impl Stat {
    pub fn from_metadata(m: &fs::Metadata) -> Self {
        Self {
            dev: m.dev(),
            ino: m.ino(),
            mode: m.mode(),
            nlink: m.nlink().min(u32::MAX as u64) as u32,
            uid: m.uid(),
            gid: m.gid(),
            size: m.size(),
            blksize: m.blksize(),
            rdev: m.rdev(),
            blocks: m.blocks(),
            atime_sec: m.atime(),
            atime_nsec: m.atime_nsec(),
            mtime_sec: m.mtime(),
            mtime_nsec: m.mtime_nsec(),
        }
    }

    pub fn format(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.format() == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.format() == S_IFLNK
    }

    pub fn is_file(&self) -> bool {
        self.format() == S_IFREG
    }

    pub fn atime(&self) -> TimeVal {
        TimeVal::new(self.atime_sec as u32, (self.atime_nsec / 1000) as u32)
    }

    pub fn mtime(&self) -> TimeVal {
        TimeVal::new(self.mtime_sec as u32, (self.mtime_nsec / 1000) as u32)
    }
}

/// `lstat`: never follows a final symlink.
pub fn lstat(path: &Path) -> HostResult<Stat> {
    Ok(Stat::from_metadata(&fs::symlink_metadata(path)?))
}

pub fn access(path: &Path, mode: i32) -> HostResult<()> {
    let cpath = cstring(path)?;
    let rc = unsafe { libc::access(cpath.as_ptr(), mode) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Set permission bits exactly as given.
pub fn set_mode(path: &Path, mode: u32) -> HostResult<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

/// Set access and modify times without following a final symlink.
pub fn set_times(path: &Path, atime: (i64, i64), mtime: (i64, i64)) -> HostResult<()> {
    let cpath = cstring(path)?;
    let times = [
        libc::timespec {
            tv_sec: atime.0 as libc::time_t,
            tv_nsec: atime.1 as _,
        },
        libc::timespec {
            tv_sec: mtime.0 as libc::time_t,
            tv_nsec: mtime.1 as _,
        },
    ];
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            cpath.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Extended attributes
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
const NO_ATTR: i32 = libc::ENODATA;
#[cfg(target_os = "macos")]
const NO_ATTR: i32 = libc::ENOATTR;

/// Read an extended attribute of the link itself. `Ok(None)` if absent.
pub fn get_xattr(path: &Path, name: &str) -> HostResult<Option<Vec<u8>>> {
    let cpath = cstring(path)?;
    let cname = CString::new(name).map_err(|_| Errno::EINVAL)?;
    let mut buf = vec![0u8; 256];
    loop {
        #[cfg(target_os = "linux")]
        let rc = unsafe {
            libc::lgetxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        #[cfg(target_os = "macos")]
        let rc = unsafe {
            libc::getxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                libc::XATTR_NOFOLLOW,
            )
        };
        if rc >= 0 {
            buf.truncate(rc as usize);
            return Ok(Some(buf));
        }
        let err = Errno::last();
        match err.code() {
            code if code == NO_ATTR => return Ok(None),
            libc::ERANGE if buf.len() < 64 * 1024 => buf.resize(buf.len() * 4, 0),
            _ => return Err(err),
        }
    }
}

/// Write an extended attribute on the link itself.
pub fn set_xattr(path: &Path, name: &str, value: &[u8]) -> HostResult<()> {
    let cpath = cstring(path)?;
    let cname = CString::new(name).map_err(|_| Errno::EINVAL)?;
    #[cfg(target_os = "linux")]
    let rc = unsafe {
        libc::lsetxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    #[cfg(target_os = "macos")]
    let rc = unsafe {
        libc::setxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
            libc::XATTR_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// statvfs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStat {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
}

pub fn statvfs(path: &Path) -> HostResult<FsStat> {
    let cpath = cstring(path)?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st as *mut libc::statvfs) };
    if rc != 0 {
        return Err(Errno::last());
    }
    Ok(FsStat {
        bsize: st.f_bsize as u64,
        frsize: st.f_frsize as u64,
        blocks: st.f_blocks as u64,
        bfree: st.f_bfree as u64,
        bavail: st.f_bavail as u64,
    })
}

// ---------------------------------------------------------------------------
// Namespace operations
// ---------------------------------------------------------------------------

/// Read a symlink target. The buffer is sized from `lstat`, falling back to
/// `PATH_MAX` for filesystems that report a zero-length link.
pub fn read_link(path: &Path) -> HostResult<String> {
    let st = lstat(path)?;
    let cap = if st.size == 0 {
        libc::PATH_MAX as usize
    } else {
        st.size as usize + 1
    };
    let cpath = cstring(path)?;
    let mut buf = vec![0u8; cap];
    let rc = unsafe {
        libc::readlink(
            cpath.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if rc < 0 {
        return Err(Errno::last());
    }
    buf.truncate(rc as usize);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Remove a file, symlink or empty directory.
pub fn remove(path: &Path) -> HostResult<()> {
    if lstat(path)?.is_dir() {
        fs::remove_dir(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn rename(from: &Path, to: &Path) -> HostResult<()> {
    fs::rename(from, to)?;
    Ok(())
}

pub fn hard_link(from: &Path, to: &Path) -> HostResult<()> {
    fs::hard_link(from, to)?;
    Ok(())
}

/// Create a symlink at `link` whose target is stored verbatim.
pub fn symlink(target: &str, link: &Path) -> HostResult<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

pub fn mkdir(path: &Path, mode: u32) -> HostResult<()> {
    fs::DirBuilder::new().mode(mode).create(path)?;
    Ok(())
}

pub fn open(path: &Path, options: &OpenOptions) -> HostResult<File> {
    Ok(options.open(path)?)
}

/// One directory entry: name and host inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
}

/// List a directory, without `.` and `..`. Unreadable entries are skipped.
pub fn read_dir(path: &Path) -> HostResult<Vec<DirEntry>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(path)? {
        match entry {
            Ok(e) => out.push(DirEntry {
                name: e.file_name().to_string_lossy().into_owned(),
                ino: e.ino(),
            }),
            Err(e) => warn!("nfsd: skipping entry in {}: {}", path.display(), e),
        }
    }
    Ok(out)
}

/// Depth-first walk that visits every entry below (and including) `root`,
/// children before their directory. Stops at the first error from `visit`.
pub fn walk_tree<F>(root: &Path, mut visit: F) -> HostResult<()>
where
    F: FnMut(&Path, &Stat) -> HostResult<()>,
{
    let mut stack: Vec<(PathBuf, bool)> = vec![(root.to_path_buf(), false)];
    while let Some((path, expanded)) = stack.pop() {
        let st = lstat(&path)?;
        if st.is_dir() && !expanded {
            stack.push((path.clone(), true));
            for entry in fs::read_dir(&path)? {
                stack.push((entry?.path(), false));
            }
            continue;
        }
        visit(&path, &st)?;
    }
    Ok(())
}
