//! Scoped host file handle with a permission-recovery fallback.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::attrs::{S_IRUSR, S_IWUSR};
use super::host::{self, Errno, HostResult, Stat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
    /// Create if missing, keep existing contents.
    Create,
    /// Create if missing, truncate existing contents.
    CreateTruncate,
}

impl OpenMode {
    fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenMode::Read => opts.read(true),
            OpenMode::ReadWrite => opts.read(true).write(true),
            OpenMode::Create => opts.read(true).write(true).create(true),
            OpenMode::CreateTruncate => opts.read(true).write(true).create(true).truncate(true),
        };
        opts
    }
}

/// An open host file.
///
/// If the first open fails with `EACCES`, owner read/write is granted and
/// the open retried. The original mode and timestamps are put back when the
/// handle is dropped, on every exit path.
#[derive(Debug)]
pub struct VfsFile {
    file: File,
    path: PathBuf,
    restore: Option<Stat>,
}

impl VfsFile {
    pub fn open(path: &Path, mode: OpenMode) -> HostResult<Self> {
        let options = mode.options();
        match host::open(path, &options) {
            Ok(file) => Ok(Self {
                file,
                path: path.to_path_buf(),
                restore: None,
            }),
            Err(e) if e == Errno::EACCES => {
                let st = host::lstat(path)?;
                host::set_mode(path, st.mode | S_IRUSR | S_IWUSR)?;
                debug!(
                    "nfsd: widened {} from {:o} to open it",
                    path.display(),
                    st.mode & 0o7777
                );
                match host::open(path, &options) {
                    Ok(file) => Ok(Self {
                        file,
                        path: path.to_path_buf(),
                        restore: Some(st),
                    }),
                    Err(e) => {
                        restore(path, &st);
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Open for reading without the permission fallback; the host file's
    /// mode is never changed.
    pub fn open_readonly(path: &Path) -> HostResult<Self> {
        let file = host::open(path, &OpenMode::Read.options())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            restore: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `buf.len()` bytes at `offset`; short only at end of file.
    pub fn read_at(&self, mut offset: u64, buf: &mut [u8]) -> HostResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    offset += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> HostResult<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn set_len(&self, len: u64) -> HostResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn len(&self) -> HostResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

fn restore(path: &Path, st: &Stat) {
    if let Err(e) = host::set_mode(path, st.mode) {
        warn!("nfsd: failed to restore mode of {}: {}", path.display(), e);
    }
    if let Err(e) = host::set_times(
        path,
        (st.atime_sec, st.atime_nsec),
        (st.mtime_sec, st.mtime_nsec),
    ) {
        warn!("nfsd: failed to restore times of {}: {}", path.display(), e);
    }
}

impl Drop for VfsFile {
    fn drop(&mut self) {
        if let Some(st) = self.restore.take() {
            restore(&self.path, &st);
        }
    }
}
