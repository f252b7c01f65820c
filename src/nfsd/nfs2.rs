//! NFS version 2 procedures (program 100003).
//!
//! Every procedure decodes its arguments, resolves handles through the
//! [`FileTable`], performs the operation via [`VirtualFs`], and writes a
//! status word followed, for `NFS_OK` only, by the procedure's result.

use std::ops::RangeInclusive;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use nfsd_xdr::{XdrError, XdrReader, XdrWriter};
use tracing::{debug, trace, warn};

use super::context::{Export, ServerContext};
use super::file_table::FileTable;
use super::rpc::{ProcError, ProcResult, RpcCall, RpcProgram};
use super::{nfs_err, NfsStat};
use crate::vfs::attrs::{
    file_format, PERM_MASK, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFREG, S_IFSOCK,
};
use crate::vfs::{file_id, FileAttrs, OpenMode, Stat, TimeVal, VfsPath, VirtualFs};

pub const NFS_PROGRAM: u32 = 100003;
pub const NFS_VERSION: u32 = 2;

/// Size of a file handle on the wire.
pub const FHSIZE: usize = 32;
/// Largest READ/WRITE payload.
pub const MAXDATA: usize = 8192;
/// Longest path argument (symlink target).
pub const MAXPATHLEN: usize = 1024;
/// Longest single name component.
pub const MAXNAMLEN: usize = 255;

/// Transfer size reported by STATFS.
const STATFS_TSIZE: u32 = 8192;
/// Block size STATFS counts are rescaled to.
const STATFS_BSIZE: u64 = 4096;
/// Reply bytes READDIR keeps free for headers and the trailing words.
const READDIR_MARGIN: u32 = 128;
/// Mode bits given to directories created by MKDIR before attributes apply.
const DEFAULT_DIR_MODE: u32 = 0o755;

const NFSPROC_NULL: u32 = 0;
const NFSPROC_GETATTR: u32 = 1;
const NFSPROC_SETATTR: u32 = 2;
const NFSPROC_LOOKUP: u32 = 4;
const NFSPROC_READLINK: u32 = 5;
const NFSPROC_READ: u32 = 6;
const NFSPROC_WRITECACHE: u32 = 7;
const NFSPROC_WRITE: u32 = 8;
const NFSPROC_CREATE: u32 = 9;
const NFSPROC_REMOVE: u32 = 10;
const NFSPROC_RENAME: u32 = 11;
const NFSPROC_LINK: u32 = 12;
const NFSPROC_SYMLINK: u32 = 13;
const NFSPROC_MKDIR: u32 = 14;
const NFSPROC_RMDIR: u32 = 15;
const NFSPROC_READDIR: u32 = 16;
const NFSPROC_STATFS: u32 = 17;

/// `ftype` in the attribute reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    Non = 0,
    Reg = 1,
    Dir = 2,
    Blk = 3,
    Chr = 4,
    Lnk = 5,
    Sock = 6,
    Fifo = 7,
    Bad = 8,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Self {
        match file_format(mode) {
            S_IFREG => FileType::Reg,
            S_IFDIR => FileType::Dir,
            S_IFBLK => FileType::Blk,
            S_IFCHR => FileType::Chr,
            S_IFLNK => FileType::Lnk,
            S_IFSOCK => FileType::Sock,
            S_IFIFO => FileType::Fifo,
            0 => FileType::Non,
            _ => FileType::Bad,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Handle block of `N` bytes: the value little-endian in the first 8
/// bytes, zeros after.
pub fn encode_handle<const N: usize>(handle: u64) -> [u8; N] {
    let mut block = [0u8; N];
    LittleEndian::write_u64(&mut block[..8], handle);
    block
}

/// Handle value of a block of at least 8 bytes.
pub fn decode_handle(block: &[u8]) -> u64 {
    LittleEndian::read_u64(&block[..8])
}

fn read_handle(r: &mut XdrReader<'_>) -> Result<u64, XdrError> {
    Ok(decode_handle(r.read_fixed_opaque(FHSIZE)?))
}

fn write_handle(w: &mut XdrWriter, handle: u64) {
    w.write_fixed_opaque(&encode_handle::<FHSIZE>(handle));
}

fn write_status(w: &mut XdrWriter, stat: NfsStat) {
    w.write_u32(stat as u32);
}

/// `fattr`: type, mode, nlink, uid, gid, size, blocksize, rdev, blocks,
/// fsid, fileid, atime, mtime, ctime (mtime again).
pub fn write_fattr(w: &mut XdrWriter, st: &Stat) {
    let clamp = |v: u64| v.min(u32::MAX as u64) as u32;
    w.write_u32(FileType::from_mode(st.mode) as u32);
    w.write_u32(st.mode);
    w.write_u32(st.nlink);
    w.write_u32(st.uid);
    w.write_u32(st.gid);
    w.write_u32(clamp(st.size));
    w.write_u32(clamp(st.blksize));
    w.write_u32(st.rdev as u32);
    w.write_u32(clamp(st.blocks));
    w.write_u32(st.dev as u32);
    w.write_u32(file_id(st.ino));
    let atime = st.atime();
    let mtime = st.mtime();
    w.write_u32(atime.sec);
    w.write_u32(atime.usec);
    w.write_u32(mtime.sec);
    w.write_u32(mtime.usec);
    w.write_u32(mtime.sec);
    w.write_u32(mtime.usec);
}

fn optional(v: u32) -> Option<u32> {
    (v != u32::MAX).then_some(v)
}

/// `sattr`; all-ones fields are unset.
fn read_sattr(r: &mut XdrReader<'_>) -> Result<FileAttrs, XdrError> {
    let mode = optional(r.read_u32()?);
    let uid = optional(r.read_u32()?);
    let gid = optional(r.read_u32()?);
    let size = optional(r.read_u32()?);
    let mut time = || -> Result<Option<TimeVal>, XdrError> {
        let sec = r.read_u32()?;
        let usec = r.read_u32()?;
        Ok(optional(sec).map(|sec| TimeVal::new(sec, optional(usec).unwrap_or(0))))
    };
    let atime = time()?;
    let mtime = time()?;
    Ok(FileAttrs {
        mode,
        uid,
        gid,
        size,
        atime,
        mtime,
        rdev: None,
    })
}

/// `diropargs`: directory handle and a name.
fn read_diropargs(r: &mut XdrReader<'_>) -> Result<(u64, String), XdrError> {
    let dir = read_handle(r)?;
    // Over-long names are reported as NAMETOOLONG, not as garbage.
    let name = r.read_string(MAXPATHLEN)?;
    Ok((dir, name))
}

fn check_name(name: &str) -> Result<(), NfsStat> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(NfsStat::Acces);
    }
    if name.len() > MAXNAMLEN {
        return Err(NfsStat::NameTooLong);
    }
    Ok(())
}

/// Encoded size of one READDIR entry: follows flag, fileid, name, cookie.
fn entry_size(name: &str) -> usize {
    12 + 4 + name.len() + nfsd_xdr::padding(name.len())
}

/// `blocks * min(frsize, bsize) / 4096`, clamped to `i32::MAX`.
pub fn rescale_blocks(blocks: u64, frsize: u64, bsize: u64) -> u32 {
    let unit = if frsize == 0 { bsize } else { frsize.min(bsize) };
    let scaled = blocks as u128 * unit as u128 / STATFS_BSIZE as u128;
    scaled.min(i32::MAX as u128) as u32
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

pub struct NfsProgram {
    ctx: Arc<ServerContext>,
}

impl NfsProgram {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

impl RpcProgram for NfsProgram {
    fn program(&self) -> u32 {
        NFS_PROGRAM
    }

    fn versions(&self) -> RangeInclusive<u32> {
        NFS_VERSION..=NFS_VERSION
    }

    fn name(&self) -> &'static str {
        "nfsd"
    }

    fn call(&self, call: &RpcCall, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let export = self.ctx.export();
        let nfs = Procedures {
            export: &export,
            table: &export.table,
            vfs: export.vfs(),
            write_protect: self.ctx.write_protect(),
        };
        match call.procedure {
            NFSPROC_NULL => Ok(()),
            NFSPROC_GETATTR => nfs.getattr(args, out),
            NFSPROC_SETATTR => nfs.setattr(args, out),
            NFSPROC_LOOKUP => nfs.lookup(args, out),
            NFSPROC_READLINK => nfs.readlink(args, out),
            NFSPROC_READ => nfs.read(args, out),
            NFSPROC_WRITECACHE => {
                write_status(out, NfsStat::Ok);
                Ok(())
            }
            NFSPROC_WRITE => nfs.write(args, out),
            NFSPROC_CREATE => nfs.create(args, out),
            NFSPROC_REMOVE => nfs.remove(args, out),
            NFSPROC_RENAME => nfs.rename(args, out),
            NFSPROC_LINK => nfs.link(args, out),
            NFSPROC_SYMLINK => nfs.symlink(args, out),
            NFSPROC_MKDIR => nfs.mkdir(args, out),
            NFSPROC_RMDIR => nfs.rmdir(args, out),
            NFSPROC_READDIR => nfs.readdir(args, out),
            NFSPROC_STATFS => nfs.statfs(args, out),
            _ => Err(ProcError::Unavailable),
        }
    }
}

/// One request's view of the export.
struct Procedures<'a> {
    export: &'a Export,
    table: &'a FileTable,
    vfs: &'a VirtualFs,
    write_protect: bool,
}

impl Procedures<'_> {
    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Path a handle was issued for; unknown handles are stale.
    fn path_of(&self, handle: u64) -> Result<VfsPath, NfsStat> {
        self.table.get_canonical_path(handle).ok_or(NfsStat::Stale)
    }

    /// `dir/name`, never above the export root. `..` at the root stays there.
    fn full_path(&self, dir: u64, name: &str) -> Result<VfsPath, NfsStat> {
        check_name(name)?;
        let joined = self.vfs.canonical(&self.path_of(dir)?.join_name(name));
        if joined.starts_with(self.vfs.alias()) {
            Ok(joined)
        } else {
            Ok(self.vfs.alias().clone())
        }
    }

    /// `dir/name` for a procedure that changes the namespace. `.` and `..`
    /// never name a directory entry here and are answered with `dots`.
    fn entry_path(&self, dir: u64, name: &str, dots: NfsStat) -> Result<VfsPath, NfsStat> {
        check_name(name)?;
        if name == "." || name == ".." {
            return Err(dots);
        }
        self.full_path(dir, name)
    }

    /// Existence check: symlinks always pass, anything else must exist.
    fn check_file(&self, path: &VfsPath) -> Result<(), NfsStat> {
        if path.is_empty() {
            return Err(NfsStat::Stale);
        }
        if matches!(self.vfs.stat(path), Ok(st) if st.is_symlink()) {
            return Ok(());
        }
        self.vfs
            .access(path, libc::F_OK)
            .map_err(|_| NfsStat::NoEnt)
    }

    fn resolve(&self, handle: u64) -> Result<VfsPath, NfsStat> {
        let path = self.path_of(handle)?;
        self.check_file(&path)?;
        Ok(path)
    }

    fn writable(&self) -> Result<(), NfsStat> {
        if self.write_protect {
            Err(NfsStat::RoFs)
        } else {
            Ok(())
        }
    }

    /// Attributes as the guest sees them, including shadowed sizes.
    fn attributes(&self, path: &VfsPath) -> Result<Stat, NfsStat> {
        let mut st = self.table.stat(path).map_err(nfs_err)?;
        if self.write_protect {
            if let Some(size) = self.export.shadow.size(path) {
                st.size = size;
            }
        }
        Ok(st)
    }

    /// Fill unset uid/gid of a new object: default owner first, then the
    /// parent directory's owner.
    fn owner_defaults(&self, path: &VfsPath, attrs: &mut FileAttrs) {
        if attrs.uid.is_some() && attrs.gid.is_some() {
            return;
        }
        let (uid, gid) = match self.export.default_owner {
            Some(owner) => owner,
            None => match self.table.stat(&path.parent()) {
                Ok(st) => (st.uid, st.gid),
                Err(_) => return,
            },
        };
        attrs.uid.get_or_insert(uid);
        attrs.gid.get_or_insert(gid);
    }

    /// Apply client-supplied attributes to `path`.
    fn set_attrs(&self, path: &VfsPath, sattr: &FileAttrs) -> Result<(), NfsStat> {
        if self.write_protect {
            if let Some(size) = sattr.size {
                self.export
                    .shadow
                    .truncate(self.vfs, path, size as u64)
                    .map_err(nfs_err)?;
            }
            return Ok(());
        }

        let mut overlay = self.table.get_file_attrs(path).map_err(nfs_err)?;
        if let Some(mode) = sattr.mode {
            let format = match file_format(mode) {
                0 => match overlay.mode.map(file_format) {
                    Some(f) if f != 0 => f,
                    _ => self.vfs.stat(path).map_err(nfs_err)?.format(),
                },
                f => f,
            };
            let mode = format | (mode & PERM_MASK);
            self.vfs.chmod(path, mode).map_err(nfs_err)?;
            overlay.mode = Some(mode);
        }
        if sattr.uid.is_some() {
            overlay.uid = sattr.uid;
        }
        if sattr.gid.is_some() {
            overlay.gid = sattr.gid;
        }
        if sattr.rdev.is_some() {
            overlay.rdev = sattr.rdev;
        }
        if let Some(size) = sattr.size {
            if self.vfs.stat(path).map_err(nfs_err)?.is_file() {
                self.vfs
                    .open(path, OpenMode::ReadWrite)
                    .and_then(|f| f.set_len(size as u64))
                    .map_err(nfs_err)?;
            }
        }
        if sattr.atime.is_some() || sattr.mtime.is_some() {
            let now = TimeVal::now();
            self.vfs
                .utimes(
                    path,
                    sattr.atime.unwrap_or(now),
                    sattr.mtime.unwrap_or(now),
                )
                .map_err(nfs_err)?;
        }
        self.table.set_file_attrs(path, &overlay);
        Ok(())
    }

    /// Status, then the handle and attributes of `path` on success.
    fn reply_diropres(&self, out: &mut XdrWriter, result: Result<VfsPath, NfsStat>) {
        let result = result.and_then(|path| {
            let handle = self.table.get_file_handle(&path);
            if handle == 0 {
                return Err(NfsStat::NoEnt);
            }
            Ok((handle, self.attributes(&path)?))
        });
        match result {
            Ok((handle, st)) => {
                write_status(out, NfsStat::Ok);
                write_handle(out, handle);
                write_fattr(out, &st);
            }
            Err(stat) => write_status(out, stat),
        }
    }

    /// Status, then attributes of `path` on success.
    fn reply_attrstat(&self, out: &mut XdrWriter, result: Result<VfsPath, NfsStat>) {
        match result.and_then(|path| self.attributes(&path)) {
            Ok(st) => {
                write_status(out, NfsStat::Ok);
                write_fattr(out, &st);
            }
            Err(stat) => write_status(out, stat),
        }
    }

    fn reply_stat(&self, out: &mut XdrWriter, result: Result<(), NfsStat>) {
        write_status(out, result.err().unwrap_or(NfsStat::Ok));
    }

    // -----------------------------------------------------------------------
    // Procedures
    // -----------------------------------------------------------------------

    fn getattr(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let handle = read_handle(args)?;
        let result = self.resolve(handle);
        trace!("nfsd: GETATTR {:#x} -> {:?}", handle, result);
        self.reply_attrstat(out, result);
        Ok(())
    }

    fn setattr(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let handle = read_handle(args)?;
        let sattr = read_sattr(args)?;
        trace!("nfsd: SETATTR {:#x} {:?}", handle, sattr);
        let result = self.resolve(handle).and_then(|path| {
            self.set_attrs(&path, &sattr)?;
            Ok(path)
        });
        self.reply_attrstat(out, result);
        Ok(())
    }

    fn lookup(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let (dir, name) = read_diropargs(args)?;
        let result = self.full_path(dir, &name).and_then(|path| {
            self.check_file(&path)?;
            Ok(path)
        });
        trace!("nfsd: LOOKUP {:#x} {:?} -> {:?}", dir, name, result);
        self.reply_diropres(out, result);
        Ok(())
    }

    fn readlink(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let handle = read_handle(args)?;
        let result = self
            .resolve(handle)
            .and_then(|path| self.vfs.read_link(&path).map_err(nfs_err));
        trace!("nfsd: READLINK {:#x} -> {:?}", handle, result);
        match result {
            Ok(target) => {
                write_status(out, NfsStat::Ok);
                out.write_string(&target);
            }
            Err(stat) => write_status(out, stat),
        }
        Ok(())
    }

    fn read(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let handle = read_handle(args)?;
        let offset = args.read_u32()? as u64;
        let count = (args.read_u32()? as usize).min(MAXDATA);
        let _totalcount = args.read_u32()?;

        let result = self.resolve(handle).and_then(|path| {
            let shadowed = if self.write_protect {
                self.export
                    .shadow
                    .read(self.vfs, &path, offset, count)
                    .map_err(nfs_err)?
            } else {
                None
            };
            let data = match shadowed {
                Some(data) => data,
                None => {
                    let file = if self.write_protect {
                        self.vfs.open_readonly(&path)
                    } else {
                        self.vfs.open(&path, OpenMode::Read)
                    }
                    .map_err(nfs_err)?;
                    let mut buf = vec![0u8; count];
                    let n = file.read_at(offset, &mut buf).map_err(nfs_err)?;
                    buf.truncate(n);
                    buf
                }
            };
            Ok((self.attributes(&path)?, data))
        });

        match result {
            Ok((st, data)) => {
                trace!(
                    "nfsd: READ {:#x} offset={} count={} -> {}",
                    handle,
                    offset,
                    count,
                    data.len()
                );
                write_status(out, NfsStat::Ok);
                write_fattr(out, &st);
                out.write_opaque(&data);
            }
            Err(stat) => {
                debug!("nfsd: READ {:#x} offset={} -> {:?}", handle, offset, stat);
                write_status(out, stat);
            }
        }
        Ok(())
    }

    fn write(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let handle = read_handle(args)?;
        let _beginoffset = args.read_u32()?;
        let offset = args.read_u32()? as u64;
        let _totalcount = args.read_u32()?;
        let data = args.read_opaque(MAXDATA)?;

        let result = self.resolve(handle).and_then(|path| {
            if !self.table.stat(&path).map_err(nfs_err)?.is_file() {
                return Err(NfsStat::IsDir);
            }
            if self.write_protect {
                self.export
                    .shadow
                    .write(self.vfs, &path, offset, data)
                    .map_err(nfs_err)?;
            } else {
                self.vfs
                    .open(&path, OpenMode::ReadWrite)
                    .and_then(|f| f.write_at(offset, data))
                    .map_err(nfs_err)?;
            }
            Ok(path)
        });
        trace!(
            "nfsd: WRITE {:#x} offset={} len={} -> {:?}",
            handle,
            offset,
            data.len(),
            result.as_ref().err()
        );
        self.reply_attrstat(out, result);
        Ok(())
    }

    fn create(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let (dir, name) = read_diropargs(args)?;
        let mut sattr = read_sattr(args)?;

        let result = self.writable().and_then(|_| {
            let path = self.entry_path(dir, &name, NfsStat::Exist)?;
            let exists = self.vfs.stat(&path).is_ok();
            if !exists {
                self.owner_defaults(&path, &mut sattr);
            }
            // Special files carry their device number in the size field.
            if sattr
                .mode
                .is_some_and(|m| matches!(file_format(m), S_IFCHR | S_IFBLK))
            {
                sattr.rdev = sattr.size.take();
            }
            let truncate = !exists || sattr.size == Some(0);
            let mode = if truncate {
                OpenMode::CreateTruncate
            } else {
                OpenMode::Create
            };
            self.vfs.open(&path, mode).map_err(nfs_err)?;
            if truncate {
                sattr.size = None;
            }
            self.set_attrs(&path, &sattr)?;
            Ok(path)
        });
        debug!("nfsd: CREATE {:#x} {:?} -> {:?}", dir, name, result);
        self.reply_diropres(out, result);
        Ok(())
    }

    fn remove(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let (dir, name) = read_diropargs(args)?;
        let result = self.writable().and_then(|_| {
            let path = self.entry_path(dir, &name, NfsStat::Acces)?;
            self.check_file(&path)?;
            self.table.remove(&path).map_err(nfs_err)
        });
        debug!("nfsd: REMOVE {:#x} {:?} -> {:?}", dir, name, result);
        self.reply_stat(out, result);
        Ok(())
    }

    fn rename(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let (from_dir, from_name) = read_diropargs(args)?;
        let (to_dir, to_name) = read_diropargs(args)?;
        let result = self.writable().and_then(|_| {
            let from = self.entry_path(from_dir, &from_name, NfsStat::Acces)?;
            let to = self.entry_path(to_dir, &to_name, NfsStat::Acces)?;
            self.check_file(&from)?;
            self.table.rename(&from, &to).map_err(nfs_err)
        });
        debug!(
            "nfsd: RENAME {:?} -> {:?}: {:?}",
            from_name, to_name, result
        );
        self.reply_stat(out, result);
        Ok(())
    }

    fn link(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let from = read_handle(args)?;
        let (to_dir, to_name) = read_diropargs(args)?;
        let result = self.writable().and_then(|_| {
            let from = self.resolve(from)?;
            let to = self.entry_path(to_dir, &to_name, NfsStat::Exist)?;
            self.vfs.link(&from, &to).map_err(nfs_err)
        });
        debug!("nfsd: LINK {:#x} -> {:?}: {:?}", from, to_name, result);
        self.reply_stat(out, result);
        Ok(())
    }

    fn symlink(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let (dir, name) = read_diropargs(args)?;
        let target = args.read_string(MAXPATHLEN)?;
        let mut sattr = read_sattr(args)?;
        let result = self.writable().and_then(|_| {
            let path = self.entry_path(dir, &name, NfsStat::Exist)?;
            self.vfs.symlink(&target, &path).map_err(nfs_err)?;
            self.owner_defaults(&path, &mut sattr);
            if let Err(stat) = self.set_attrs(&path, &sattr) {
                warn!("nfsd: SYMLINK {}: attributes not applied: {:?}", path, stat);
            }
            Ok(())
        });
        debug!("nfsd: SYMLINK {:?} -> {:?}: {:?}", name, target, result);
        self.reply_stat(out, result);
        Ok(())
    }

    fn mkdir(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let (dir, name) = read_diropargs(args)?;
        let mut sattr = read_sattr(args)?;
        let result = self.writable().and_then(|_| {
            let path = self.entry_path(dir, &name, NfsStat::Exist)?;
            self.vfs.mkdir(&path, DEFAULT_DIR_MODE).map_err(nfs_err)?;
            self.owner_defaults(&path, &mut sattr);
            if sattr.mode.is_some_and(|m| file_format(m) == 0) {
                sattr.mode = sattr.mode.map(|m| m | S_IFDIR);
            }
            self.set_attrs(&path, &sattr)?;
            Ok(path)
        });
        debug!("nfsd: MKDIR {:#x} {:?} -> {:?}", dir, name, result);
        self.reply_diropres(out, result);
        Ok(())
    }

    fn rmdir(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let (dir, name) = read_diropargs(args)?;
        let result = self.writable().and_then(|_| {
            let path = self.entry_path(dir, &name, NfsStat::Acces)?;
            self.check_file(&path)?;
            self.table.purge(&path).map_err(nfs_err)
        });
        debug!("nfsd: RMDIR {:#x} {:?} -> {:?}", dir, name, result);
        self.reply_stat(out, result);
        Ok(())
    }

    /// Entries of `path`: `.`, `..`, then the host entries by name.
    fn directory_entries(&self, path: &VfsPath) -> Result<Vec<(u32, String)>, NfsStat> {
        let own = self.vfs.stat(path).map_err(nfs_err)?;
        let parent = if path == self.vfs.alias() {
            own
        } else {
            self.vfs.stat(&path.parent()).unwrap_or(own)
        };
        let mut host = self.vfs.read_dir(path).map_err(nfs_err)?;
        host.sort_by(|a, b| a.name.cmp(&b.name));

        let mut entries = Vec::with_capacity(host.len() + 2);
        entries.push((file_id(own.ino), ".".to_string()));
        entries.push((file_id(parent.ino), "..".to_string()));
        entries.extend(host.into_iter().map(|e| (file_id(e.ino), e.name)));
        Ok(entries)
    }

    fn readdir(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let handle = read_handle(args)?;
        let cookie = args.read_u32()? as usize;
        let count = args.read_u32()?;

        let entries = match self
            .resolve(handle)
            .and_then(|path| self.directory_entries(&path))
        {
            Ok(entries) => entries,
            Err(stat) => {
                debug!("nfsd: READDIR {:#x} -> {:?}", handle, stat);
                write_status(out, stat);
                return Ok(());
            }
        };

        let start = out.len();
        let budget = count.saturating_sub(READDIR_MARGIN) as usize;
        write_status(out, NfsStat::Ok);
        let mut eof = true;
        let mut emitted = 0usize;
        for (index, (fileid, name)) in entries.iter().enumerate().skip(cookie) {
            // At least one entry per reply so a tiny budget still advances.
            if emitted > 0 && out.len() - start + entry_size(name) > budget {
                eof = false;
                break;
            }
            out.write_bool(true);
            out.write_u32(*fileid);
            out.write_string(name);
            out.write_u32(index as u32 + 1);
            emitted += 1;
        }
        out.write_bool(false);
        out.write_bool(eof);
        trace!(
            "nfsd: READDIR {:#x} cookie={} count={} -> {} bytes eof={}",
            handle,
            cookie,
            count,
            out.len() - start,
            eof
        );
        Ok(())
    }

    fn statfs(&self, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let handle = read_handle(args)?;
        let result = self
            .resolve(handle)
            .and_then(|path| self.vfs.statvfs(&path).map_err(nfs_err));
        match result {
            Ok(fs) => {
                trace!("nfsd: STATFS {:#x} {:?}", handle, fs);
                write_status(out, NfsStat::Ok);
                out.write_u32(STATFS_TSIZE);
                out.write_u32(STATFS_BSIZE as u32);
                out.write_u32(rescale_blocks(fs.blocks, fs.frsize, fs.bsize));
                out.write_u32(rescale_blocks(fs.bfree, fs.frsize, fs.bsize));
                out.write_u32(rescale_blocks(fs.bavail, fs.frsize, fs.bsize));
            }
            Err(stat) => write_status(out, stat),
        }
        Ok(())
    }
}
