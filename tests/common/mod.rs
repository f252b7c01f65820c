//! Builders for hand-made RPC calls and decoders for the replies.
#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use guest_nfsd::nfsd::bootparam::BootparamProgram;
use guest_nfsd::nfsd::mount::MountProgram;
use guest_nfsd::nfsd::nfs2::{decode_handle, encode_handle, NfsProgram, FHSIZE};
use guest_nfsd::nfsd::portmap::PortmapProgram;
use guest_nfsd::nfsd::{RpcDispatcher, RpcProgram, ServerContext};
use guest_nfsd::vfs::host;
use guest_nfsd::vfs::OVERLAY_XATTR;
use guest_nfsd::NfsdConfig;
use nfsd_xdr::rpc::{AcceptStat, CallHeader, ReplyHeader, ReplyStatus};
use nfsd_xdr::{XdrReader, XdrWriter};
use tempfile::TempDir;

pub const NFS: u32 = 100003;
pub const MOUNT: u32 = 100005;
pub const BOOTPARAM: u32 = 100026;
pub const PORTMAP: u32 = 100000;

pub const NFS_OK: u32 = 0;
pub const NFSERR_NOENT: u32 = 2;
pub const NFSERR_ACCES: u32 = 13;
pub const NFSERR_EXIST: u32 = 17;
pub const NFSERR_ISDIR: u32 = 21;
pub const NFSERR_ROFS: u32 = 30;
pub const NFSERR_NAMETOOLONG: u32 = 63;
pub const NFSERR_STALE: u32 = 70;

pub const UNSET: u32 = u32::MAX;

/// Decoded `fattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fattr {
    pub ftype: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub blocksize: u32,
    pub rdev: u32,
    pub blocks: u32,
    pub fsid: u32,
    pub fileid: u32,
    pub atime: (u32, u32),
    pub mtime: (u32, u32),
    pub ctime: (u32, u32),
}

impl Fattr {
    pub fn decode(r: &mut XdrReader<'_>) -> Self {
        let mut next = || r.read_u32().unwrap();
        Fattr {
            ftype: next(),
            mode: next(),
            nlink: next(),
            uid: next(),
            gid: next(),
            size: next(),
            blocksize: next(),
            rdev: next(),
            blocks: next(),
            fsid: next(),
            fileid: next(),
            atime: (next(), next()),
            mtime: (next(), next()),
            ctime: (next(), next()),
        }
    }
}

/// `sattr` with every field unset except those given.
#[derive(Debug, Clone, Copy)]
pub struct Sattr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub atime: (u32, u32),
    pub mtime: (u32, u32),
}

impl Default for Sattr {
    fn default() -> Self {
        Self {
            mode: UNSET,
            uid: UNSET,
            gid: UNSET,
            size: UNSET,
            atime: (UNSET, UNSET),
            mtime: (UNSET, UNSET),
        }
    }
}

impl Sattr {
    pub fn mode(mode: u32) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn encode(&self, w: &mut XdrWriter) {
        for v in [
            self.mode,
            self.uid,
            self.gid,
            self.size,
            self.atime.0,
            self.atime.1,
            self.mtime.0,
            self.mtime.1,
        ] {
            w.write_u32(v);
        }
    }
}

pub fn write_handle(w: &mut XdrWriter, handle: u64) {
    w.write_fixed_opaque(&encode_handle::<FHSIZE>(handle));
}

pub fn read_handle(r: &mut XdrReader<'_>) -> u64 {
    decode_handle(r.read_fixed_opaque(FHSIZE).unwrap())
}

/// Encode a complete call message.
pub fn build_call(
    xid: u32,
    program: u32,
    version: u32,
    procedure: u32,
    args: impl FnOnce(&mut XdrWriter),
) -> Vec<u8> {
    let mut w = XdrWriter::new();
    CallHeader::new(xid, program, version, procedure).encode(&mut w);
    args(&mut w);
    w.into_bytes()
}

/// Check the reply header is an accepted success and return the results.
pub fn reply_body(reply: &[u8]) -> Vec<u8> {
    let mut r = XdrReader::new(reply);
    let header = ReplyHeader::decode(&mut r).unwrap();
    assert_eq!(
        header.status,
        ReplyStatus::Accepted(AcceptStat::Success),
        "unexpected reply status"
    );
    r.rest().to_vec()
}

/// Whether the filesystem under `dir` stores the attribute overlay.
pub fn xattrs_supported(dir: &Path) -> bool {
    let scratch = dir.join(".xattr-check");
    let ok = fs::write(&scratch, b"").is_ok()
        && host::set_xattr(&scratch, OVERLAY_XATTR, b"0:0:0:0").is_ok();
    let _ = fs::remove_file(&scratch);
    ok
}

/// An export in a temp directory served by an in-process dispatcher.
pub struct Harness {
    pub dir: TempDir,
    pub ctx: Arc<ServerContext>,
    pub dispatcher: RpcDispatcher,
    xid: AtomicU32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|c| c)
    }

    pub fn with_config(configure: impl FnOnce(NfsdConfig) -> NfsdConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::in_dir(dir, configure)
    }

    /// Serve an existing directory, e.g. to simulate a restart.
    pub fn in_dir(dir: TempDir, configure: impl FnOnce(NfsdConfig) -> NfsdConfig) -> Self {
        let config = configure(
            NfsdConfig::new()
                .export_root(dir.path())
                .default_owner(501, 20)
                .ephemeral_ports(),
        );
        let ctx = Arc::new(ServerContext::new(&config).unwrap());
        let programs: Vec<Arc<dyn RpcProgram>> = vec![
            Arc::new(NfsProgram::new(Arc::clone(&ctx))),
            Arc::new(MountProgram::new(Arc::clone(&ctx))),
            Arc::new(BootparamProgram::new(Arc::clone(&ctx))),
            Arc::new(PortmapProgram::new(Arc::clone(&ctx))),
        ];
        Self {
            dir,
            ctx,
            dispatcher: RpcDispatcher::new(programs),
            xid: AtomicU32::new(1),
        }
    }

    pub fn into_dir(self) -> TempDir {
        self.dir
    }

    pub fn path(&self, rel: &str) -> std::path::PathBuf {
        self.dir.path().join(rel)
    }

    pub fn peer(&self) -> SocketAddr {
        "10.0.2.15:1023".parse().unwrap()
    }

    /// Send one call and return the procedure results.
    pub fn call(
        &self,
        program: u32,
        version: u32,
        procedure: u32,
        args: impl FnOnce(&mut XdrWriter),
    ) -> Vec<u8> {
        let xid = self.xid.fetch_add(1, Ordering::Relaxed);
        let request = build_call(xid, program, version, procedure, args);
        let reply = self
            .dispatcher
            .handle(&request, self.peer())
            .expect("no reply");
        reply_body(&reply)
    }

    // --- mount ---

    pub fn mount(&self, path: &str) -> u64 {
        let body = self.call(MOUNT, 1, 1, |w| w.write_string(path));
        let mut r = XdrReader::new(&body);
        assert_eq!(r.read_u32().unwrap(), 0, "mount of {} refused", path);
        read_handle(&mut r)
    }

    pub fn root(&self) -> u64 {
        self.mount(&self.ctx.alias())
    }

    // --- nfs ---

    pub fn getattr(&self, handle: u64) -> Result<Fattr, u32> {
        let body = self.call(NFS, 2, 1, |w| write_handle(w, handle));
        attrstat(&body)
    }

    pub fn setattr(&self, handle: u64, sattr: Sattr) -> Result<Fattr, u32> {
        let body = self.call(NFS, 2, 2, |w| {
            write_handle(w, handle);
            sattr.encode(w);
        });
        attrstat(&body)
    }

    pub fn lookup(&self, dir: u64, name: &str) -> Result<(u64, Fattr), u32> {
        let body = self.call(NFS, 2, 4, |w| {
            write_handle(w, dir);
            w.write_string(name);
        });
        diropres(&body)
    }

    pub fn readlink(&self, handle: u64) -> Result<String, u32> {
        let body = self.call(NFS, 2, 5, |w| write_handle(w, handle));
        let mut r = XdrReader::new(&body);
        match r.read_u32().unwrap() {
            NFS_OK => Ok(r.read_string(1024).unwrap()),
            stat => Err(stat),
        }
    }

    pub fn read(&self, handle: u64, offset: u32, count: u32) -> Result<(Fattr, Vec<u8>), u32> {
        let body = self.call(NFS, 2, 6, |w| {
            write_handle(w, handle);
            w.write_u32(offset);
            w.write_u32(count);
            w.write_u32(0);
        });
        let mut r = XdrReader::new(&body);
        match r.read_u32().unwrap() {
            NFS_OK => {
                let attrs = Fattr::decode(&mut r);
                Ok((attrs, r.read_opaque(8192).unwrap().to_vec()))
            }
            stat => Err(stat),
        }
    }

    pub fn write(&self, handle: u64, offset: u32, data: &[u8]) -> Result<Fattr, u32> {
        let body = self.call(NFS, 2, 8, |w| {
            write_handle(w, handle);
            w.write_u32(0);
            w.write_u32(offset);
            w.write_u32(0);
            w.write_opaque(data);
        });
        attrstat(&body)
    }

    pub fn create(&self, dir: u64, name: &str, sattr: Sattr) -> Result<(u64, Fattr), u32> {
        let body = self.call(NFS, 2, 9, |w| {
            write_handle(w, dir);
            w.write_string(name);
            sattr.encode(w);
        });
        diropres(&body)
    }

    pub fn remove(&self, dir: u64, name: &str) -> u32 {
        let body = self.call(NFS, 2, 10, |w| {
            write_handle(w, dir);
            w.write_string(name);
        });
        status(&body)
    }

    pub fn rename(&self, from_dir: u64, from: &str, to_dir: u64, to: &str) -> u32 {
        let body = self.call(NFS, 2, 11, |w| {
            write_handle(w, from_dir);
            w.write_string(from);
            write_handle(w, to_dir);
            w.write_string(to);
        });
        status(&body)
    }

    pub fn link(&self, from: u64, dir: u64, name: &str) -> u32 {
        let body = self.call(NFS, 2, 12, |w| {
            write_handle(w, from);
            write_handle(w, dir);
            w.write_string(name);
        });
        status(&body)
    }

    pub fn symlink(&self, dir: u64, name: &str, target: &str) -> u32 {
        let body = self.call(NFS, 2, 13, |w| {
            write_handle(w, dir);
            w.write_string(name);
            w.write_string(target);
            Sattr::default().encode(w);
        });
        status(&body)
    }

    pub fn mkdir(&self, dir: u64, name: &str, sattr: Sattr) -> Result<(u64, Fattr), u32> {
        let body = self.call(NFS, 2, 14, |w| {
            write_handle(w, dir);
            w.write_string(name);
            sattr.encode(w);
        });
        diropres(&body)
    }

    pub fn rmdir(&self, dir: u64, name: &str) -> u32 {
        let body = self.call(NFS, 2, 15, |w| {
            write_handle(w, dir);
            w.write_string(name);
        });
        status(&body)
    }

    /// One READDIR reply: entries as (fileid, name, cookie) and eof.
    pub fn readdir(
        &self,
        dir: u64,
        cookie: u32,
        count: u32,
    ) -> Result<(Vec<(u32, String, u32)>, bool), u32> {
        let body = self.call(NFS, 2, 16, |w| {
            write_handle(w, dir);
            w.write_u32(cookie);
            w.write_u32(count);
        });
        let mut r = XdrReader::new(&body);
        match r.read_u32().unwrap() {
            NFS_OK => {
                let mut entries = Vec::new();
                while r.read_bool().unwrap() {
                    let fileid = r.read_u32().unwrap();
                    let name = r.read_string(255).unwrap();
                    let cookie = r.read_u32().unwrap();
                    entries.push((fileid, name, cookie));
                }
                Ok((entries, r.read_bool().unwrap()))
            }
            stat => Err(stat),
        }
    }

    /// Every name in `dir`, following cookies until eof.
    pub fn list_all(&self, dir: u64, count: u32) -> Vec<String> {
        let mut names = Vec::new();
        let mut cookie = 0;
        loop {
            let (entries, eof) = self.readdir(dir, cookie, count).unwrap();
            if let Some(last) = entries.last() {
                cookie = last.2;
            }
            names.extend(entries.into_iter().map(|e| e.1));
            if eof {
                return names;
            }
        }
    }

    /// STATFS results: tsize, bsize, blocks, bfree, bavail.
    pub fn statfs(&self, handle: u64) -> Result<[u32; 5], u32> {
        let body = self.call(NFS, 2, 17, |w| write_handle(w, handle));
        let mut r = XdrReader::new(&body);
        match r.read_u32().unwrap() {
            NFS_OK => {
                let mut out = [0u32; 5];
                for v in &mut out {
                    *v = r.read_u32().unwrap();
                }
                Ok(out)
            }
            stat => Err(stat),
        }
    }
}

pub fn status(body: &[u8]) -> u32 {
    XdrReader::new(body).read_u32().unwrap()
}

pub fn attrstat(body: &[u8]) -> Result<Fattr, u32> {
    let mut r = XdrReader::new(body);
    match r.read_u32().unwrap() {
        NFS_OK => Ok(Fattr::decode(&mut r)),
        stat => Err(stat),
    }
}

pub fn diropres(body: &[u8]) -> Result<(u64, Fattr), u32> {
    let mut r = XdrReader::new(body);
    match r.read_u32().unwrap() {
        NFS_OK => {
            let handle = read_handle(&mut r);
            Ok((handle, Fattr::decode(&mut r)))
        }
        stat => Err(stat),
    }
}
