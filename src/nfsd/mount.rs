//! MOUNT protocol (program 100005, versions 1 to 3).

use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nfsd_xdr::rpc::AUTH_UNIX;
use nfsd_xdr::{XdrReader, XdrWriter};
use tracing::{debug, info, warn};

use super::context::ServerContext;
use super::nfs2::{encode_handle, FHSIZE};
use super::rpc::{ProcError, ProcResult, RpcCall, RpcProgram};
use crate::vfs::VfsPath;

pub const MOUNT_PROGRAM: u32 = 100005;

/// Longest path a client may ask to mount.
pub const MNTPATHLEN: usize = 1024;
/// Handle size in MOUNT v3 replies.
pub const FHSIZE3: usize = 64;

const MAX_MOUNTS: usize = 100;

const MNT_OK: u32 = 0;
const MNTERR_ACCES: u32 = 13;

const MOUNTPROC_NULL: u32 = 0;
const MOUNTPROC_MNT: u32 = 1;
const MOUNTPROC_DUMP: u32 = 2;
const MOUNTPROC_UMNT: u32 = 3;
const MOUNTPROC_UMNTALL: u32 = 4;
const MOUNTPROC_EXPORT: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub client: IpAddr,
    pub path: String,
}

/// Clients that currently have something mounted.
#[derive(Debug, Default)]
pub struct MountList {
    entries: Mutex<Vec<MountEntry>>,
}

impl MountList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MountEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a mount. Returns false when the list is full.
    pub fn add(&self, client: IpAddr, path: &str) -> bool {
        let mut entries = self.lock();
        let entry = MountEntry {
            client,
            path: path.to_owned(),
        };
        if entries.contains(&entry) {
            return true;
        }
        if entries.len() >= MAX_MOUNTS {
            return false;
        }
        entries.push(entry);
        true
    }

    pub fn remove(&self, client: IpAddr, path: &str) {
        self.lock()
            .retain(|e| !(e.client == client && e.path == path));
    }

    pub fn remove_all(&self, client: IpAddr) {
        self.lock().retain(|e| e.client != client);
    }

    pub fn entries(&self) -> Vec<MountEntry> {
        self.lock().clone()
    }
}

pub struct MountProgram {
    ctx: Arc<ServerContext>,
}

impl MountProgram {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    fn mnt(&self, call: &RpcCall, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let path = args.read_string(MNTPATHLEN)?;
        let export = self.ctx.export();
        let handle = export.table.get_file_handle(&VfsPath::new(&path));
        if handle == 0 {
            debug!("mountd: MNT {} from {} refused", path, call.peer);
            out.write_u32(MNTERR_ACCES);
            return Ok(());
        }

        if !self.ctx.mounts().add(call.peer.ip(), &path) {
            warn!("mountd: mount list full, not recording {}", call.peer);
        }
        info!("mountd: {} mounted {}", call.peer.ip(), path);

        out.write_u32(MNT_OK);
        if call.version >= 3 {
            out.write_opaque(&encode_handle::<FHSIZE3>(handle));
            out.write_u32(1);
            out.write_u32(AUTH_UNIX);
        } else {
            out.write_fixed_opaque(&encode_handle::<FHSIZE>(handle));
        }
        Ok(())
    }

    fn dump(&self, out: &mut XdrWriter) {
        for entry in self.ctx.mounts().entries() {
            out.write_bool(true);
            out.write_string(&entry.client.to_string());
            out.write_string(&entry.path);
        }
        out.write_bool(false);
    }

    fn export(&self, out: &mut XdrWriter) {
        out.write_bool(true);
        out.write_string(&self.ctx.alias());
        // groups: everyone
        out.write_bool(true);
        out.write_string("*");
        out.write_bool(false);
        out.write_bool(false);
    }
}

impl RpcProgram for MountProgram {
    fn program(&self) -> u32 {
        MOUNT_PROGRAM
    }

    fn versions(&self) -> RangeInclusive<u32> {
        1..=3
    }

    fn name(&self) -> &'static str {
        "mountd"
    }

    fn call(&self, call: &RpcCall, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        match call.procedure {
            MOUNTPROC_NULL => Ok(()),
            MOUNTPROC_MNT => self.mnt(call, args, out),
            MOUNTPROC_DUMP => {
                self.dump(out);
                Ok(())
            }
            MOUNTPROC_UMNT => {
                let path = args.read_string(MNTPATHLEN)?;
                self.ctx.mounts().remove(call.peer.ip(), &path);
                info!("mountd: {} unmounted {}", call.peer.ip(), path);
                Ok(())
            }
            MOUNTPROC_UMNTALL => {
                self.ctx.mounts().remove_all(call.peer.ip());
                info!("mountd: {} unmounted everything", call.peer.ip());
                Ok(())
            }
            MOUNTPROC_EXPORT => {
                self.export(out);
                Ok(())
            }
            _ => Err(ProcError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_mount_list_dedup_and_remove() {
        let list = MountList::new();
        assert!(list.add(ip("10.0.2.15"), "/"));
        assert!(list.add(ip("10.0.2.15"), "/"));
        assert!(list.add(ip("10.0.2.15"), "/usr"));
        assert!(list.add(ip("10.0.2.16"), "/"));
        assert_eq!(list.entries().len(), 3);

        list.remove(ip("10.0.2.15"), "/usr");
        assert_eq!(list.entries().len(), 2);
        list.remove_all(ip("10.0.2.15"));
        assert_eq!(
            list.entries(),
            vec![MountEntry {
                client: ip("10.0.2.16"),
                path: "/".into()
            }]
        );
    }

    #[test]
    fn test_mount_list_is_bounded() {
        let list = MountList::new();
        for i in 0..MAX_MOUNTS {
            assert!(list.add(ip("10.0.2.15"), &format!("/p{}", i)));
        }
        assert!(!list.add(ip("10.0.2.15"), "/one-more"));
    }
}
