//! NFS v2 server: handle table, RPC programs and transport.
//!
//! ```text
//!  UDP / TCP ──► RpcDispatcher ──► NfsProgram ──► FileTable ──► VirtualFs ──► host
//!                    │              MountProgram        │
//!                    │              BootparamProgram    └─ DeviceTable
//!                    └──────────►   PortmapProgram
//! ```

pub mod bootparam;
pub mod context;
pub mod devices;
pub mod file_table;
pub mod mount;
pub mod nfs2;
pub mod portmap;
pub mod rpc;
pub mod server;
pub mod shadow;

pub use context::{Export, ServerContext};
pub use file_table::FileTable;
pub use rpc::{ProcError, ProcResult, RpcCall, RpcDispatcher, RpcProgram};
pub use server::{NfsServer, Protocol};
pub use shadow::ShadowStore;

use crate::vfs::Errno;

/// NFS v2 status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NfsStat {
    Ok = 0,
    Perm = 1,
    NoEnt = 2,
    Io = 5,
    NxIo = 6,
    Acces = 13,
    Exist = 17,
    NoDev = 19,
    NotDir = 20,
    IsDir = 21,
    FBig = 27,
    NoSpc = 28,
    RoFs = 30,
    NameTooLong = 63,
    NotEmpty = 66,
    DQuot = 69,
    Stale = 70,
    WFlush = 99,
}

/// Map a host error to a protocol status. Deliberately coarse: only
/// "not found" and "permission denied" survive, everything else is I/O.
pub fn nfs_err(e: Errno) -> NfsStat {
    match e.code() {
        libc::ENOENT => NfsStat::NoEnt,
        libc::EACCES => NfsStat::Acces,
        _ => NfsStat::Io,
    }
}
