//! Boot-parameter service (program 100026, version 1).

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::Arc;

use nfsd_xdr::{XdrError, XdrReader, XdrWriter};
use tracing::debug;

use super::context::ServerContext;
use super::rpc::{ProcError, ProcResult, RpcCall, RpcProgram};
use crate::vfs::VfsPath;

pub const BOOTPARAM_PROGRAM: u32 = 100026;

const BOOTPARAMPROC_NULL: u32 = 0;
const BOOTPARAMPROC_WHOAMI: u32 = 1;
const BOOTPARAMPROC_GETFILE: u32 = 2;

const IP_ADDR_TYPE: u32 = 1;
const MAX_MACHINE_NAME: usize = 255;
const MAX_FILEID: usize = 32;

/// The key whose file is the export root itself.
const ROOT_KEY: &str = "root";

/// `bp_address`: a type word, then each octet widened to a full unit.
fn read_address(r: &mut XdrReader<'_>) -> Result<Option<Ipv4Addr>, XdrError> {
    let kind = r.read_u32()?;
    if kind != IP_ADDR_TYPE {
        return Ok(None);
    }
    let mut octets = [0u8; 4];
    for o in octets.iter_mut() {
        *o = r.read_u32()? as u8;
    }
    Ok(Some(Ipv4Addr::from(octets)))
}

fn write_address(w: &mut XdrWriter, addr: Ipv4Addr) {
    w.write_u32(IP_ADDR_TYPE);
    for o in addr.octets() {
        w.write_u32(o as u32);
    }
}

/// Path handed out for a GETFILE key.
pub fn boot_file_path(alias: &VfsPath, key: &str) -> VfsPath {
    if key == ROOT_KEY {
        alias.clone()
    } else {
        alias.join_name(key)
    }
}

pub struct BootparamProgram {
    ctx: Arc<ServerContext>,
}

impl BootparamProgram {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

impl RpcProgram for BootparamProgram {
    fn program(&self) -> u32 {
        BOOTPARAM_PROGRAM
    }

    fn versions(&self) -> RangeInclusive<u32> {
        1..=1
    }

    fn name(&self) -> &'static str {
        "bootparamd"
    }

    fn call(&self, call: &RpcCall, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        let boot = self.ctx.boot();
        match call.procedure {
            BOOTPARAMPROC_NULL => Ok(()),
            BOOTPARAMPROC_WHOAMI => {
                let Some(client) = read_address(args)? else {
                    return Err(ProcError::System("WHOAMI for a non-IP address".into()));
                };
                debug!(
                    "bootparamd: WHOAMI {} -> {}.{}",
                    client, boot.client_name, boot.domain
                );
                out.write_string(&boot.client_name);
                out.write_string(boot.domain.trim_start_matches('.'));
                write_address(out, boot.gateway);
                Ok(())
            }
            BOOTPARAMPROC_GETFILE => {
                let client = args.read_string(MAX_MACHINE_NAME)?;
                let key = args.read_string(MAX_FILEID)?;
                let alias = self.ctx.export().vfs().alias().clone();
                let path = boot_file_path(&alias, &key);
                debug!("bootparamd: GETFILE {} {} -> {}", client, key, path);
                out.write_string(&boot.server_name);
                write_address(out, boot.server_addr);
                out.write_string(&path.to_string());
                Ok(())
            }
            _ => Err(ProcError::Unavailable),
        }
    }
}
