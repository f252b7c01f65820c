//! Minimal port mapper (program 100000, version 2).
//!
//! The registry is filled by the server as it binds sockets; clients can
//! query it but not change it.

use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nfsd_xdr::{XdrReader, XdrWriter};
use tracing::trace;

use super::context::ServerContext;
use super::rpc::{ProcError, ProcResult, RpcCall, RpcProgram};

pub const PMAP_PROGRAM: u32 = 100000;
pub const PMAP_VERSION: u32 = 2;

pub const IPPROTO_TCP: u32 = 6;
pub const IPPROTO_UDP: u32 = 17;

const PMAPPROC_NULL: u32 = 0;
const PMAPPROC_SET: u32 = 1;
const PMAPPROC_UNSET: u32 = 2;
const PMAPPROC_GETPORT: u32 = 3;
const PMAPPROC_DUMP: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub program: u32,
    pub version: u32,
    pub protocol: u32,
    pub port: u32,
}

impl Mapping {
    fn decode(r: &mut XdrReader<'_>) -> Result<Self, nfsd_xdr::XdrError> {
        Ok(Self {
            program: r.read_u32()?,
            version: r.read_u32()?,
            protocol: r.read_u32()?,
            port: r.read_u32()?,
        })
    }
}

#[derive(Debug, Default)]
pub struct PortRegistry {
    mappings: Mutex<Vec<Mapping>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Mapping>> {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace the mapping for (program, version, protocol).
    pub fn set(&self, mapping: Mapping) {
        let mut mappings = self.lock();
        mappings.retain(|m| {
            (m.program, m.version, m.protocol)
                != (mapping.program, mapping.version, mapping.protocol)
        });
        mappings.push(mapping);
    }

    /// Registered port, or 0.
    pub fn get_port(&self, program: u32, version: u32, protocol: u32) -> u32 {
        self.lock()
            .iter()
            .find(|m| m.program == program && m.version == version && m.protocol == protocol)
            .map(|m| m.port)
            .unwrap_or(0)
    }

    pub fn list(&self) -> Vec<Mapping> {
        self.lock().clone()
    }
}

pub struct PortmapProgram {
    ctx: Arc<ServerContext>,
}

impl PortmapProgram {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }
}

impl RpcProgram for PortmapProgram {
    fn program(&self) -> u32 {
        PMAP_PROGRAM
    }

    fn versions(&self) -> RangeInclusive<u32> {
        PMAP_VERSION..=PMAP_VERSION
    }

    fn name(&self) -> &'static str {
        "portmap"
    }

    fn call(&self, call: &RpcCall, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult {
        match call.procedure {
            PMAPPROC_NULL => Ok(()),
            PMAPPROC_SET | PMAPPROC_UNSET => {
                let mapping = Mapping::decode(args)?;
                trace!("portmap: refusing change {:?} from {}", mapping, call.peer);
                out.write_bool(false);
                Ok(())
            }
            PMAPPROC_GETPORT => {
                let query = Mapping::decode(args)?;
                let port = self
                    .ctx
                    .ports()
                    .get_port(query.program, query.version, query.protocol);
                trace!(
                    "portmap: GETPORT prog={} vers={} prot={} -> {}",
                    query.program,
                    query.version,
                    query.protocol,
                    port
                );
                out.write_u32(port);
                Ok(())
            }
            PMAPPROC_DUMP => {
                for m in self.ctx.ports().list() {
                    out.write_bool(true);
                    out.write_u32(m.program);
                    out.write_u32(m.version);
                    out.write_u32(m.protocol);
                    out.write_u32(m.port);
                }
                out.write_bool(false);
                Ok(())
            }
            _ => Err(ProcError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_replaces_same_key() {
        let reg = PortRegistry::new();
        reg.set(Mapping {
            program: 100003,
            version: 2,
            protocol: IPPROTO_UDP,
            port: 2049,
        });
        reg.set(Mapping {
            program: 100003,
            version: 2,
            protocol: IPPROTO_UDP,
            port: 3049,
        });
        reg.set(Mapping {
            program: 100003,
            version: 2,
            protocol: IPPROTO_TCP,
            port: 2049,
        });
        assert_eq!(reg.get_port(100003, 2, IPPROTO_UDP), 3049);
        assert_eq!(reg.get_port(100003, 2, IPPROTO_TCP), 2049);
        assert_eq!(reg.get_port(100003, 3, IPPROTO_UDP), 0);
        assert_eq!(reg.list().len(), 2);
    }
}
