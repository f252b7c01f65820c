//! Program registry and per-call dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;

use nfsd_xdr::rpc::{
    encode_accepted, encode_prog_mismatch, encode_rpc_mismatch, AcceptStat, CallHeader,
    Credential, RPC_VERSION,
};
use nfsd_xdr::{XdrError, XdrReader, XdrWriter};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Why a procedure produced no result body.
#[derive(Error, Debug)]
pub enum ProcError {
    /// Arguments could not be decoded
    #[error("garbage arguments: {0}")]
    Garbage(#[from] XdrError),

    /// The procedure number is not implemented
    #[error("procedure unavailable")]
    Unavailable,

    /// The call was well formed but could not be served
    #[error("system error: {0}")]
    System(String),
}

pub type ProcResult = Result<(), ProcError>;

/// One decoded call, as seen by a program.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub peer: SocketAddr,
    pub credential: Credential,
}

/// An ONC RPC program. Implementations are synchronous and may be called
/// from several threads at once.
pub trait RpcProgram: Send + Sync {
    fn program(&self) -> u32;

    fn versions(&self) -> RangeInclusive<u32>;

    fn name(&self) -> &'static str;

    /// Decode arguments from `args` and write the results to `out`.
    /// `out` is discarded when an error is returned.
    fn call(&self, call: &RpcCall, args: &mut XdrReader<'_>, out: &mut XdrWriter) -> ProcResult;
}

pub struct RpcDispatcher {
    programs: HashMap<u32, Arc<dyn RpcProgram>>,
}

impl RpcDispatcher {
    pub fn new(programs: impl IntoIterator<Item = Arc<dyn RpcProgram>>) -> Self {
        Self {
            programs: programs
                .into_iter()
                .map(|p| (p.program(), p))
                .collect(),
        }
    }

    pub fn programs(&self) -> impl Iterator<Item = &Arc<dyn RpcProgram>> {
        self.programs.values()
    }

    /// Serve one request message. `None` means no reply should be sent.
    pub fn handle(&self, request: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        let mut args = XdrReader::new(request);
        let header = match CallHeader::decode(&mut args) {
            Ok(h) => h,
            Err(e) => {
                debug!("rpc: dropping undecodable message from {}: {}", peer, e);
                return None;
            }
        };

        let mut out = XdrWriter::with_capacity(512);
        if header.rpc_version != RPC_VERSION {
            debug!(
                "rpc: xid={:#x} rpc version {} from {}",
                header.xid, header.rpc_version, peer
            );
            encode_rpc_mismatch(&mut out, header.xid);
            return Some(out.into_bytes());
        }

        let Some(program) = self.programs.get(&header.program) else {
            debug!("rpc: xid={:#x} unknown program {}", header.xid, header.program);
            encode_accepted(&mut out, header.xid, AcceptStat::ProgUnavail);
            return Some(out.into_bytes());
        };

        let versions = program.versions();
        if !versions.contains(&header.version) {
            debug!(
                "rpc: xid={:#x} {} version {} not supported",
                header.xid,
                program.name(),
                header.version
            );
            encode_prog_mismatch(&mut out, header.xid, *versions.start(), *versions.end());
            return Some(out.into_bytes());
        }

        let call = RpcCall {
            xid: header.xid,
            program: header.program,
            version: header.version,
            procedure: header.procedure,
            peer,
            credential: header.credential,
        };
        trace!(
            "rpc: xid={:#x} {} v{} proc {} from {}",
            call.xid,
            program.name(),
            call.version,
            call.procedure,
            peer
        );

        let mut body = XdrWriter::with_capacity(512);
        let stat = match program.call(&call, &mut args, &mut body) {
            Ok(()) => AcceptStat::Success,
            Err(ProcError::Garbage(e)) => {
                warn!(
                    "rpc: {} proc {} from {}: {}",
                    program.name(),
                    call.procedure,
                    peer,
                    e
                );
                AcceptStat::GarbageArgs
            }
            Err(ProcError::Unavailable) => AcceptStat::ProcUnavail,
            Err(ProcError::System(msg)) => {
                warn!(
                    "rpc: {} proc {} from {}: {}",
                    program.name(),
                    call.procedure,
                    peer,
                    msg
                );
                AcceptStat::SystemErr
            }
        };

        encode_accepted(&mut out, call.xid, stat);
        if stat == AcceptStat::Success {
            out.write_fixed_opaque(body.as_bytes());
        }
        Some(out.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfsd_xdr::rpc::{ReplyHeader, ReplyStatus, RPC_MISMATCH};

    struct Echo;

    impl RpcProgram for Echo {
        fn program(&self) -> u32 {
            400_000
        }

        fn versions(&self) -> RangeInclusive<u32> {
            1..=2
        }

        fn name(&self) -> &'static str {
            "echo"
        }

        fn call(
            &self,
            call: &RpcCall,
            args: &mut XdrReader<'_>,
            out: &mut XdrWriter,
        ) -> ProcResult {
            match call.procedure {
                0 => Ok(()),
                1 => {
                    let v = args.read_u32()?;
                    out.write_u32(v + 1);
                    Ok(())
                }
                2 => Err(ProcError::System("boom".into())),
                _ => Err(ProcError::Unavailable),
            }
        }
    }

    fn dispatcher() -> RpcDispatcher {
        RpcDispatcher::new([Arc::new(Echo) as Arc<dyn RpcProgram>])
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:700".parse().unwrap()
    }

    fn call(header: CallHeader, args: &[u32]) -> (ReplyHeader, Vec<u8>) {
        let mut w = XdrWriter::new();
        header.encode(&mut w);
        for a in args {
            w.write_u32(*a);
        }
        let reply = dispatcher().handle(w.as_bytes(), peer()).unwrap();
        let mut r = XdrReader::new(&reply);
        let h = ReplyHeader::decode(&mut r).unwrap();
        (h, r.rest().to_vec())
    }

    #[test]
    fn test_success_carries_body() {
        let (h, body) = call(CallHeader::new(5, 400_000, 1, 1), &[41]);
        assert_eq!(h.xid, 5);
        assert_eq!(h.status, ReplyStatus::Accepted(AcceptStat::Success));
        assert_eq!(body, vec![0, 0, 0, 42]);
    }

    #[test]
    fn test_missing_args_are_garbage() {
        let (h, body) = call(CallHeader::new(6, 400_000, 1, 1), &[]);
        assert_eq!(h.status, ReplyStatus::Accepted(AcceptStat::GarbageArgs));
        assert!(body.is_empty());
    }

    #[test]
    fn test_unknown_program_and_procedure() {
        let (h, _) = call(CallHeader::new(7, 123, 1, 0), &[]);
        assert_eq!(h.status, ReplyStatus::Accepted(AcceptStat::ProgUnavail));

        let (h, _) = call(CallHeader::new(8, 400_000, 1, 99), &[]);
        assert_eq!(h.status, ReplyStatus::Accepted(AcceptStat::ProcUnavail));

        let (h, _) = call(CallHeader::new(9, 400_000, 1, 2), &[]);
        assert_eq!(h.status, ReplyStatus::Accepted(AcceptStat::SystemErr));
    }

    #[test]
    fn test_version_mismatch_reports_range() {
        let (h, body) = call(CallHeader::new(10, 400_000, 3, 0), &[]);
        assert_eq!(h.status, ReplyStatus::Accepted(AcceptStat::ProgMismatch));
        assert_eq!(body, vec![0, 0, 0, 1, 0, 0, 0, 2]);
    }

    #[test]
    fn test_rpc_version_mismatch() {
        let mut header = CallHeader::new(11, 400_000, 1, 0);
        header.rpc_version = 3;
        let (h, _) = call(header, &[]);
        assert_eq!(h.status, ReplyStatus::Denied(RPC_MISMATCH));
    }

    #[test]
    fn test_garbage_message_gets_no_reply() {
        assert!(dispatcher().handle(&[1, 2, 3], peer()).is_none());
    }
}
