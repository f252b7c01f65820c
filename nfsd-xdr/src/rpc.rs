//! ONC RPC v2 call/reply headers and TCP record marking.

use byteorder::{BigEndian, ByteOrder};

use crate::{XdrError, XdrReader, XdrWriter};

pub const RPC_VERSION: u32 = 2;

pub const CALL: u32 = 0;
pub const REPLY: u32 = 1;

pub const MSG_ACCEPTED: u32 = 0;
pub const MSG_DENIED: u32 = 1;

/// `reject_stat` for an unsupported RPC protocol version.
pub const RPC_MISMATCH: u32 = 0;

pub const AUTH_NULL: u32 = 0;
pub const AUTH_UNIX: u32 = 1;

/// Upper bound on credential and verifier bodies.
pub const MAX_AUTH_BYTES: usize = 400;

/// Set in a record-marking header on the last fragment of a record.
pub const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Result of an accepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcceptStat {
    Success = 0,
    ProgUnavail = 1,
    ProgMismatch = 2,
    ProcUnavail = 3,
    GarbageArgs = 4,
    SystemErr = 5,
}

impl TryFrom<u32> for AcceptStat {
    type Error = XdrError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(AcceptStat::Success),
            1 => Ok(AcceptStat::ProgUnavail),
            2 => Ok(AcceptStat::ProgMismatch),
            3 => Ok(AcceptStat::ProcUnavail),
            4 => Ok(AcceptStat::GarbageArgs),
            5 => Ok(AcceptStat::SystemErr),
            _ => Err(XdrError::InvalidMessage(format!("unknown accept_stat {}", v))),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// AUTH_UNIX credential body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixCredential {
    pub stamp: u32,
    pub machine: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Null,
    Unix(UnixCredential),
    Other { flavor: u32, body: Vec<u8> },
}

impl Credential {
    fn decode(r: &mut XdrReader<'_>) -> Result<Self, XdrError> {
        let flavor = r.read_u32()?;
        let body = r.read_opaque(MAX_AUTH_BYTES)?;
        match flavor {
            AUTH_NULL => Ok(Credential::Null),
            AUTH_UNIX => {
                let mut b = XdrReader::new(body);
                let stamp = b.read_u32()?;
                let machine = b.read_string(255)?;
                let uid = b.read_u32()?;
                let gid = b.read_u32()?;
                let count = b.read_u32()? as usize;
                if count > 16 {
                    return Err(XdrError::TooLong { len: count, max: 16 });
                }
                let mut gids = Vec::with_capacity(count);
                for _ in 0..count {
                    gids.push(b.read_u32()?);
                }
                Ok(Credential::Unix(UnixCredential {
                    stamp,
                    machine,
                    uid,
                    gid,
                    gids,
                }))
            }
            _ => Ok(Credential::Other {
                flavor,
                body: body.to_vec(),
            }),
        }
    }

    fn encode(&self, w: &mut XdrWriter) {
        match self {
            Credential::Null => {
                w.write_u32(AUTH_NULL);
                w.write_u32(0);
            }
            Credential::Unix(cred) => {
                let mut body = XdrWriter::new();
                body.write_u32(cred.stamp);
                body.write_string(&cred.machine);
                body.write_u32(cred.uid);
                body.write_u32(cred.gid);
                body.write_u32(cred.gids.len() as u32);
                for gid in &cred.gids {
                    body.write_u32(*gid);
                }
                w.write_u32(AUTH_UNIX);
                w.write_opaque(body.as_bytes());
            }
            Credential::Other { flavor, body } => {
                w.write_u32(*flavor);
                w.write_opaque(body);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Call header
// ---------------------------------------------------------------------------

/// Decoded header of an RPC call message. Procedure arguments follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub rpc_version: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub credential: Credential,
}

impl CallHeader {
    pub fn new(xid: u32, program: u32, version: u32, procedure: u32) -> Self {
        Self {
            xid,
            rpc_version: RPC_VERSION,
            program,
            version,
            procedure,
            credential: Credential::Null,
        }
    }

    pub fn decode(r: &mut XdrReader<'_>) -> Result<Self, XdrError> {
        let xid = r.read_u32()?;
        let msg_type = r.read_u32()?;
        if msg_type != CALL {
            return Err(XdrError::InvalidMessage(format!(
                "expected CALL, got message type {}",
                msg_type
            )));
        }
        let rpc_version = r.read_u32()?;
        let program = r.read_u32()?;
        let version = r.read_u32()?;
        let procedure = r.read_u32()?;
        let credential = Credential::decode(r)?;
        // Verifier is not checked.
        let _flavor = r.read_u32()?;
        r.read_opaque(MAX_AUTH_BYTES)?;
        Ok(Self {
            xid,
            rpc_version,
            program,
            version,
            procedure,
            credential,
        })
    }

    pub fn encode(&self, w: &mut XdrWriter) {
        w.write_u32(self.xid);
        w.write_u32(CALL);
        w.write_u32(self.rpc_version);
        w.write_u32(self.program);
        w.write_u32(self.version);
        w.write_u32(self.procedure);
        self.credential.encode(w);
        Credential::Null.encode(w);
    }
}

// ---------------------------------------------------------------------------
// Reply header
// ---------------------------------------------------------------------------

fn write_accepted_prefix(w: &mut XdrWriter, xid: u32) {
    w.write_u32(xid);
    w.write_u32(REPLY);
    w.write_u32(MSG_ACCEPTED);
    // AUTH_NULL verifier
    w.write_u32(AUTH_NULL);
    w.write_u32(0);
}

/// Accepted reply header; for [`AcceptStat::Success`] the results follow.
pub fn encode_accepted(w: &mut XdrWriter, xid: u32, stat: AcceptStat) {
    write_accepted_prefix(w, xid);
    w.write_u32(stat as u32);
}

/// Accepted reply for a program that does not support the requested version.
pub fn encode_prog_mismatch(w: &mut XdrWriter, xid: u32, low: u32, high: u32) {
    write_accepted_prefix(w, xid);
    w.write_u32(AcceptStat::ProgMismatch as u32);
    w.write_u32(low);
    w.write_u32(high);
}

/// Denied reply for a call that is not RPC version 2.
pub fn encode_rpc_mismatch(w: &mut XdrWriter, xid: u32) {
    w.write_u32(xid);
    w.write_u32(REPLY);
    w.write_u32(MSG_DENIED);
    w.write_u32(RPC_MISMATCH);
    w.write_u32(RPC_VERSION);
    w.write_u32(RPC_VERSION);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Accepted(AcceptStat),
    Denied(u32),
}

/// Decoded reply header, used by clients and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: u32,
    pub status: ReplyStatus,
}

impl ReplyHeader {
    /// Decode the header; on success the reader is left at the results.
    pub fn decode(r: &mut XdrReader<'_>) -> Result<Self, XdrError> {
        let xid = r.read_u32()?;
        let msg_type = r.read_u32()?;
        if msg_type != REPLY {
            return Err(XdrError::InvalidMessage(format!(
                "expected REPLY, got message type {}",
                msg_type
            )));
        }
        let status = match r.read_u32()? {
            MSG_ACCEPTED => {
                let _flavor = r.read_u32()?;
                r.read_opaque(MAX_AUTH_BYTES)?;
                ReplyStatus::Accepted(AcceptStat::try_from(r.read_u32()?)?)
            }
            MSG_DENIED => ReplyStatus::Denied(r.read_u32()?),
            other => {
                return Err(XdrError::InvalidMessage(format!(
                    "unknown reply_stat {}",
                    other
                )))
            }
        };
        Ok(Self { xid, status })
    }
}

// ---------------------------------------------------------------------------
// Record marking
// ---------------------------------------------------------------------------

/// Frame `payload` as a single last fragment.
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    let mut header = [0u8; 4];
    BigEndian::write_u32(&mut header, LAST_FRAGMENT | payload.len() as u32);
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    out
}

/// Split a fragment header into (last fragment, fragment length).
pub fn decode_fragment_header(header: [u8; 4]) -> (bool, usize) {
    let raw = BigEndian::read_u32(&header);
    (raw & LAST_FRAGMENT != 0, (raw & !LAST_FRAGMENT) as usize)
}

/// Reassembles record-marked fragments into whole records.
#[derive(Debug)]
pub struct RecordAssembler {
    buf: Vec<u8>,
    max_record: usize,
}

impl RecordAssembler {
    pub fn new(max_record: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_record,
        }
    }

    /// Check a fragment length before reading its body.
    pub fn check_fragment(&self, len: usize) -> Result<(), XdrError> {
        if self.buf.len() + len > self.max_record {
            return Err(XdrError::TooLong {
                len: self.buf.len() + len,
                max: self.max_record,
            });
        }
        Ok(())
    }

    /// Add one fragment; returns the whole record once the last one arrives.
    pub fn push(&mut self, last: bool, data: &[u8]) -> Result<Option<Vec<u8>>, XdrError> {
        self.check_fragment(data.len())?;
        self.buf.extend_from_slice(data);
        if last {
            Ok(Some(std::mem::take(&mut self.buf)))
        } else {
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_header_with_unix_credential() {
        let mut header = CallHeader::new(0x42, 100003, 2, 1);
        header.credential = Credential::Unix(UnixCredential {
            stamp: 7,
            machine: "guest".into(),
            uid: 20,
            gid: 20,
            gids: vec![0, 5],
        });
        let mut w = XdrWriter::new();
        header.encode(&mut w);
        w.write_u32(0xdead_beef);

        let mut r = XdrReader::new(w.as_bytes());
        let decoded = CallHeader::decode(&mut r).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_reply_rejected_as_call() {
        let mut w = XdrWriter::new();
        encode_accepted(&mut w, 1, AcceptStat::Success);
        let mut r = XdrReader::new(w.as_bytes());
        assert!(matches!(
            CallHeader::decode(&mut r),
            Err(XdrError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_accepted_reply_decodes() {
        let mut w = XdrWriter::new();
        encode_accepted(&mut w, 9, AcceptStat::ProcUnavail);
        let mut r = XdrReader::new(w.as_bytes());
        let reply = ReplyHeader::decode(&mut r).unwrap();
        assert_eq!(reply.xid, 9);
        assert_eq!(
            reply.status,
            ReplyStatus::Accepted(AcceptStat::ProcUnavail)
        );
    }

    #[test]
    fn test_rpc_mismatch_is_denied() {
        let mut w = XdrWriter::new();
        encode_rpc_mismatch(&mut w, 3);
        let mut r = XdrReader::new(w.as_bytes());
        let reply = ReplyHeader::decode(&mut r).unwrap();
        assert_eq!(reply.status, ReplyStatus::Denied(RPC_MISMATCH));
    }

    #[test]
    fn test_record_header() {
        let framed = encode_record(b"abcd");
        assert_eq!(&framed[..4], &[0x80, 0, 0, 4]);
        let (last, len) = decode_fragment_header([framed[0], framed[1], framed[2], framed[3]]);
        assert!(last);
        assert_eq!(len, 4);
    }

    #[test]
    fn test_record_assembly_across_fragments() {
        let mut asm = RecordAssembler::new(64);
        assert!(asm.push(false, b"hel").unwrap().is_none());
        let record = asm.push(true, b"lo").unwrap().unwrap();
        assert_eq!(record, b"hello");
        // Assembler is reusable for the next record.
        assert_eq!(asm.push(true, b"x").unwrap().unwrap(), b"x");
    }

    #[test]
    fn test_record_limit() {
        let mut asm = RecordAssembler::new(4);
        assert!(asm.push(false, b"abc").unwrap().is_none());
        assert!(matches!(
            asm.push(true, b"de"),
            Err(XdrError::TooLong { len: 5, max: 4 })
        ));
    }
}
