//! Data path framing for the soft device link.
//!
//! Every message is a fixed 32-byte big-endian header, optionally followed
//! by `len` payload bytes (`WRITE`, `WRITE_IMM`, successful `READ_RESP`).

use static_assertions::const_assert_eq;
use std::io::{self, Read, Write};
use zerocopy::byteorder::{NetworkEndian, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Link greeting: `seq` carries the sender QPN, `imm` the expected receiver QPN.
pub const OP_HELLO: u8 = 1;
/// Remote write, payload follows.
pub const OP_WRITE: u8 = 2;
/// Remote write with immediate, payload follows.
pub const OP_WRITE_IMM: u8 = 3;
/// Remote read request.
pub const OP_READ_REQ: u8 = 4;
/// Remote read response, payload follows on success.
pub const OP_READ_RESP: u8 = 5;
/// Acknowledgement of a write; `status` carries the outcome.
pub const OP_ACK: u8 = 6;

/// Encoded header length.
pub const HEADER_LEN: usize = 32;

/// Fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FrameHeader {
    /// One of the `OP_*` constants.
    pub opcode: u8,
    /// Completion status code for `ACK` and `READ_RESP`.
    pub status: u8,
    reserved: [u8; 2],
    /// Immediate data.
    pub imm: U32<NetworkEndian>,
    /// Sender-assigned sequence number.
    pub seq: U64<NetworkEndian>,
    /// Remote virtual address.
    pub addr: U64<NetworkEndian>,
    /// Remote key.
    pub rkey: U32<NetworkEndian>,
    /// Payload or requested length.
    pub len: U32<NetworkEndian>,
}

const_assert_eq!(std::mem::size_of::<FrameHeader>(), HEADER_LEN);

impl FrameHeader {
    fn new(opcode: u8) -> Self {
        Self {
            opcode,
            status: 0,
            reserved: [0; 2],
            imm: U32::ZERO,
            seq: U64::ZERO,
            addr: U64::ZERO,
            rkey: U32::ZERO,
            len: U32::ZERO,
        }
    }

    /// Link greeting.
    pub fn hello(local_qpn: u32, remote_qpn: u32) -> Self {
        let mut h = Self::new(OP_HELLO);
        h.seq = U64::new(u64::from(local_qpn));
        h.imm = U32::new(remote_qpn);
        h
    }

    /// Write or write-with-immediate request.
    pub fn write(seq: u64, addr: u64, rkey: u32, len: u32, imm: Option<u32>) -> Self {
        let mut h = Self::new(if imm.is_some() { OP_WRITE_IMM } else { OP_WRITE });
        h.seq = U64::new(seq);
        h.addr = U64::new(addr);
        h.rkey = U32::new(rkey);
        h.len = U32::new(len);
        h.imm = U32::new(imm.unwrap_or(0));
        h
    }

    /// Read request.
    pub fn read_request(seq: u64, addr: u64, rkey: u32, len: u32) -> Self {
        let mut h = Self::new(OP_READ_REQ);
        h.seq = U64::new(seq);
        h.addr = U64::new(addr);
        h.rkey = U32::new(rkey);
        h.len = U32::new(len);
        h
    }

    /// Read response; `len` is 0 unless `status` is success.
    pub fn read_response(seq: u64, status: u8, len: u32) -> Self {
        let mut h = Self::new(OP_READ_RESP);
        h.seq = U64::new(seq);
        h.status = status;
        h.len = U32::new(len);
        h
    }

    /// Write acknowledgement.
    pub fn ack(seq: u64, status: u8) -> Self {
        let mut h = Self::new(OP_ACK);
        h.seq = U64::new(seq);
        h.status = status;
        h
    }
}

/// Read one header, blocking.
pub fn read_header<R: Read>(reader: &mut R) -> io::Result<FrameHeader> {
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf)?;
    FrameHeader::read_from_bytes(&buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short frame header"))
}

/// Write a header and its payload in one call.
pub fn write_frame<W: Write>(writer: &mut W, header: &FrameHeader, payload: &[u8]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf)?;
    writer.flush()
}
