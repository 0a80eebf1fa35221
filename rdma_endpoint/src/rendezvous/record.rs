//! Rendezvous record wire format.
//!
//! On the wire a record is a 2-byte big-endian length prefix followed by
//! exactly [`RENDEZVOUS_RECORD_LEN`] bytes:
//!
//! ```text
//!  0      4  5  6    8       12      16                32          40          48      52     56    58      64
//!  ┌──────┬──┬──┬────┬───────┬───────┬─────────────────┬───────────┬───────────┬───────┬──────┬─────┬───────┐
//!  │"RDV1"│tk│00│LID │  QPN  │  PSN  │      GID[16]    │ region va │ region len│ rkey  │ IPv4 │port │ 0...  │
//!  └──────┴──┴──┴────┴───────┴───────┴─────────────────┴───────────┴───────────┴───────┴──────┴─────┴───────┘
//! ```

use crate::device::{Gid, QpEndpoint};
use crate::error::{EndpointError, EndpointResult};
use crate::region::RemoteRegion;
use rdma_common::consts::{RENDEZVOUS_MAGIC, RENDEZVOUS_RECORD_LEN};
use static_assertions::const_assert_eq;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use zerocopy::byteorder::{NetworkEndian, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// How the data path is carried once the connection is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportKind {
    /// Dedicated queue-pair link.
    Rdma = 1,
    /// The rendezvous stream itself carries the data path.
    Socket = 2,
}

impl TransportKind {
    /// Kind selected by the `connect_using_rdma` switch.
    pub fn from_config(connect_using_rdma: bool) -> Self {
        if connect_using_rdma {
            TransportKind::Rdma
        } else {
            TransportKind::Socket
        }
    }
}

impl TryFrom<u8> for TransportKind {
    type Error = EndpointError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TransportKind::Rdma),
            2 => Ok(TransportKind::Socket),
            other => Err(EndpointError::protocol(format!(
                "unknown transport kind {other}"
            ))),
        }
    }
}

/// Parameters one side hands the other during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousRecord {
    /// Data path the sender wants.
    pub transport: TransportKind,
    /// Sender's queue pair.
    pub queue_pair: QpEndpoint,
    /// Sender's registered region.
    pub region: RemoteRegion,
    /// Sender's end of the rendezvous socket.
    pub addr: SocketAddrV4,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct WireRecord {
    magic: [u8; 4],
    transport: u8,
    reserved0: u8,
    lid: U16<NetworkEndian>,
    qp_num: U32<NetworkEndian>,
    psn: U32<NetworkEndian>,
    gid: [u8; 16],
    region_addr: U64<NetworkEndian>,
    region_len: U64<NetworkEndian>,
    rkey: U32<NetworkEndian>,
    ipv4: [u8; 4],
    port: U16<NetworkEndian>,
    reserved: [u8; 6],
}

const_assert_eq!(std::mem::size_of::<WireRecord>(), RENDEZVOUS_RECORD_LEN);

impl RendezvousRecord {
    /// Encode to the fixed record layout (length prefix excluded).
    pub fn encode(&self) -> [u8; RENDEZVOUS_RECORD_LEN] {
        let wire = WireRecord {
            magic: RENDEZVOUS_MAGIC,
            transport: self.transport as u8,
            reserved0: 0,
            lid: U16::new(self.queue_pair.lid),
            qp_num: U32::new(self.queue_pair.qp_num),
            psn: U32::new(self.queue_pair.psn),
            gid: self.queue_pair.gid.0,
            region_addr: U64::new(self.region.addr),
            region_len: U64::new(self.region.len),
            rkey: U32::new(self.region.rkey),
            ipv4: self.addr.ip().octets(),
            port: U16::new(self.addr.port()),
            reserved: [0; 6],
        };
        let mut out = [0u8; RENDEZVOUS_RECORD_LEN];
        out.copy_from_slice(wire.as_bytes());
        out
    }

    /// Decode a record body.
    ///
    /// # Errors
    ///
    /// `EndpointError::Protocol` on a wrong length, bad magic, or unknown
    /// transport kind.
    pub fn decode(bytes: &[u8]) -> EndpointResult<Self> {
        let wire = WireRecord::read_from_bytes(bytes).map_err(|_| {
            EndpointError::protocol(format!(
                "record is {} bytes, expected {RENDEZVOUS_RECORD_LEN}",
                bytes.len()
            ))
        })?;

        if wire.magic != RENDEZVOUS_MAGIC {
            return Err(EndpointError::protocol(format!(
                "bad magic {:02x?}",
                wire.magic
            )));
        }

        Ok(Self {
            transport: TransportKind::try_from(wire.transport)?,
            queue_pair: QpEndpoint {
                qp_num: wire.qp_num.get(),
                psn: wire.psn.get(),
                lid: wire.lid.get(),
                gid: Gid(wire.gid),
            },
            region: RemoteRegion {
                addr: wire.region_addr.get(),
                len: wire.region_len.get(),
                rkey: wire.rkey.get(),
            },
            addr: SocketAddrV4::new(Ipv4Addr::from(wire.ipv4), wire.port.get()),
        })
    }
}

/// Write `record` with its length prefix.
pub fn write_record<W: Write>(writer: &mut W, record: &RendezvousRecord) -> io::Result<()> {
    let mut frame = Vec::with_capacity(2 + RENDEZVOUS_RECORD_LEN);
    frame.extend_from_slice(&(RENDEZVOUS_RECORD_LEN as u16).to_be_bytes());
    frame.extend_from_slice(&record.encode());
    writer.write_all(&frame)?;
    writer.flush()
}

/// Read one length-prefixed frame. The body is not interpreted.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 2];
    reader.read_exact(&mut prefix)?;
    let mut body = vec![0u8; usize::from(u16::from_be_bytes(prefix))];
    reader.read_exact(&mut body)?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn sample() -> RendezvousRecord {
        RendezvousRecord {
            transport: TransportKind::Rdma,
            queue_pair: QpEndpoint {
                qp_num: 0x12_3456,
                psn: 0xAB_CDEF,
                lid: 40_001,
                gid: Gid::from_ipv4(Ipv4Addr::new(192, 168, 1, 2)),
            },
            region: RemoteRegion {
                addr: 0x7F00_0000_1000,
                len: 4096,
                rkey: 0xDEAD_BEEF,
            },
            addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5555),
        }
    }

    #[test]
    fn layout_is_big_endian() {
        let bytes = sample().encode();
        assert_eq!(&bytes[0..4], b"RDV1");
        assert_eq!(bytes[4], TransportKind::Rdma as u8);
        assert_eq!(&bytes[6..8], &40_001u16.to_be_bytes());
        assert_eq!(&bytes[8..12], &0x12_3456u32.to_be_bytes());
        assert_eq!(&bytes[48..52], &0xDEAD_BEEFu32.to_be_bytes());
        assert_eq!(&bytes[52..56], &[127, 0, 0, 1]);
        assert_eq!(&bytes[56..58], &5555u16.to_be_bytes());
        assert!(bytes[58..].iter().all(|b| *b == 0));
    }

    #[test]
    fn framed_record_reads_back() {
        let mut wire = Vec::new();
        write_record(&mut wire, &sample()).unwrap();
        assert_eq!(&wire[..2], &[0, 64]);

        let body = read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(RendezvousRecord::decode(&body).unwrap(), sample());
    }

    #[test]
    fn wrong_length_is_protocol_error() {
        let bytes = sample().encode();
        assert!(matches!(
            RendezvousRecord::decode(&bytes[..63]),
            Err(EndpointError::Protocol { .. })
        ));
        assert!(matches!(
            RendezvousRecord::decode(&[0u8; 65]),
            Err(EndpointError::Protocol { .. })
        ));
    }

    #[test]
    fn bad_magic_is_protocol_error() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(
            RendezvousRecord::decode(&bytes),
            Err(EndpointError::Protocol { .. })
        ));
    }

    #[test]
    fn unknown_transport_is_protocol_error() {
        let mut bytes = sample().encode();
        bytes[4] = 9;
        let err = RendezvousRecord::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("transport kind 9"));
    }

    proptest! {
        #[test]
        fn any_record_roundtrips(
            socket in any::<bool>(),
            qp_num in 0u32..=0xFF_FFFF,
            psn in 0u32..=0xFF_FFFF,
            lid in any::<u16>(),
            gid in any::<[u8; 16]>(),
            addr in any::<u64>(),
            len in any::<u64>(),
            rkey in any::<u32>(),
            ip in any::<[u8; 4]>(),
            port in any::<u16>(),
        ) {
            let record = RendezvousRecord {
                transport: TransportKind::from_config(!socket),
                queue_pair: QpEndpoint { qp_num, psn, lid, gid: Gid(gid) },
                region: RemoteRegion { addr, len, rkey },
                addr: SocketAddrV4::new(Ipv4Addr::from(ip), port),
            };
            prop_assert_eq!(RendezvousRecord::decode(&record.encode()).unwrap(), record);
        }
    }
}
