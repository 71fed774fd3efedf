//! Fixed binary header shared by both ends of an RDT session.
//!
//! Wire layout (all integers big-endian, 11-byte header):
//!
//! ```text
//! +------------+-------+----------+------------+--- payload ---+
//! | seq_num(4) | flags | length(2)| checksum(4) |   0..32 bytes |
//! +------------+-------+----------+------------+----------------+
//! ```
//!
//! The checksum is a CRC32 (IEEE/zlib polynomial) computed over the header
//! fields *excluding* the checksum itself, concatenated with the payload.
//! `MAX_PAYLOAD` is kept small on purpose: combined with the session's fixed
//! inter-packet gap it caps the link well under 500 bps.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum payload carried by a single DATA packet, in bytes.
pub const MAX_PAYLOAD: usize = 32;

/// Bit set in `flags` when the packet is an acknowledgement rather than data.
pub const FLAG_ACK: u8 = 0x01;

/// `seq_num(4) + flags(1) + length(2) + checksum(4)`.
pub const HEADER_SIZE: usize = 11;

/// A single RDT protocol packet: either a DATA packet carrying a payload
/// chunk, or a bare ACK for a given sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq_num: u32,
    pub flags: u8,
    pub payload: Bytes,
}

impl Packet {
    /// Build a DATA packet.
    pub fn data(seq_num: u32, payload: Bytes) -> Self {
        Self {
            seq_num,
            flags: 0,
            payload,
        }
    }

    /// Build a bare ACK packet for `seq_num`.
    pub fn ack(seq_num: u32) -> Self {
        Self {
            seq_num,
            flags: FLAG_ACK,
            payload: Bytes::new(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    /// Encode this packet, including a freshly computed checksum, into a
    /// standalone buffer ready to hand to `UdpSocket::send_to`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let checksum = checksum_of(self.seq_num, self.flags, self.payload.len() as u16, &self.payload);
        buf.put_u32(self.seq_num);
        buf.put_u8(self.flags);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u32(checksum);
        buf.put_slice(&self.payload);
    }

    /// Decode a packet from a raw datagram, returning whether the checksum
    /// matched. A checksum mismatch is not an error: the caller is expected
    /// to log and drop the packet, same as any other wire-level fault.
    ///
    /// Returns `None` if the buffer is too short to contain a header, or
    /// shorter than the length it declares.
    pub fn decode(mut data: &[u8]) -> Option<(Self, bool)> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let seq_num = data.get_u32();
        let flags = data.get_u8();
        let length = data.get_u16() as usize;
        let checksum = data.get_u32();

        if data.len() < length {
            return None;
        }
        let payload = Bytes::copy_from_slice(&data[..length]);

        let ok = checksum_of(seq_num, flags, length as u16, &payload) == checksum;
        Some((
            Packet {
                seq_num,
                flags,
                payload,
            },
            ok,
        ))
    }
}

fn checksum_of(seq_num: u32, flags: u8, length: u16, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq_num.to_be_bytes());
    hasher.update(&[flags]);
    hasher.update(&length.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
