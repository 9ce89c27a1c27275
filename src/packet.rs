//! The two envelope framings and the data-packet header.
//!
//! All multi-byte fields are little-endian. A datagram whose first byte has
//! bit 7 set is a data packet; otherwise the first byte is a message tag and
//! the body is protobuf in either the plain envelope (tag + body) or the
//! padded envelope (tag + length + body + zero padding to 512 bytes).

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::{MAX_UDP_PAYLOAD, MIN_PADDED_PACKET_SIZE};

/// Bit 7 of the lead byte marks a data packet
pub(crate) const DATA_PACKET_BIT: u8 = 0x80;
/// Data-header flag: a varint-prefixed stats blob precedes the chunk
pub(crate) const FLAG_PROTOBUF_BLOB: u8 = 0x01;

/// Lead byte + recipient connection ID + wire sequence number
pub(crate) const DATA_HEADER_SIZE: usize = 7;
/// Tag byte + body length of the padded envelope
const PADDED_HEADER_SIZE: usize = 3;

pub(crate) fn is_data_packet(lead: u8) -> bool {
    lead & DATA_PACKET_BIT != 0
}

/// Fixed header of every data packet
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct DataHeader {
    pub flags: u8,
    /// The *recipient's* connection ID
    pub to_connection_id: u32,
    /// Low 16 bits of the full 64-bit packet sequence
    pub wire_seq: u16,
}

impl DataHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(is_data_packet(self.flags));
        buf.put_u8(self.flags);
        buf.put_u32_le(self.to_connection_id);
        buf.put_u16_le(self.wire_seq);
    }

    /// Split a datagram into its header and the remainder
    pub fn decode(pkt: &[u8]) -> Result<(Self, &[u8]), PacketDecodeError> {
        if pkt.len() < DATA_HEADER_SIZE {
            return Err(PacketDecodeError::TooSmall { len: pkt.len() });
        }
        let header = Self {
            flags: pkt[0],
            to_connection_id: u32::from_le_bytes(pkt[1..5].try_into().unwrap()),
            wire_seq: u16::from_le_bytes(pkt[5..7].try_into().unwrap()),
        };
        Ok((header, &pkt[DATA_HEADER_SIZE..]))
    }
}

/// Encode `tag || body`
///
/// Fails only if the result would exceed the datagram budget, which indicates
/// a bug in the caller rather than anything wire-induced.
pub(crate) fn encode_plain_msg<M: Message>(tag: u8, msg: &M) -> Result<Bytes, MtuOverflow> {
    debug_assert!(!is_data_packet(tag));
    let body_len = msg.encoded_len();
    if 1 + body_len > MAX_UDP_PAYLOAD {
        return Err(MtuOverflow {
            tag,
            len: 1 + body_len,
        });
    }
    let mut buf = BytesMut::with_capacity(1 + body_len);
    buf.put_u8(tag);
    msg.encode(&mut buf).expect("buffer sized from encoded_len");
    Ok(buf.freeze())
}

/// Encode `tag || len || body`, zero-padded to the minimum padded size.
///
/// The padding is always zeroed so no process memory ever leaks to the wire.
pub(crate) fn encode_padded_msg<M: Message>(tag: u8, msg: &M) -> Result<Bytes, MtuOverflow> {
    debug_assert!(!is_data_packet(tag));
    let body_len = msg.encoded_len();
    if PADDED_HEADER_SIZE + body_len > MAX_UDP_PAYLOAD {
        return Err(MtuOverflow {
            tag,
            len: PADDED_HEADER_SIZE + body_len,
        });
    }
    let total = (PADDED_HEADER_SIZE + body_len).max(MIN_PADDED_PACKET_SIZE);
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(tag);
    buf.put_u16_le(body_len as u16);
    msg.encode(&mut buf).expect("buffer sized from encoded_len");
    buf.resize(total, 0);
    Ok(buf.freeze())
}

/// Parse the body of a plain-envelope datagram (everything after the tag)
pub(crate) fn decode_plain_msg<M: Message + Default>(pkt: &[u8]) -> Result<M, PacketDecodeError> {
    debug_assert!(!pkt.is_empty());
    M::decode(&pkt[1..]).map_err(PacketDecodeError::Protobuf)
}

/// Parse a padded-envelope datagram, enforcing the minimum padded size
pub(crate) fn decode_padded_msg<M: Message + Default>(pkt: &[u8]) -> Result<M, PacketDecodeError> {
    if pkt.len() < MIN_PADDED_PACKET_SIZE {
        return Err(PacketDecodeError::NotPadded { len: pkt.len() });
    }
    let body_len = u16::from_le_bytes(pkt[1..3].try_into().unwrap()) as usize;
    if body_len == 0 || PADDED_HEADER_SIZE + body_len > pkt.len() {
        return Err(PacketDecodeError::BadLength { body_len });
    }
    M::decode(&pkt[PADDED_HEADER_SIZE..PADDED_HEADER_SIZE + body_len])
        .map_err(PacketDecodeError::Protobuf)
}

/// A message too large for the datagram budget; callers drop it rather than
/// truncate
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("message tag {tag} serializes to {len} bytes, over the datagram budget")]
pub(crate) struct MtuOverflow {
    pub tag: u8,
    pub len: usize,
}

#[derive(Debug, Error)]
pub(crate) enum PacketDecodeError {
    #[error("{len} byte packet is too small")]
    TooSmall { len: usize },
    #[error("packet of {len} bytes is below the required padded minimum")]
    NotPadded { len: usize },
    #[error("invalid encoded message length {body_len}")]
    BadLength { body_len: usize },
    #[error("protobuf parse failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
}
