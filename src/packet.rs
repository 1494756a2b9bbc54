//! Wire-format definitions for CHAOS packets.
//!
//! Every packet exchanged with the daemon is a [`Packet`]. This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, payload, trailer).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw frame back into a [`Packet`], returning errors for
//!   malformed or truncated input.
//!
//! No I/O happens here - this is pure data transformation.
//!
//! # Wire format
//!
//! All fields are **little-endian** 16-bit words.
//!
//! ```text
//! +--------+--------+-------+----------+-------+---------+---------+-----+
//! | op<<8  | length | dest  | dest_idx | src   | src_idx | pkt_num | ack |
//! +--------+--------+-------+----------+-------+---------+---------+-----+
//! |                payload (length bytes, +1 pad if odd)               ...|
//! +---------+--------+----------+
//! | hw_dest | hw_src | checksum |
//! +---------+--------+----------+
//! ```
//!
//! Header: [`HEADER_LEN`] = 16 bytes. The opcode occupies the upper byte of
//! the first word; the lower byte is reserved and zero. The length word holds
//! the payload size *as sent* (unpadded), so decode can strip the filler byte
//! an odd-length payload carries on the wire.
//!
//! Trailer: [`TRAILER_LEN`] = 6 bytes of link-layer addressing. The checksum
//! word is always written as zero and never validated; the existing peer does
//! not enforce it either, and starting to would break interoperability.

use crate::error::{ChaosError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 16;

/// Byte length of the link-layer trailer.
pub const TRAILER_LEN: usize = 6;

/// Smallest possible frame: empty payload between header and trailer.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;

/// Maximum payload carried by a single data packet.
pub const MAX_DATA_SIZE: usize = 488;

/// Filler byte appended on the wire when the payload length is odd.
const PAD_BYTE: u8 = b'X';

// Byte offsets of each header field within a serialised frame.
const OFF_OP: usize = 0;
const OFF_LEN: usize = 2;
const OFF_DEST: usize = 4;
const OFF_DEST_IDX: usize = 6;
const OFF_SRC: usize = 8;
const OFF_SRC_IDX: usize = 10;
const OFF_PKT_NUM: usize = 12;
const OFF_ACK: usize = 14;

/// CHAOS protocol operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Request for connection (carries the service name).
    Rfc = 1,
    /// Connection opened by the peer.
    Opn = 2,
    /// Close (refusal during handshake, teardown afterwards).
    Cls = 3,
    /// Forward to another host.
    Fwd = 4,
    /// Simple answer (datagram-style reply to an RFC).
    Ans = 5,
    /// Sense: ask the peer to resend its status.
    Sns = 6,
    /// Status: receipt + window, doubles as the acknowledgment.
    Sts = 7,
    /// Routing information.
    Rut = 8,
    /// Lossage: the peer gave up on a packet.
    Los = 9,
    /// Listen for a connection.
    Lsn = 10,
    /// Mount.
    Mnt = 11,
    /// End of data.
    Eof = 12,
    /// Uncontrolled data (no flow control).
    Unc = 13,
    /// Broadcast.
    Brd = 14,
    /// Controlled data.
    Dat = 0o200,
    /// Controlled data, variant 1.
    Dat1 = 0o201,
    /// Controlled data, variant 2.
    Dat2 = 0o202,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Rfc),
            2 => Some(Self::Opn),
            3 => Some(Self::Cls),
            4 => Some(Self::Fwd),
            5 => Some(Self::Ans),
            6 => Some(Self::Sns),
            7 => Some(Self::Sts),
            8 => Some(Self::Rut),
            9 => Some(Self::Los),
            10 => Some(Self::Lsn),
            11 => Some(Self::Mnt),
            12 => Some(Self::Eof),
            13 => Some(Self::Unc),
            14 => Some(Self::Brd),
            0o200 => Some(Self::Dat),
            0o201 => Some(Self::Dat1),
            0o202 => Some(Self::Dat2),
            _ => None,
        }
    }

    /// Whether this opcode carries in-sequence application data.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Dat | Self::Dat1 | Self::Dat2)
    }
}

/// A complete CHAOS packet: header fields + payload + link-layer trailer.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub op: Opcode,
    /// Application payload, exactly as sent (no wire padding).
    pub payload: Bytes,
    pub dest_addr: u16,
    pub dest_idx: u16,
    pub src_addr: u16,
    pub src_idx: u16,
    /// Sequence number, wraps modulo 65536.
    pub pkt_num: u16,
    /// Last in-order sequence number seen from the peer.
    pub ack: u16,
    /// Link-layer destination address.
    pub hw_dest: u16,
    /// Link-layer source address.
    pub hw_src: u16,
    /// Always zero on encode; stored but never validated on decode.
    pub hw_checksum: u16,
}

impl Packet {
    /// Build a packet for transmission.
    ///
    /// The link-layer trailer mirrors the protocol addresses: source and
    /// destination are assumed to share a subnet, and the checksum is zero.
    ///
    /// Fails with [`ChaosError::MalformedPacket`] when the payload exceeds
    /// [`MAX_DATA_SIZE`]; the send path chunks data below the limit, so this
    /// only trips on an oversized caller-supplied field such as a service
    /// name.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        op: Opcode,
        payload: impl Into<Bytes>,
        dest_addr: u16,
        dest_idx: u16,
        src_addr: u16,
        src_idx: u16,
        pkt_num: u16,
        ack: u16,
    ) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_DATA_SIZE {
            return Err(ChaosError::MalformedPacket(format!(
                "payload of {} bytes exceeds the {} byte maximum",
                payload.len(),
                MAX_DATA_SIZE
            )));
        }
        Ok(Self {
            op,
            payload,
            dest_addr,
            dest_idx,
            src_addr,
            src_idx,
            pkt_num,
            ack,
            hw_dest: dest_addr,
            hw_src: src_addr,
            hw_checksum: 0,
        })
    }

    /// Serialise this packet into a wire frame (without the daemon's 4-byte
    /// length header, which is the transport's concern).
    ///
    /// An odd-length payload gets one filler byte appended; the length field
    /// still holds the unpadded size.
    pub fn encode(&self) -> Bytes {
        let pad = self.payload.len() % 2;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + pad + TRAILER_LEN);

        buf.put_u16_le((self.op as u16) << 8);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u16_le(self.dest_addr);
        buf.put_u16_le(self.dest_idx);
        buf.put_u16_le(self.src_addr);
        buf.put_u16_le(self.src_idx);
        buf.put_u16_le(self.pkt_num);
        buf.put_u16_le(self.ack);

        buf.put_slice(&self.payload);
        if pad == 1 {
            buf.put_u8(PAD_BYTE);
        }

        buf.put_u16_le(self.hw_dest);
        buf.put_u16_le(self.hw_src);
        buf.put_u16_le(0); // checksum, never computed

        buf.freeze()
    }

    /// Parse a [`Packet`] from a raw wire frame.
    ///
    /// Fails with [`ChaosError::MalformedPacket`] when the frame is shorter
    /// than header + trailer, when the opcode byte is not a known operation,
    /// or when `header + declared length + padding + trailer` does not equal
    /// the frame length.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(ChaosError::MalformedPacket(format!(
                "frame of {} bytes is below the {} byte minimum",
                frame.len(),
                MIN_FRAME_LEN
            )));
        }

        let word = |off: usize| u16::from_le_bytes([frame[off], frame[off + 1]]);

        let raw_op = (word(OFF_OP) >> 8) as u8;
        let op = Opcode::from_u8(raw_op).ok_or_else(|| {
            ChaosError::MalformedPacket(format!("unknown opcode {:#o}", raw_op))
        })?;

        let data_len = word(OFF_LEN) as usize;
        let pad = data_len % 2;
        if HEADER_LEN + data_len + pad + TRAILER_LEN != frame.len() {
            return Err(ChaosError::MalformedPacket(format!(
                "declared payload of {} bytes does not fit a {} byte frame",
                data_len,
                frame.len()
            )));
        }

        let trailer = HEADER_LEN + data_len + pad;
        Ok(Self {
            op,
            payload: Bytes::copy_from_slice(&frame[HEADER_LEN..HEADER_LEN + data_len]),
            dest_addr: word(OFF_DEST),
            dest_idx: word(OFF_DEST_IDX),
            src_addr: word(OFF_SRC),
            src_idx: word(OFF_SRC_IDX),
            pkt_num: word(OFF_PKT_NUM),
            ack: word(OFF_ACK),
            hw_dest: word(trailer),
            hw_src: word(trailer + 2),
            hw_checksum: word(trailer + 4),
        })
    }
}
