//! Decoder/encoder for the Pegasus UDP control protocol (spec §4.1, §6).
//!
//! Pure and allocation-light: no I/O happens here, callers own the socket.
//! All integers on the wire are little-endian.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// `0xDEAC`, the first two bytes of every message.
pub const MAGIC: u16 = 0xDEAC;

/// Datagrams larger than this are rejected outright, per spec §6.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

const TYPE_RESET_REQ: u8 = 0x00;
const TYPE_RESET_REPLY: u8 = 0x01;
const TYPE_HK_REPORT: u8 = 0x02;
const TYPE_KEY_MGR: u8 = 0x03;

/// A single `(keyhash, load)` pair within a heavy-hitter report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub keyhash: u32,
    pub load: u16,
}

/// A decoded inbound control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `0x00 RESET_REQ`
    ResetRequest { num_nodes: u16 },
    /// `0x01 RESET_REPLY`
    ResetReply { ack: u8 },
    /// `0x02 HK_REPORT`. `reports` is preserved in wire order (ascending by
    /// load, per the protocol contract) — the codec does not re-sort.
    HkReport { reports: Vec<Report> },
}

/// Errors produced while decoding a datagram. Every variant maps to the
/// `Malformed` error kind in spec §7: the caller drops the datagram and
/// increments a counter, it is never propagated further.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("datagram of {0} bytes exceeds the {MAX_DATAGRAM_SIZE} byte limit")]
    TooLarge(usize),

    #[error("bad magic: expected {MAGIC:#06x}, got {0:#06x}")]
    BadMagic(u16),

    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),

    #[error("truncated message")]
    Truncated,
}

impl From<io::Error> for CodecError {
    fn from(_: io::Error) -> Self {
        // The only io::Error a Cursor read over a byte slice can produce is
        // UnexpectedEof, which in this protocol always means the buffer
        // ended before a fixed-size field did.
        CodecError::Truncated
    }
}

/// Decode one datagram into a [`Message`].
///
/// Malformed input -- bad magic, unknown type, or a buffer that ends before
/// the declared fields do -- yields [`CodecError`] rather than a partial
/// message.
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    if buf.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge(buf.len()));
    }

    let mut cur = Cursor::new(buf);
    let magic = cur.read_u16::<LittleEndian>()?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let msg_type = cur.read_u8()?;
    match msg_type {
        TYPE_RESET_REQ => {
            let num_nodes = cur.read_u16::<LittleEndian>()?;
            Ok(Message::ResetRequest { num_nodes })
        }
        TYPE_RESET_REPLY => {
            let ack = cur.read_u8()?;
            Ok(Message::ResetReply { ack })
        }
        TYPE_HK_REPORT => {
            let nkeys = cur.read_u16::<LittleEndian>()?;
            let mut reports = Vec::with_capacity(nkeys as usize);
            for _ in 0..nkeys {
                let keyhash = cur.read_u32::<LittleEndian>()?;
                let load = cur.read_u16::<LittleEndian>()?;
                reports.push(Report { keyhash, load });
            }
            Ok(Message::HkReport { reports })
        }
        other => Err(CodecError::UnknownType(other)),
    }
}

/// Encode an outbound `0x03 KEY_MGR` message: the only message type this
/// controller ever sends rather than receives.
pub fn encode_key_migration(keyhash: u32, key_bytes: &[u8]) -> Vec<u8> {
    let key_len: u16 = key_bytes
        .len()
        .try_into()
        .expect("key_bytes longer than u16::MAX");
    let mut out = Vec::with_capacity(2 + 1 + 4 + 2 + key_bytes.len());
    out.write_u16::<LittleEndian>(MAGIC).unwrap();
    out.write_u8(TYPE_KEY_MGR).unwrap();
    out.write_u32::<LittleEndian>(keyhash).unwrap();
    out.write_u16::<LittleEndian>(key_len).unwrap();
    out.write_all(key_bytes).unwrap();
    out
}
