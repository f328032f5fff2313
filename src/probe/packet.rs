//! Wire probe packet: the fixed-size datagram relayed during TURN probing.
//!
//! Layout (big-endian, `size` bytes total):
//!
//! | offset          | len | field                               |
//! |-----------------|-----|-------------------------------------|
//! | 0               | 8   | session id                          |
//! | 8               | 4   | timestamp length `n`                |
//! | 12              | n   | send time, RFC 3339 with nanoseconds|
//! | 12 + n          | ... | random filler                       |
//! | size - 4        | 4   | CRC-32 (IEEE) of bytes `[0, size-4)`|

use bytes::{Buf, BufMut};
use chrono::{DateTime, SecondsFormat, Utc};
use crc::{Crc, CRC_32_ISO_HDLC};
use rand::RngCore;
use thiserror::Error;

use crate::config::MIN_PACKET_SIZE;
use crate::probe::ErrorCode;

/// Short datagram used to open relay permissions. Receivers discard it.
pub const SENTINEL: &[u8] = b"Hello";

const SESSION_OFFSET: usize = 0;
const TIME_LEN_OFFSET: usize = SESSION_OFFSET + 8;
const TIME_OFFSET: usize = TIME_LEN_OFFSET + 4;
const CHECKSUM_LEN: usize = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet size {size} below minimum {min}")]
    TooSmall { size: usize, min: usize },

    #[error("length mismatch: want {expected} got {actual}")]
    Size { expected: usize, actual: usize },

    #[error("session id mismatch: want {expected} got {actual}")]
    Session { expected: u64, actual: u64 },

    #[error("timestamp unreadable: {0}")]
    Timestamp(String),

    #[error("crc mismatch: want {expected:08x} got {actual:08x}")]
    Checksum { expected: u32, actual: u32 },
}

impl PacketError {
    /// Error code reported to the aggregator for a rejected packet.
    pub fn code(&self) -> ErrorCode {
        match self {
            PacketError::TooSmall { .. } | PacketError::Size { .. } => ErrorCode::PacketSize,
            PacketError::Session { .. } => ErrorCode::PacketSession,
            PacketError::Timestamp(_) => ErrorCode::PacketTimestamp,
            PacketError::Checksum { .. } => ErrorCode::PacketChecksum,
        }
    }
}

/// Fields recovered from a verified packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePacket {
    pub session_id: u64,
    pub sent_at: DateTime<Utc>,
}

/// Reusable send buffer for one session.
///
/// The filler is randomised once; each [`encode`](Self::encode) rewrites
/// the header, timestamp and checksum in place.
pub struct PacketEncoder {
    session_id: u64,
    buf: Vec<u8>,
}

impl PacketEncoder {
    pub fn new(session_id: u64, size: usize) -> Result<Self, PacketError> {
        if size < MIN_PACKET_SIZE {
            return Err(PacketError::TooSmall {
                size,
                min: MIN_PACKET_SIZE,
            });
        }
        let mut buf = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut buf);
        Ok(Self { session_id, buf })
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Stamp the buffer with `sent_at` and return the finished datagram.
    pub fn encode(&mut self, sent_at: DateTime<Utc>) -> &[u8] {
        let stamp = sent_at.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let body_end = self.buf.len() - CHECKSUM_LEN;

        {
            let mut header = &mut self.buf[..body_end];
            header.put_u64(self.session_id);
            header.put_u32(stamp.len() as u32);
            header.put_slice(stamp.as_bytes());
        }

        let sum = CRC32.checksum(&self.buf[..body_end]);
        (&mut self.buf[body_end..]).put_u32(sum);

        &self.buf
    }
}

/// Verify a received datagram against the expected size and session.
pub fn decode(
    datagram: &[u8],
    expected_size: usize,
    expected_session: u64,
) -> Result<ProbePacket, PacketError> {
    if datagram.len() != expected_size || expected_size < MIN_PACKET_SIZE {
        return Err(PacketError::Size {
            expected: expected_size,
            actual: datagram.len(),
        });
    }
    let body_end = expected_size - CHECKSUM_LEN;

    let mut header = &datagram[..TIME_OFFSET];
    let session_id = header.get_u64();
    if session_id != expected_session {
        return Err(PacketError::Session {
            expected: expected_session,
            actual: session_id,
        });
    }

    let time_len = header.get_u32() as usize;
    let time_end = TIME_OFFSET
        .checked_add(time_len)
        .filter(|end| *end <= body_end)
        .ok_or_else(|| PacketError::Timestamp(format!("length {} overruns packet", time_len)))?;
    let stamp = std::str::from_utf8(&datagram[TIME_OFFSET..time_end])
        .map_err(|e| PacketError::Timestamp(e.to_string()))?;
    let sent_at = DateTime::parse_from_rfc3339(stamp)
        .map_err(|e| PacketError::Timestamp(e.to_string()))?
        .with_timezone(&Utc);

    let expected = CRC32.checksum(&datagram[..body_end]);
    let actual = (&datagram[body_end..]).get_u32();
    if expected != actual {
        return Err(PacketError::Checksum { expected, actual });
    }

    Ok(ProbePacket {
        session_id,
        sent_at,
    })
}

/// True for the permission-opening sentinel, which carries no measurement.
pub fn is_sentinel(datagram: &[u8]) -> bool {
    datagram == SENTINEL
}
