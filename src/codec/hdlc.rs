//! HDLC framing: `0x7E` flags with `0x7D` escaping.
//!
//! Two dialects share the escape rules:
//!
//! - the Qualcomm Diag dialect, where a frame is
//!   `FLAG | escape(payload | crc16_le) | FLAG` with CRC-16/CCITT
//! - the Spreadtrum dialect, which wraps a big-endian
//!   `type | length | payload | checksum` envelope and only escapes while
//!   the session's transcode flag is on
//!
//! ## Frame format (Spreadtrum)
//!
//! ```text
//! +------+---------+-----------+--------------+----------+------+
//! | FLAG | type BE | length BE |   payload    | sum BE   | FLAG |
//! +------+---------+-----------+--------------+----------+------+
//! | 7E   | 2 bytes | 2 bytes   | len bytes    | 2 bytes  | 7E   |
//! +------+---------+-----------+--------------+----------+------+
//! ```

use log::warn;

use crate::codec::crc::{crc16_ccitt, sprd_checksum};
use crate::error::{Error, Result};

/// Frame delimiter.
pub const FLAG: u8 = 0x7E;

/// Escape introducer.
pub const ESCAPE: u8 = 0x7D;

/// XOR applied to an escaped byte.
pub const ESCAPE_XOR: u8 = 0x20;

/// Escape every `FLAG`/`ESCAPE` byte in `data`.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &b in data {
        if b == FLAG || b == ESCAPE {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    out
}

/// Undo [`escape`]. A trailing lone `ESCAPE` byte is dropped.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut escaped = false;
    for &b in data {
        if escaped {
            out.push(b ^ ESCAPE_XOR);
            escaped = false;
        } else if b == ESCAPE {
            escaped = true;
        } else {
            out.push(b);
        }
    }
    out
}

/// Build a complete HDLC frame around `data`.
///
/// With `use_crc` a little-endian CRC-16/CCITT of `data` is appended
/// before escaping, which is what Qualcomm Diag expects.
pub fn encode(data: &[u8], use_crc: bool) -> Vec<u8> {
    let mut payload = data.to_vec();
    if use_crc {
        payload.extend_from_slice(&crc16_ccitt(data).to_le_bytes());
    }

    let mut out = Vec::with_capacity(payload.len() * 2 + 2);
    out.push(FLAG);
    out.extend_from_slice(&escape(&payload));
    out.push(FLAG);
    out
}

/// Strip flags, unescape and optionally verify the trailing CRC.
pub fn decode(frame: &[u8], validate_crc: bool) -> Result<Vec<u8>> {
    let mut start = 0;
    let mut end = frame.len();
    while start < end && frame[start] == FLAG {
        start += 1;
    }
    while end > start && frame[end - 1] == FLAG {
        end -= 1;
    }

    let unescaped = unescape(&frame[start..end]);

    if !validate_crc {
        return Ok(unescaped);
    }

    if unescaped.len() < 2 {
        return Err(Error::MalformedPacket(format!(
            "HDLC frame too short for CRC: {} bytes",
            unescaped.len()
        )));
    }

    let (payload, crc_bytes) = unescaped.split_at(unescaped.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16_ccitt(payload);
    if received != computed {
        return Err(Error::ChecksumMismatch {
            expected: computed,
            actual: received,
        });
    }

    Ok(payload.to_vec())
}

/// Extract every complete frame from a byte stream.
///
/// A frame is a maximal run between consecutive `FLAG` bytes with
/// non-empty content; back-to-back flags delimit adjacent frames rather
/// than producing empty ones. Returned slices include both flags.
pub fn extract_frames(data: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &b) in data.iter().enumerate() {
        if b == FLAG {
            if let Some(s) = start {
                if i - s > 1 {
                    frames.push(&data[s..=i]);
                }
            }
            start = Some(i);
        }
    }
    frames
}

/// Decoded Spreadtrum envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SprdFrame {
    /// Big-endian packet type.
    pub frame_type: u16,
    /// Payload bytes (length-field worth).
    pub payload: Vec<u8>,
}

/// Build a Spreadtrum frame: `type | length | payload | sum` inside flags.
///
/// While `transcode` is on the envelope is HDLC-escaped; once the session
/// switches to raw bulk transfer it is flag-wrapped verbatim.
pub fn sprd_encode(frame_type: u16, payload: &[u8], transcode: bool) -> Vec<u8> {
    debug_assert!(payload.len() <= usize::from(u16::MAX));

    let mut inner = Vec::with_capacity(6 + payload.len());
    inner.extend_from_slice(&frame_type.to_be_bytes());
    inner.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    inner.extend_from_slice(payload);
    let sum = sprd_checksum(&inner);
    inner.extend_from_slice(&sum.to_be_bytes());

    let mut out = Vec::with_capacity(inner.len() + 2);
    out.push(FLAG);
    if transcode {
        out.extend_from_slice(&escape(&inner));
    } else {
        out.extend_from_slice(&inner);
    }
    out.push(FLAG);
    out
}

/// Parse a Spreadtrum frame back into type and payload.
///
/// A checksum mismatch is logged but tolerated: some loaders omit the sum
/// in non-transcode mode.
pub fn sprd_decode(data: &[u8], transcode: bool) -> Result<SprdFrame> {
    let mut start = 0;
    let mut end = data.len();
    while start < end && data[start] == FLAG {
        start += 1;
    }
    while end > start && data[end - 1] == FLAG {
        end -= 1;
    }

    let content = if transcode {
        unescape(&data[start..end])
    } else {
        data[start..end].to_vec()
    };

    if content.len() < 6 {
        return Err(Error::MalformedPacket(format!(
            "Spreadtrum frame too short: {} bytes",
            content.len()
        )));
    }

    let frame_type = u16::from_be_bytes([content[0], content[1]]);
    let length = usize::from(u16::from_be_bytes([content[2], content[3]]));

    if 4 + length + 2 > content.len() {
        return Err(Error::MalformedPacket(format!(
            "Spreadtrum frame length {length} exceeds {} content bytes",
            content.len()
        )));
    }

    let stored = u16::from_be_bytes([content[4 + length], content[4 + length + 1]]);
    let computed = sprd_checksum(&content[..4 + length]);
    if stored != computed {
        warn!("Spreadtrum frame checksum mismatch: stored {stored:#06x}, computed {computed:#06x}");
    }

    Ok(SprdFrame {
        frame_type,
        payload: content[4..4 + length].to_vec(),
    })
}
