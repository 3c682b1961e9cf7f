//! Frame codec for the client↔daemon socket.
//!
//! # Frame format
//!
//! Every message is a 5-byte header plus an optional payload:
//!
//! - 1 byte: type tag
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! Payload shapes per tag:
//!
//! - `DATA` (0x01): opaque PTY bytes in either direction
//! - `WINCH` (0x02): 4 bytes, two big-endian u16 (cols, rows)
//! - `DETACH` (0x03): empty
//! - `EXIT` (0x04): 1 byte, the child exit code (empty means 0)
//! - `HELLO` (0x05): same 4-byte shape as `WINCH`
//!
//! Unknown tags and malformed payloads are preserved by [`read_frame`]
//! and skipped by [`RawFrame::decode`], so old daemons tolerate newer
//! clients. A payload length above 1 MiB is a protocol error and fails
//! the connection.

use std::io::{Read, Write};

use crate::error::{ProtocolError, Result};

/// Frame header size: 1 (tag) + 4 (length) bytes.
pub const HEADER_LEN: usize = 5;

/// Maximum accepted payload size.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Wire type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0x01,
    Winch = 0x02,
    Detach = 0x03,
    Exit = 0x04,
    Hello = 0x05,
}

impl FrameKind {
    /// Map a wire tag back to a kind. Unknown tags yield `None`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(FrameKind::Data),
            0x02 => Some(FrameKind::Winch),
            0x03 => Some(FrameKind::Detach),
            0x04 => Some(FrameKind::Exit),
            0x05 => Some(FrameKind::Hello),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A frame as read off the wire: raw tag plus payload bytes.
///
/// Kept untyped so that unknown tags survive the read path; decoding into
/// a [`Frame`] is a separate, infallible-by-skipping step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl RawFrame {
    /// Decode into a typed message.
    ///
    /// Returns `None` for unknown tags and for known tags whose payload
    /// does not match the expected shape; callers ignore those frames.
    pub fn decode(self) -> Option<Frame> {
        match FrameKind::from_tag(self.tag)? {
            FrameKind::Data => Some(Frame::Data(self.payload)),
            FrameKind::Winch => {
                decode_winsize(&self.payload).map(|(cols, rows)| Frame::Winch { cols, rows })
            }
            FrameKind::Detach => Some(Frame::Detach),
            FrameKind::Exit => Some(Frame::Exit(self.payload.first().copied().unwrap_or(0))),
            FrameKind::Hello => {
                decode_winsize(&self.payload).map(|(cols, rows)| Frame::Hello { cols, rows })
            }
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opaque PTY bytes, in either direction.
    Data(Vec<u8>),
    /// Window-size change to apply to the PTY.
    Winch { cols: u16, rows: u16 },
    /// Client disconnects without disturbing the session.
    Detach,
    /// Final daemon frame: the child's exit code.
    Exit(u8),
    /// Mandatory first client frame, carrying the initial window size.
    Hello { cols: u16, rows: u16 },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data(_) => FrameKind::Data,
            Frame::Winch { .. } => FrameKind::Winch,
            Frame::Detach => FrameKind::Detach,
            Frame::Exit(_) => FrameKind::Exit,
            Frame::Hello { .. } => FrameKind::Hello,
        }
    }

    /// Encode header and payload into a single wire buffer.
    pub fn encode(&self) -> Vec<u8> {
        let payload: Vec<u8> = match self {
            Frame::Data(bytes) => bytes.clone(),
            Frame::Winch { cols, rows } | Frame::Hello { cols, rows } => {
                encode_winsize(*cols, *rows).to_vec()
            }
            Frame::Detach => Vec::new(),
            Frame::Exit(code) => vec![*code],
        };

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(self.kind().tag());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }
}

/// Pack a window size as two big-endian u16 values.
pub fn encode_winsize(cols: u16, rows: u16) -> [u8; 4] {
    let c = cols.to_be_bytes();
    let r = rows.to_be_bytes();
    [c[0], c[1], r[0], r[1]]
}

/// Unpack a 4-byte window-size payload. Any other length is malformed.
pub fn decode_winsize(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() != 4 {
        return None;
    }
    let cols = u16::from_be_bytes([payload[0], payload[1]]);
    let rows = u16::from_be_bytes([payload[2], payload[3]]);
    Some((cols, rows))
}

/// Write one frame, blocking until it is fully written.
///
/// The header and payload are assembled into one buffer so a frame is
/// never interleaved with another writer's bytes at the `write_all`
/// granularity. `write_all` already retries `EINTR`.
pub fn write_frame<W: Write>(w: &mut W, frame: &Frame) -> Result<()> {
    if let Frame::Data(bytes) = frame {
        if bytes.len() > MAX_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge { len: bytes.len() });
        }
    }
    w.write_all(&frame.encode())?;
    Ok(())
}

/// Read one frame, blocking until header and payload are complete.
///
/// Returns the raw frame; end-of-stream and receive timeouts surface as
/// [`ProtocolError::Io`]. `read_exact` already retries `EINTR`.
pub fn read_frame<R: Read>(r: &mut R) -> Result<RawFrame> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header)?;

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge { len });
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        r.read_exact(&mut payload)?;
    }

    Ok(RawFrame {
        tag: header[0],
        payload,
    })
}
