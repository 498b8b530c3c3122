//! The wire protocol between `rsystemd` and its clients (`# 6`, "Wire
//! protocol").
//!
//! Ported field-for-field from `rsys_msg_t` (`original_source/rsys/rsys_p.h`):
//! a message type, a payload length, and a status word that's only
//! meaningful for [`FrameKind::Eoc`]. The C version writes the raw struct
//! (including whatever padding the compiler inserts) straight to the
//! socket, which only works between processes built with the same
//! compiler on the same architecture. This port fixes a fully-specified
//! little-endian, unpadded header instead — the explicit resolution of
//! `# 9`'s flagged host-endianness/struct-layout portability hazard.

use std::io::{Read, Write};

use thiserror::Error;

/// Fixed header size in bytes: 4 (kind) + 8 (length) + 4 (status).
pub const HEADER_LEN: usize = 16;

const KIND_CMD: u32 = 0;
const KIND_DISPLAY: u32 = 1;
const KIND_EOC: u32 = 2;
const KIND_BUSY: u32 = 3;
const KIND_OOM: u32 = 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame kind {0}")]
    UnknownKind(u32),

    #[error("frame payload of {0} bytes exceeds the {1}-byte limit")]
    PayloadTooLarge(u64, u64),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// A frame's discriminant, mirroring `RSYS_MSG_CMD`/`DISPLAY`/`EOC`/`BUSY`/
/// `OOM` (`original_source/rsys/rsys_p.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Client -> dispatcher: a command line to run.
    Cmd,
    /// Dispatcher -> client: a chunk of the shell's output.
    Display,
    /// Dispatcher -> client: end of command, carries the exit status.
    Eoc,
    /// Dispatcher -> client: no shell slot was free.
    Busy,
    /// Dispatcher -> client: the dispatcher is out of memory/resources.
    Oom,
}

impl FrameKind {
    fn to_u32(self) -> u32 {
        match self {
            FrameKind::Cmd => KIND_CMD,
            FrameKind::Display => KIND_DISPLAY,
            FrameKind::Eoc => KIND_EOC,
            FrameKind::Busy => KIND_BUSY,
            FrameKind::Oom => KIND_OOM,
        }
    }

    fn from_u32(v: u32) -> Result<Self> {
        match v {
            KIND_CMD => Ok(FrameKind::Cmd),
            KIND_DISPLAY => Ok(FrameKind::Display),
            KIND_EOC => Ok(FrameKind::Eoc),
            KIND_BUSY => Ok(FrameKind::Busy),
            KIND_OOM => Ok(FrameKind::Oom),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// One message on the wire. `status` is only populated for
/// [`FrameKind::Eoc`]; `payload` is only populated for [`FrameKind::Cmd`]
/// and [`FrameKind::Display`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub status: i32,
    pub payload: Vec<u8>,
}

/// Payloads larger than this are refused outright — `rsystemd` runs as a
/// shared daemon and must not let one client force an unbounded
/// allocation (`# 6`, "Resource ceilings").
pub const MAX_PAYLOAD_LEN: u64 = 1 << 20;

impl Frame {
    pub fn cmd(line: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: FrameKind::Cmd,
            status: 0,
            payload: line.into(),
        }
    }

    pub fn display(chunk: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: FrameKind::Display,
            status: 0,
            payload: chunk.into(),
        }
    }

    pub fn eoc(status: i32) -> Self {
        Self {
            kind: FrameKind::Eoc,
            status,
            payload: Vec::new(),
        }
    }

    pub fn busy() -> Self {
        Self {
            kind: FrameKind::Busy,
            status: 0,
            payload: Vec::new(),
        }
    }

    pub fn oom() -> Self {
        Self {
            kind: FrameKind::Oom,
            status: 0,
            payload: Vec::new(),
        }
    }

    /// Serializes the header and payload into one contiguous buffer, so
    /// both synchronous (`write_to`) and async (`rsystemd`'s tokio sockets)
    /// callers can hand it to their writer in a single call.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.kind.to_u32().to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.status.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes a fixed-size header, returning the kind, the payload length
    /// still to be read, and the status word. Split out from [`Self::read_from`]
    /// so an async caller can read the header and payload as two separate
    /// `await`s instead of through a blocking [`Read`].
    pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(FrameKind, u64, i32)> {
        let kind = FrameKind::from_u32(u32::from_le_bytes(header[0..4].try_into().unwrap()))?;
        let length = u64::from_le_bytes(header[4..12].try_into().unwrap());
        let status = i32::from_le_bytes(header[12..16].try_into().unwrap());
        if length > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge(length, MAX_PAYLOAD_LEN));
        }
        Ok((kind, length, status))
    }

    /// Reassembles a frame from an already-decoded header plus the payload
    /// bytes it announced.
    pub fn from_parts(kind: FrameKind, status: i32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            status,
            payload,
        }
    }

    /// Serializes the header and payload and writes them in one `write_all`
    /// call, avoiding the original's two-syscall header-then-body sequence
    /// (the short-write handling on each piece still has to exist; giving
    /// them to the kernel in one go just avoids the window between them).
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode())?;
        Ok(())
    }

    /// Reads one frame, rejecting an oversized length before allocating
    /// for it.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header)?;
        let (kind, length, status) = Self::decode_header(&header)?;
        let mut payload = vec![0u8; length as usize];
        r.read_exact(&mut payload)?;
        Ok(Self::from_parts(kind, status, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &Frame) -> Frame {
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        Frame::read_from(&mut &buf[..]).unwrap()
    }

    #[test]
    fn cmd_frame_round_trips() {
        let frame = Frame::cmd(b"ls -l".to_vec());
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn display_frame_round_trips() {
        let frame = Frame::display(b"total 0\n".to_vec());
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn eoc_frame_carries_status() {
        let frame = Frame::eoc(256);
        let back = round_trip(&frame);
        assert_eq!(back.status, 256);
        assert_eq!(back.kind, FrameKind::Eoc);
    }

    #[test]
    fn busy_and_oom_have_empty_payloads() {
        assert_eq!(round_trip(&Frame::busy()).kind, FrameKind::Busy);
        assert_eq!(round_trip(&Frame::oom()).kind, FrameKind::Oom);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&99u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        let err = Frame::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, WireError::UnknownKind(99)));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&KIND_DISPLAY.to_le_bytes());
        buf.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        buf.extend_from_slice(&0i32.to_le_bytes());
        let err = Frame::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, WireError::PayloadTooLarge(_, _)));
    }

    proptest::proptest! {
        #[test]
        fn any_display_payload_round_trips(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..4096)) {
            let frame = Frame::display(bytes);
            proptest::prop_assert_eq!(round_trip(&frame), frame);
        }
    }
}
