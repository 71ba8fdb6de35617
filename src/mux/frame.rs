//! Frame encoding and decoding.
//!
//! Every frame starts with a 12-byte header:
//!
//! ```text
//! | version u8 | type u8 | flags u16 BE | stream id u32 BE | length u32 BE |
//! ```
//!
//! Only data frames carry a body (`length` bytes). For window updates the
//! length field is the window delta, for pings it is the opaque value echoed
//! back, and for go-away it is the termination code.

use super::MuxError;
use bytes::Bytes;

/// Protocol version byte.
pub(crate) const PROTO_VERSION: u8 = 0;

/// Header size on the wire.
pub(crate) const HEADER_LEN: usize = 12;

pub(crate) const FLAG_SYN: u16 = 0x1;
pub(crate) const FLAG_ACK: u16 = 0x2;
pub(crate) const FLAG_FIN: u16 = 0x4;
pub(crate) const FLAG_RST: u16 = 0x8;

/// Go-away termination codes.
pub(crate) const GO_AWAY_NORMAL: u32 = 0;
pub(crate) const GO_AWAY_PROTO_ERROR: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameType {
    Data = 0x0,
    WindowUpdate = 0x1,
    Ping = 0x2,
    GoAway = 0x3,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, MuxError> {
        match value {
            0x0 => Ok(FrameType::Data),
            0x1 => Ok(FrameType::WindowUpdate),
            0x2 => Ok(FrameType::Ping),
            0x3 => Ok(FrameType::GoAway),
            other => Err(MuxError::Protocol(format!("unknown frame type {other:#04x}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub frame_type: FrameType,
    pub flags: u16,
    pub stream_id: u32,
    /// Data length, window delta, ping opaque or go-away code, by type.
    pub length: u32,
    /// Body; non-empty only for data frames.
    pub payload: Bytes,
}

impl Frame {
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Frame {
            frame_type: FrameType::Data,
            flags: 0,
            stream_id,
            length: payload.len() as u32,
            payload,
        }
    }

    /// Empty data frame carrying FIN: "no more bytes from this side".
    pub fn fin(stream_id: u32) -> Self {
        Frame {
            frame_type: FrameType::Data,
            flags: FLAG_FIN,
            stream_id,
            length: 0,
            payload: Bytes::new(),
        }
    }

    /// Window update announcing a new stream.
    pub fn open(stream_id: u32) -> Self {
        Frame {
            frame_type: FrameType::WindowUpdate,
            flags: FLAG_SYN,
            stream_id,
            length: 0,
            payload: Bytes::new(),
        }
    }

    /// Window update acknowledging an accepted stream.
    pub fn accept(stream_id: u32) -> Self {
        Frame {
            frame_type: FrameType::WindowUpdate,
            flags: FLAG_ACK,
            stream_id,
            length: 0,
            payload: Bytes::new(),
        }
    }

    pub fn window_update(stream_id: u32, delta: u32) -> Self {
        Frame {
            frame_type: FrameType::WindowUpdate,
            flags: 0,
            stream_id,
            length: delta,
            payload: Bytes::new(),
        }
    }

    pub fn reset(stream_id: u32) -> Self {
        Frame {
            frame_type: FrameType::WindowUpdate,
            flags: FLAG_RST,
            stream_id,
            length: 0,
            payload: Bytes::new(),
        }
    }

    pub fn ping(opaque: u32) -> Self {
        Frame {
            frame_type: FrameType::Ping,
            flags: FLAG_SYN,
            stream_id: 0,
            length: opaque,
            payload: Bytes::new(),
        }
    }

    pub fn pong(opaque: u32) -> Self {
        Frame {
            frame_type: FrameType::Ping,
            flags: FLAG_ACK,
            stream_id: 0,
            length: opaque,
            payload: Bytes::new(),
        }
    }

    pub fn go_away(code: u32) -> Self {
        Frame {
            frame_type: FrameType::GoAway,
            flags: 0,
            stream_id: 0,
            length: code,
            payload: Bytes::new(),
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn encode_header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = PROTO_VERSION;
        header[1] = self.frame_type as u8;
        header[2..4].copy_from_slice(&self.flags.to_be_bytes());
        header[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        header[8..12].copy_from_slice(&self.length.to_be_bytes());
        header
    }

    /// Parse a header. The payload of data frames is read separately.
    pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<Frame, MuxError> {
        if header[0] != PROTO_VERSION {
            return Err(MuxError::Protocol(format!(
                "unsupported version {}",
                header[0]
            )));
        }
        let frame_type = FrameType::try_from(header[1])?;
        let flags = u16::from_be_bytes([header[2], header[3]]);
        let stream_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        Ok(Frame {
            frame_type,
            flags,
            stream_id,
            length,
            payload: Bytes::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let frame = Frame::data(7, Bytes::from_static(b"payload"));
        let header = frame.encode_header();

        let decoded = Frame::decode_header(&header).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.length, 7);
        assert_eq!(decoded.flags, 0);
    }

    #[test]
    fn header_layout_matches_wire_format() {
        let frame = Frame {
            frame_type: FrameType::WindowUpdate,
            flags: FLAG_SYN | FLAG_FIN,
            stream_id: 0x01020304,
            length: 0x0a0b0c0d,
            payload: Bytes::new(),
        };
        let header = frame.encode_header();
        assert_eq!(
            header,
            [0, 1, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04, 0x0a, 0x0b, 0x0c, 0x0d]
        );
    }

    #[test]
    fn rejects_unknown_version_and_type() {
        let mut header = Frame::ping(1).encode_header();
        header[0] = 9;
        assert!(Frame::decode_header(&header).is_err());

        let mut header = Frame::ping(1).encode_header();
        header[1] = 0x7;
        assert!(Frame::decode_header(&header).is_err());
    }

    #[test]
    fn control_frames_carry_meaning_in_length() {
        assert_eq!(Frame::ping(42).length, 42);
        assert_eq!(Frame::window_update(3, 1024).length, 1024);
        assert_eq!(Frame::go_away(GO_AWAY_NORMAL).length, 0);
        assert!(Frame::fin(5).has_flag(FLAG_FIN));
        assert!(Frame::reset(5).has_flag(FLAG_RST));
        assert!(Frame::open(5).has_flag(FLAG_SYN));
    }
}
