//! Framing: one frame per datagram.
//!
//! Data frame (all integers LE):
//! `[version:u8][flags:u8][message_id:i64][seq:u32 iff RELIABLE]`
//! `[request_id:u64][arg_type:i64 iff RPC][payload_len:u32][payload]`
//!
//! An RPC frame is a data frame with the `RPC` flag; `message_id` then holds the method id.
//!
//! Control frame: `[version:u8][flags=CONTROL][bincode(Control)]`.

use bincode::Options;

use crate::protocol::{flags, Control, PROTOCOL_VERSION};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

const PREFIX_LEN: usize = 2;
const MESSAGE_ID_LEN: usize = 8;
const SEQ_LEN: usize = 4;
const LEN_SIZE: usize = 4;
/// `request_id` plus `arg_type`.
const RPC_HEADER_LEN: usize = 16;

/// Header size of an unreliable data frame.
pub const UNRELIABLE_HEADER_LEN: usize = PREFIX_LEN + MESSAGE_ID_LEN + LEN_SIZE;
/// Header size of a reliable data frame.
pub const RELIABLE_HEADER_LEN: usize = UNRELIABLE_HEADER_LEN + SEQ_LEN;
/// Header size of the largest frame kind, a reliable RPC call.
pub const MAX_HEADER_LEN: usize = RELIABLE_HEADER_LEN + RPC_HEADER_LEN;
/// Largest payload that fits one datagram under any header.
pub const MAX_PAYLOAD_LEN: usize = MAX_DATAGRAM_LEN - MAX_HEADER_LEN;

/// Extra header of an RPC frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcHeader {
    pub request_id: u64,
    pub arg_type: i64,
}

/// Application data: message id, sequence number (reliable only), RPC header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub message_id: i64,
    pub seq: Option<u32>,
    pub rpc: Option<RpcHeader>,
    pub payload: Vec<u8>,
}

impl DataFrame {
    pub fn is_reliable(&self) -> bool {
        self.seq.is_some()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        encode(self.message_id, self.seq, self.rpc, &self.payload)
    }
}

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Control(Control),
}

/// Encode a data frame. `seq` is `Some` for reliable frames.
pub fn encode_data(
    message_id: i64,
    seq: Option<u32>,
    payload: &[u8],
) -> Result<Vec<u8>, FrameEncodeError> {
    encode(message_id, seq, None, payload)
}

/// Encode an RPC frame for `method_id`.
pub fn encode_rpc(
    method_id: i64,
    seq: Option<u32>,
    header: RpcHeader,
    arg_data: &[u8],
) -> Result<Vec<u8>, FrameEncodeError> {
    encode(method_id, seq, Some(header), arg_data)
}

fn encode(
    message_id: i64,
    seq: Option<u32>,
    rpc: Option<RpcHeader>,
    payload: &[u8],
) -> Result<Vec<u8>, FrameEncodeError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let mut frame_flags = 0;
    if seq.is_some() {
        frame_flags |= flags::RELIABLE;
    }
    if rpc.is_some() {
        frame_flags |= flags::RPC;
    }
    let mut out = Vec::with_capacity(header_len(frame_flags) + payload.len());
    out.push(PROTOCOL_VERSION);
    out.push(frame_flags);
    out.extend_from_slice(&message_id.to_le_bytes());
    if let Some(seq) = seq {
        out.extend_from_slice(&seq.to_le_bytes());
    }
    if let Some(rpc) = rpc {
        out.extend_from_slice(&rpc.request_id.to_le_bytes());
        out.extend_from_slice(&rpc.arg_type.to_le_bytes());
    }
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

fn header_len(frame_flags: u8) -> usize {
    let mut len = UNRELIABLE_HEADER_LEN;
    if frame_flags & flags::RELIABLE != 0 {
        len += SEQ_LEN;
    }
    if frame_flags & flags::RPC != 0 {
        len += RPC_HEADER_LEN;
    }
    len
}

/// Fixed-width little-endian bincode that refuses trailing bytes.
fn control_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode a control frame.
pub fn encode_control(control: &Control) -> Result<Vec<u8>, FrameEncodeError> {
    let body = control_codec().serialize(control)?;
    let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
    out.push(PROTOCOL_VERSION);
    out.push(flags::CONTROL);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("payload of {0} bytes does not fit in one datagram")]
    TooLarge(usize),
}

/// Decode one datagram. Version, flags and lengths are checked before anything is copied out.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    if bytes.len() < PREFIX_LEN {
        return Err(FrameDecodeError::Truncated(bytes.len()));
    }
    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(FrameDecodeError::UnsupportedVersion(version));
    }
    let frame_flags = bytes[1];
    if frame_flags & !flags::KNOWN != 0 {
        return Err(FrameDecodeError::UnknownFlags(frame_flags));
    }

    if frame_flags & flags::CONTROL != 0 {
        if frame_flags != flags::CONTROL {
            return Err(FrameDecodeError::UnknownFlags(frame_flags));
        }
        let control: Control = control_codec().deserialize(&bytes[PREFIX_LEN..])?;
        return Ok(Frame::Control(control));
    }

    if bytes.len() < header_len(frame_flags) {
        return Err(FrameDecodeError::Truncated(bytes.len()));
    }

    let mut offset = PREFIX_LEN;
    let message_id = i64::from_le_bytes(read_array(bytes, offset));
    offset += MESSAGE_ID_LEN;
    let seq = if frame_flags & flags::RELIABLE != 0 {
        let seq = u32::from_le_bytes(read_array(bytes, offset));
        offset += SEQ_LEN;
        Some(seq)
    } else {
        None
    };
    let rpc = if frame_flags & flags::RPC != 0 {
        let request_id = u64::from_le_bytes(read_array(bytes, offset));
        let arg_type = i64::from_le_bytes(read_array(bytes, offset + 8));
        offset += RPC_HEADER_LEN;
        Some(RpcHeader {
            request_id,
            arg_type,
        })
    } else {
        None
    };
    let declared = u32::from_le_bytes(read_array(bytes, offset)) as usize;
    offset += LEN_SIZE;
    if declared > MAX_PAYLOAD_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let actual = bytes.len() - offset;
    if declared != actual {
        return Err(FrameDecodeError::LengthMismatch { declared, actual });
    }

    Ok(Frame::Data(DataFrame {
        message_id,
        seq,
        rpc,
        payload: bytes[offset..].to_vec(),
    }))
}

fn read_array<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

/// Error decoding a datagram. Every variant means the datagram is dropped.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("datagram truncated ({0} bytes)")]
    Truncated(usize),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown flag bits {0:#010b}")]
    UnknownFlags(u8),
    #[error("declared payload length {declared} but {actual} bytes follow")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame too large")]
    TooLarge,
    #[error("control decode error: {0}")]
    Control(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_reliable() {
        let bytes = encode_data(888, Some(7), b"hello").unwrap();
        assert_eq!(bytes.len(), RELIABLE_HEADER_LEN + 5);
        match decode_frame(&bytes).unwrap() {
            Frame::Data(frame) => {
                assert_eq!(frame.message_id, 888);
                assert_eq!(frame.seq, Some(7));
                assert_eq!(frame.payload, b"hello");
                assert!(frame.is_reliable());
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_unreliable_negative_id() {
        let bytes = encode_data(-42, None, &[0, 1, 2, 255]).unwrap();
        assert_eq!(bytes.len(), UNRELIABLE_HEADER_LEN + 4);
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(
            frame,
            Frame::Data(DataFrame {
                message_id: -42,
                seq: None,
                rpc: None,
                payload: vec![0, 1, 2, 255],
            })
        );
    }

    #[test]
    fn header_layout_is_stable() {
        let bytes = encode_data(0x0102_0304_0506_0708, Some(0x0a0b_0c0d), b"xy").unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], flags::RELIABLE);
        assert_eq!(&bytes[2..10], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[10..14], &[0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(&bytes[14..18], &[2, 0, 0, 0]);
        assert_eq!(&bytes[18..], b"xy");
    }

    #[test]
    fn empty_payload() {
        let bytes = encode_data(1, None, &[]).unwrap();
        match decode_frame(&bytes).unwrap() {
            Frame::Data(frame) => assert!(frame.payload.is_empty()),
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn control_roundtrip() {
        let all = [
            Control::Connect { nonce: u64::MAX },
            Control::Accept { nonce: 3 },
            Control::Reject { nonce: 4 },
            Control::Ack { seq: 99 },
            Control::Disconnect,
            Control::DisconnectAck,
            Control::Heartbeat,
        ];
        for control in all {
            let bytes = encode_control(&control).unwrap();
            assert_eq!(bytes[1], flags::CONTROL);
            assert_eq!(decode_frame(&bytes).unwrap(), Frame::Control(control));
        }
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = encode_data(1, None, b"a").unwrap();
        bytes[0] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::UnsupportedVersion(v)) if v == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let bytes = encode_data(1, Some(1), b"abc").unwrap();
        assert!(matches!(
            decode_frame(&bytes[..1]),
            Err(FrameDecodeError::Truncated(1))
        ));
        assert!(matches!(
            decode_frame(&bytes[..RELIABLE_HEADER_LEN - 1]),
            Err(FrameDecodeError::Truncated(_))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut bytes = encode_data(1, None, b"abc").unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::LengthMismatch {
                declared: 3,
                actual: 4
            })
        ));
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::LengthMismatch {
                declared: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn rejects_unknown_flags() {
        let mut bytes = encode_data(1, None, b"a").unwrap();
        bytes[1] = 0b1000_0000;
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::UnknownFlags(_))
        ));

        let mut control = encode_control(&Control::Heartbeat).unwrap();
        control[1] |= flags::RELIABLE;
        assert!(matches!(
            decode_frame(&control),
            Err(FrameDecodeError::UnknownFlags(_))
        ));
    }

    #[test]
    fn rejects_garbage_control_body() {
        let bytes = [PROTOCOL_VERSION, flags::CONTROL, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::Control(_))
        ));
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            encode_data(1, Some(0), &payload),
            Err(FrameEncodeError::TooLarge(n)) if n == MAX_PAYLOAD_LEN + 1
        ));
        let mut bytes = encode_data(1, None, b"").unwrap();
        let huge = (MAX_PAYLOAD_LEN as u32 + 1).to_le_bytes();
        bytes[10..14].copy_from_slice(&huge);
        assert!(matches!(decode_frame(&bytes), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn rpc_roundtrip_reliable_and_unreliable() {
        let header = RpcHeader {
            request_id: u64::MAX - 1,
            arg_type: -3,
        };
        for seq in [None, Some(41)] {
            let bytes = encode_rpc(12, seq, header, b"args").unwrap();
            assert_ne!(bytes[1] & flags::RPC, 0);
            assert_eq!(bytes.len(), header_len(bytes[1]) + 4);
            assert_eq!(
                decode_frame(&bytes).unwrap(),
                Frame::Data(DataFrame {
                    message_id: 12,
                    seq,
                    rpc: Some(header),
                    payload: b"args".to_vec(),
                })
            );
        }
    }

    #[test]
    fn rpc_header_layout_is_stable() {
        let header = RpcHeader {
            request_id: 0x1122_3344_5566_7788,
            arg_type: 2,
        };
        let bytes = encode_rpc(1, Some(5), header, b"").unwrap();
        assert_eq!(bytes[1], flags::RELIABLE | flags::RPC);
        assert_eq!(&bytes[10..14], &[5, 0, 0, 0]);
        assert_eq!(&bytes[14..22], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&bytes[22..30], &[2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[30..], &[0, 0, 0, 0]);
        assert_eq!(bytes.len(), MAX_HEADER_LEN);
    }

    #[test]
    fn truncated_rpc_header_is_rejected() {
        let header = RpcHeader {
            request_id: 1,
            arg_type: 1,
        };
        let bytes = encode_rpc(1, None, header, b"").unwrap();
        assert!(matches!(
            decode_frame(&bytes[..UNRELIABLE_HEADER_LEN]),
            Err(FrameDecodeError::Truncated(_))
        ));
    }

    #[test]
    fn control_with_rpc_flag_is_rejected() {
        let mut control = encode_control(&Control::Heartbeat).unwrap();
        control[1] |= flags::RPC;
        assert!(matches!(
            decode_frame(&control),
            Err(FrameDecodeError::UnknownFlags(_))
        ));
    }

    #[test]
    fn trailing_bytes_after_control_body_are_rejected() {
        let mut bytes = encode_control(&Control::Ack { seq: 5 }).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::Control(_))
        ));
    }

    #[test]
    fn frame_encode_matches_free_functions() {
        let frame = DataFrame {
            message_id: 9,
            seq: Some(3),
            rpc: None,
            payload: b"z".to_vec(),
        };
        assert_eq!(frame.encode().unwrap(), encode_data(9, Some(3), b"z").unwrap());
    }
}
