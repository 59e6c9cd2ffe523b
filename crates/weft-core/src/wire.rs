//! Byte-level message framing.
//!
//! Every message starts with an 8-byte header: the target object id, then a
//! word holding the total frame size in the upper 16 bits and the opcode in
//! the lower 16. The body is laid out per signature: one little-endian word
//! for `i`/`u`/`f`/`o`/`n`, length-prefixed NUL-terminated text and
//! length-prefixed byte ranges padded to word boundaries, and nothing at all
//! for `h` (the descriptor rides the ancillary channel).

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::arg::RawArg;
use crate::error::{DecodeError, EncodeError};
use crate::interface::{ArgKind, MessageDesc};
use crate::object::ObjectId;

/// Message header size: object id word plus size/opcode word.
pub(crate) const HEADER_SIZE: usize = 8;

/// A framed message in positional-slot form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawMessage {
    pub object_id: ObjectId,
    pub opcode: u16,
    pub args: Vec<RawArg>,
}

fn pad(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Serialize one message; fds for `h` slots are queued on `out_fds` instead
/// of occupying body bytes.
pub(crate) fn encode_message(
    object_id: ObjectId,
    opcode: u16,
    desc: &MessageDesc,
    args: &[RawArg],
    out: &mut BytesMut,
    out_fds: &mut Vec<RawFd>,
) -> Result<(), EncodeError> {
    let mut body = Vec::new();
    let mut fds = Vec::new();

    let mut slots = args.iter();
    for spec in desc.args() {
        let spec = spec.map_err(|e| match e {
            DecodeError::BadSignature(c) => EncodeError::BadSignature(c),
            _ => EncodeError::BadSignature('?'),
        })?;
        let Some(slot) = slots.next() else {
            return Err(EncodeError::Arity { expected: desc.args().count(), found: args.len() });
        };
        match (spec.kind, slot) {
            (ArgKind::Fd, RawArg::Word(w)) => fds.push(*w as i32),
            (ArgKind::Fd, RawArg::Fd(fd)) => fds.push(fd.as_raw_fd()),
            (
                ArgKind::Int | ArgKind::Uint | ArgKind::Fixed | ArgKind::Object | ArgKind::NewId,
                RawArg::Word(w),
            ) => body.extend_from_slice(&w.to_le_bytes()),
            (ArgKind::Str, RawArg::Str(None)) => body.extend_from_slice(&0u32.to_le_bytes()),
            (ArgKind::Str, RawArg::Str(Some(text))) => {
                let len = text.len() + 1; // includes the terminator
                body.extend_from_slice(&(len as u32).to_le_bytes());
                body.extend_from_slice(text);
                body.push(0);
                body.extend(std::iter::repeat_n(0u8, pad(len)));
            }
            (ArgKind::Array, RawArg::Array(bytes)) => {
                body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                body.extend_from_slice(bytes);
                body.extend(std::iter::repeat_n(0u8, pad(bytes.len())));
            }
            (kind, slot) => {
                return Err(EncodeError::Type(crate::error::TypeMismatch {
                    expected: kind,
                    found: match slot {
                        RawArg::Word(_) => ArgKind::Uint,
                        RawArg::Str(_) => ArgKind::Str,
                        RawArg::Array(_) => ArgKind::Array,
                        RawArg::Fd(_) => ArgKind::Fd,
                    },
                }));
            }
        }
    }
    if slots.next().is_some() {
        return Err(EncodeError::Arity { expected: desc.args().count(), found: args.len() });
    }

    let size = HEADER_SIZE + body.len();
    if size > u16::MAX as usize {
        return Err(EncodeError::Oversize(size));
    }

    out.put_u32_le(object_id.0);
    out.put_u32_le(((size as u32) << 16) | u32::from(opcode));
    out.put_slice(&body);
    out_fds.append(&mut fds);
    Ok(())
}

/// Frame header plus its body bytes, split off an input buffer.
#[derive(Debug)]
pub(crate) struct Frame {
    pub object_id: ObjectId,
    pub opcode: u16,
    pub body: Bytes,
}

/// Split the next complete frame off `buf`.
///
/// `Ok(None)` means more bytes are needed. A header that cannot be valid
/// desynchronizes the stream and is fatal to the connection.
pub(crate) fn split_frame(buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let object_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let size_opcode = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let size = (size_opcode >> 16) as usize;
    let opcode = (size_opcode & 0xffff) as u16;
    if size < HEADER_SIZE {
        return Err(DecodeError::BadFrame("frame size below header size"));
    }
    if buf.len() < size {
        return Ok(None);
    }
    let mut frame = buf.split_to(size);
    frame.advance(HEADER_SIZE);
    Ok(Some(Frame { object_id: ObjectId(object_id), opcode, body: frame.freeze() }))
}

/// Parse a frame body into positional slots against a signature, consuming
/// ancillary fds for `h` arguments. Claimed descriptors stay owned by their
/// slot, so a message dropped before any handler runs closes them.
pub(crate) fn parse_body(
    desc: &MessageDesc,
    body: &[u8],
    fds: &mut VecDeque<OwnedFd>,
) -> Result<Vec<RawArg>, DecodeError> {
    let mut off = 0usize;
    let mut read_word = |off: &mut usize, kind: ArgKind, index: usize| -> Result<u32, DecodeError> {
        if *off + 4 > body.len() {
            return Err(DecodeError::Truncated { expected: kind, index });
        }
        let w = u32::from_le_bytes([body[*off], body[*off + 1], body[*off + 2], body[*off + 3]]);
        *off += 4;
        Ok(w)
    };

    let mut out = Vec::new();
    for (index, spec) in desc.args().enumerate() {
        let spec = spec?;
        match spec.kind {
            ArgKind::Int | ArgKind::Uint | ArgKind::Fixed | ArgKind::Object | ArgKind::NewId => {
                let w = read_word(&mut off, spec.kind, index)?;
                out.push(RawArg::Word(w));
            }
            ArgKind::Fd => {
                let fd = fds.pop_front().ok_or(DecodeError::MissingFd { index })?;
                out.push(RawArg::Fd(Arc::new(fd)));
            }
            ArgKind::Str => {
                let len = read_word(&mut off, spec.kind, index)? as usize;
                if len == 0 {
                    out.push(RawArg::Str(None));
                    continue;
                }
                let padded = len + pad(len);
                if off + padded > body.len() {
                    return Err(DecodeError::Truncated { expected: spec.kind, index });
                }
                let bytes = &body[off..off + len];
                if bytes[len - 1] != 0 {
                    return Err(DecodeError::BadFrame("text not NUL-terminated"));
                }
                out.push(RawArg::Str(Some(bytes[..len - 1].to_vec())));
                off += padded;
            }
            ArgKind::Array => {
                let len = read_word(&mut off, spec.kind, index)? as usize;
                let padded = len + pad(len);
                if off + padded > body.len() {
                    return Err(DecodeError::Truncated { expected: spec.kind, index });
                }
                out.push(RawArg::Array(body[off..off + len].to_vec()));
                off += padded;
            }
        }
    }
    if off != body.len() {
        return Err(DecodeError::BadFrame("trailing body bytes"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    static MSG: MessageDesc = MessageDesc {
        name: "sample",
        signature: "iusa",
        arg_interfaces: &[None, None, None, None],
    };

    fn roundtrip(args: Vec<RawArg>) -> Vec<RawArg> {
        let mut out = BytesMut::new();
        let mut fds = Vec::new();
        encode_message(ObjectId(3), 1, &MSG, &args, &mut out, &mut fds).unwrap();
        assert!(fds.is_empty());

        let frame = split_frame(&mut out).unwrap().unwrap();
        assert!(out.is_empty());
        assert_eq!(frame.object_id, ObjectId(3));
        assert_eq!(frame.opcode, 1);
        parse_body(&MSG, &frame.body, &mut VecDeque::new()).unwrap()
    }

    #[test]
    fn frame_roundtrip() {
        let args = vec![
            RawArg::Word(0xFFFF_FFFE),
            RawArg::Word(7),
            RawArg::Str(Some(b"hello".to_vec())),
            RawArg::Array(vec![1, 2, 3]),
        ];
        assert_eq!(roundtrip(args.clone()), args);
    }

    #[test]
    fn null_string_slot_survives() {
        static NULLABLE: MessageDesc =
            MessageDesc { name: "m", signature: "?s", arg_interfaces: &[None] };
        let mut out = BytesMut::new();
        encode_message(ObjectId(1), 0, &NULLABLE, &[RawArg::Str(None)], &mut out, &mut Vec::new())
            .unwrap();
        let frame = split_frame(&mut out).unwrap().unwrap();
        let args = parse_body(&NULLABLE, &frame.body, &mut VecDeque::new()).unwrap();
        assert_eq!(args, vec![RawArg::Str(None)]);
    }

    #[test]
    fn body_is_word_padded() {
        let mut out = BytesMut::new();
        static S: MessageDesc =
            MessageDesc { name: "m", signature: "s", arg_interfaces: &[None] };
        encode_message(
            ObjectId(1),
            0,
            &S,
            &[RawArg::Str(Some(b"ab".to_vec()))],
            &mut out,
            &mut Vec::new(),
        )
        .unwrap();
        // header + length word + "ab\0" padded to 4
        assert_eq!(out.len(), 8 + 4 + 4);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut out = BytesMut::new();
        encode_message(ObjectId(2), 0, &MSG, &[
            RawArg::Word(1),
            RawArg::Word(2),
            RawArg::Str(Some(b"x".to_vec())),
            RawArg::Array(vec![]),
        ], &mut out, &mut Vec::new())
        .unwrap();
        let mut partial = BytesMut::from(&out[..out.len() - 1]);
        assert!(split_frame(&mut partial).unwrap().is_none());
    }

    #[test]
    fn undersized_frame_header_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u32_le(4 << 16); // size 4 < header size
        assert!(split_frame(&mut buf).is_err());
    }

    #[test]
    fn unclaimed_fd_closes_with_its_slot() {
        static H: MessageDesc =
            MessageDesc { name: "m", signature: "h", arg_interfaces: &[None] };
        let file = std::fs::File::open("/dev/null").unwrap();
        let owned: OwnedFd = file.into();
        let raw = owned.as_raw_fd();
        let mut fds = VecDeque::from([owned]);

        let args = parse_body(&H, &[], &mut fds).unwrap();
        assert!(matches!(args[0], RawArg::Fd(_)));
        assert_ne!(unsafe { libc::fcntl(raw, libc::F_GETFD) }, -1);

        drop(args);
        assert_eq!(unsafe { libc::fcntl(raw, libc::F_GETFD) }, -1);
    }

    #[test]
    fn truncated_body_is_a_decode_error() {
        static S: MessageDesc =
            MessageDesc { name: "m", signature: "a", arg_interfaces: &[None] };
        // length word claims 32 bytes, none follow
        let body = 32u32.to_le_bytes();
        let err = parse_body(&S, &body, &mut VecDeque::new()).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }
}
