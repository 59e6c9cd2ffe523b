//! Wire values and the signature-driven argument codec.
//!
//! A [`WireValue`] is a closed tagged variant over the wire primitive kinds;
//! the tag recorded at construction must match the tag requested at read
//! time, and a mismatch is a programming error surfaced as [`TypeMismatch`].
//!
//! The codec converts between a `WireValue` sequence and the raw positional
//! representation ([`RawArg`] slots), one slot per signature character that
//! denotes a value. Decoding materializes object references: plain `o`
//! arguments become non-owning handles, `n` arguments allocate a record and
//! return an owning handle with reference count exactly 1.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::connection::ConnectionInner;
use crate::error::{DecodeError, EncodeError, TypeMismatch};
use crate::interface::{ArgKind, Interface, MessageDesc};
use crate::object::{ObjectHandle, ObjectId};

/// Signed 24.8 fixed-point number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    pub fn from_raw(raw: i32) -> Fixed {
        Fixed(raw)
    }

    pub fn into_raw(self) -> i32 {
        self.0
    }

    pub fn from_int(i: i32) -> Fixed {
        Fixed(i.wrapping_mul(256))
    }

    pub fn to_int(self) -> i32 {
        self.0 / 256
    }

    pub fn from_f64(d: f64) -> Fixed {
        Fixed((d * 256.0).round() as i32)
    }

    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }
}

impl From<i32> for Fixed {
    fn from(i: i32) -> Fixed {
        Fixed::from_int(i)
    }
}

impl From<f64> for Fixed {
    fn from(d: f64) -> Fixed {
        Fixed::from_f64(d)
    }
}

impl std::fmt::Debug for Fixed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fixed({})", self.to_f64())
    }
}

impl std::fmt::Display for Fixed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// One positional slot of the raw wire representation.
///
/// Word slots carry `i`/`u`/`f`/`o`/`n` arguments; the signature decides
/// how the 32 bits are read. String slots carry the text bytes without the
/// terminator, `None` being the absent string. Array slots carry an owned
/// byte range. Fd slots own the received descriptor: a message that never
/// reaches a handler closes it when the slot drops.
#[derive(Debug, Clone)]
pub enum RawArg {
    Word(u32),
    Str(Option<Vec<u8>>),
    Array(Vec<u8>),
    Fd(Arc<OwnedFd>),
}

impl PartialEq for RawArg {
    fn eq(&self, other: &RawArg) -> bool {
        match (self, other) {
            (RawArg::Word(a), RawArg::Word(b)) => a == b,
            (RawArg::Str(a), RawArg::Str(b)) => a == b,
            (RawArg::Array(a), RawArg::Array(b)) => a == b,
            (RawArg::Fd(a), RawArg::Fd(b)) => a.as_raw_fd() == b.as_raw_fd(),
            _ => false,
        }
    }
}

impl Eq for RawArg {}

/// A single typed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    Str(String),
    Array(Vec<u8>),
    /// An object reference; the handle may be explicitly empty (id 0).
    Object(ObjectHandle),
    /// An object allocated by this message; always an owning handle.
    NewId(ObjectHandle),
    /// A descriptor slot. A received descriptor stays valid only while the
    /// message is being dispatched; a handler that keeps it must duplicate
    /// it.
    Fd(RawFd),
}

impl WireValue {
    pub fn kind(&self) -> ArgKind {
        match self {
            WireValue::Int(_) => ArgKind::Int,
            WireValue::Uint(_) => ArgKind::Uint,
            WireValue::Fixed(_) => ArgKind::Fixed,
            WireValue::Str(_) => ArgKind::Str,
            WireValue::Array(_) => ArgKind::Array,
            WireValue::Object(_) => ArgKind::Object,
            WireValue::NewId(_) => ArgKind::NewId,
            WireValue::Fd(_) => ArgKind::Fd,
        }
    }

    fn mismatch(&self, expected: ArgKind) -> TypeMismatch {
        TypeMismatch { expected, found: self.kind() }
    }

    pub fn as_int(&self) -> Result<i32, TypeMismatch> {
        match self {
            WireValue::Int(i) => Ok(*i),
            other => Err(other.mismatch(ArgKind::Int)),
        }
    }

    pub fn as_uint(&self) -> Result<u32, TypeMismatch> {
        match self {
            WireValue::Uint(u) => Ok(*u),
            other => Err(other.mismatch(ArgKind::Uint)),
        }
    }

    pub fn as_fixed(&self) -> Result<Fixed, TypeMismatch> {
        match self {
            WireValue::Fixed(x) => Ok(*x),
            other => Err(other.mismatch(ArgKind::Fixed)),
        }
    }

    pub fn as_str(&self) -> Result<&str, TypeMismatch> {
        match self {
            WireValue::Str(s) => Ok(s),
            other => Err(other.mismatch(ArgKind::Str)),
        }
    }

    pub fn as_array(&self) -> Result<&[u8], TypeMismatch> {
        match self {
            WireValue::Array(a) => Ok(a),
            other => Err(other.mismatch(ArgKind::Array)),
        }
    }

    pub fn as_object(&self) -> Result<&ObjectHandle, TypeMismatch> {
        match self {
            WireValue::Object(h) => Ok(h),
            other => Err(other.mismatch(ArgKind::Object)),
        }
    }

    pub fn as_new_id(&self) -> Result<&ObjectHandle, TypeMismatch> {
        match self {
            WireValue::NewId(h) => Ok(h),
            other => Err(other.mismatch(ArgKind::NewId)),
        }
    }

    pub fn as_fd(&self) -> Result<RawFd, TypeMismatch> {
        match self {
            WireValue::Fd(fd) => Ok(*fd),
            other => Err(other.mismatch(ArgKind::Fd)),
        }
    }
}

fn take_word(raw: &[RawArg], slot: &mut usize, kind: ArgKind, index: usize) -> Result<u32, DecodeError> {
    match raw.get(*slot) {
        Some(RawArg::Word(w)) => {
            *slot += 1;
            Ok(*w)
        }
        Some(_) => Err(DecodeError::SlotMismatch { expected: kind, index }),
        None => Err(DecodeError::Truncated { expected: kind, index }),
    }
}

/// Decode raw positional slots into typed values against a signature.
///
/// `owner_version` is the version of the message's target object; statically
/// typed new-ids are allocated at that version.
pub(crate) fn decode_args(
    conn: &Arc<ConnectionInner>,
    desc: &'static MessageDesc,
    raw: &[RawArg],
    owner_version: u32,
) -> Result<Vec<WireValue>, DecodeError> {
    let role = conn.local_role();
    let mut out = Vec::new();
    let mut slot = 0usize;

    for (index, spec) in desc.args().enumerate() {
        let spec = spec?;
        match spec.kind {
            ArgKind::Int => {
                let w = take_word(raw, &mut slot, spec.kind, index)?;
                out.push(WireValue::Int(w as i32));
            }
            ArgKind::Uint => {
                let w = take_word(raw, &mut slot, spec.kind, index)?;
                out.push(WireValue::Uint(w));
            }
            ArgKind::Fixed => {
                let w = take_word(raw, &mut slot, spec.kind, index)?;
                out.push(WireValue::Fixed(Fixed::from_raw(w as i32)));
            }
            ArgKind::Fd => match raw.get(slot) {
                Some(RawArg::Fd(fd)) => {
                    slot += 1;
                    out.push(WireValue::Fd(fd.as_raw_fd()));
                }
                Some(_) => return Err(DecodeError::SlotMismatch { expected: spec.kind, index }),
                None => return Err(DecodeError::Truncated { expected: spec.kind, index }),
            },
            ArgKind::Str => match raw.get(slot) {
                Some(RawArg::Str(bytes)) => {
                    slot += 1;
                    // The absent string decodes to "", never to an error.
                    let s = match bytes {
                        None => String::new(),
                        Some(b) => String::from_utf8(b.clone())
                            .map_err(|_| DecodeError::BadUtf8 { index })?,
                    };
                    out.push(WireValue::Str(s));
                }
                Some(_) => return Err(DecodeError::SlotMismatch { expected: spec.kind, index }),
                None => return Err(DecodeError::Truncated { expected: spec.kind, index }),
            },
            ArgKind::Array => match raw.get(slot) {
                Some(RawArg::Array(bytes)) => {
                    slot += 1;
                    out.push(WireValue::Array(bytes.clone()));
                }
                Some(_) => return Err(DecodeError::SlotMismatch { expected: spec.kind, index }),
                None => return Err(DecodeError::Truncated { expected: spec.kind, index }),
            },
            ArgKind::Object => {
                let w = take_word(raw, &mut slot, spec.kind, index)?;
                let id = ObjectId(w);
                let handle = if id.is_null() {
                    ObjectHandle::null(conn.clone())
                } else {
                    ObjectHandle::attach_non_owning(conn.clone(), id, role)
                };
                out.push(WireValue::Object(handle));
            }
            ArgKind::NewId => {
                let w = take_word(raw, &mut slot, spec.kind, index)?;
                let id = ObjectId(w);
                if id.is_null() {
                    return Err(DecodeError::NullNewId { index });
                }
                let (interface, version) = match desc.arg_interface(index) {
                    Some(interface) => (interface, owner_version),
                    None => dynamic_interface(conn, &out, index)?,
                };
                let handle =
                    ObjectHandle::attach_new(conn.clone(), id, interface, version, role)
                        .ok_or(DecodeError::IdInUse(id))?;
                out.push(WireValue::NewId(handle));
            }
        }
    }

    if slot != raw.len() {
        return Err(DecodeError::BadFrame("trailing raw arguments"));
    }
    Ok(out)
}

/// Resolve a dynamically-typed new-id from the name/version pair carried by
/// the two preceding arguments of the same message.
fn dynamic_interface(
    conn: &Arc<ConnectionInner>,
    decoded: &[WireValue],
    index: usize,
) -> Result<(&'static Interface, u32), DecodeError> {
    if decoded.len() < 2 {
        return Err(DecodeError::MissingNewIdContext { index });
    }
    let name = match &decoded[decoded.len() - 2] {
        WireValue::Str(s) => s.as_str(),
        _ => return Err(DecodeError::MissingNewIdContext { index }),
    };
    let version = match &decoded[decoded.len() - 1] {
        WireValue::Uint(v) => *v,
        _ => return Err(DecodeError::MissingNewIdContext { index }),
    };
    let interface = conn
        .lookup_interface(name)
        .ok_or_else(|| DecodeError::UnknownInterface(name.to_owned()))?;
    Ok((interface, version))
}

/// Encode typed values into raw positional slots against a signature.
///
/// The exact inverse of [`decode_args`]: object-typed values encode as their
/// native id (0 for an empty handle). A nullable empty string encodes as the
/// absent string.
pub fn encode_args(desc: &MessageDesc, values: &[WireValue]) -> Result<Vec<RawArg>, EncodeError> {
    let specs: Vec<_> = desc
        .args()
        .collect::<Result<_, _>>()
        .map_err(|e| match e {
            DecodeError::BadSignature(c) => EncodeError::BadSignature(c),
            _ => EncodeError::BadSignature('?'),
        })?;
    if specs.len() != values.len() {
        return Err(EncodeError::Arity { expected: specs.len(), found: values.len() });
    }

    let mut out = Vec::with_capacity(values.len());
    for (spec, value) in specs.iter().zip(values) {
        let slot = match spec.kind {
            ArgKind::Int => RawArg::Word(value.as_int()? as u32),
            ArgKind::Uint => RawArg::Word(value.as_uint()?),
            ArgKind::Fixed => RawArg::Word(value.as_fixed()?.into_raw() as u32),
            ArgKind::Fd => RawArg::Word(value.as_fd()? as u32),
            ArgKind::Str => {
                let s = value.as_str()?;
                if spec.nullable && s.is_empty() {
                    RawArg::Str(None)
                } else {
                    RawArg::Str(Some(s.as_bytes().to_vec()))
                }
            }
            ArgKind::Array => RawArg::Array(value.as_array()?.to_vec()),
            ArgKind::Object => RawArg::Word(value.as_object()?.id().0),
            ArgKind::NewId => RawArg::Word(value.as_new_id()?.id().0),
        };
        out.push(slot);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_conversions() {
        assert_eq!(Fixed::from_int(7).into_raw(), 7 * 256);
        assert_eq!(Fixed::from_int(-3).to_int(), -3);
        assert_eq!(Fixed::from_f64(1.5).to_f64(), 1.5);
        assert_eq!(Fixed::from_f64(0.25).into_raw(), 64);
        assert_eq!(Fixed::from_raw(384).to_int(), 1);
        assert_eq!(Fixed::ZERO.to_f64(), 0.0);
    }

    #[test]
    fn tag_checked_access() {
        let v = WireValue::Uint(42);
        assert_eq!(v.as_uint(), Ok(42));
        let err = v.as_int().unwrap_err();
        assert_eq!(err.expected, ArgKind::Int);
        assert_eq!(err.found, ArgKind::Uint);

        let v = WireValue::Str("hello".into());
        assert_eq!(v.as_str(), Ok("hello"));
        assert!(v.as_array().is_err());
    }

    #[test]
    fn value_kind_matches_tag() {
        assert_eq!(WireValue::Fd(3).kind(), ArgKind::Fd);
        assert_eq!(WireValue::Fixed(Fixed::ZERO).kind(), ArgKind::Fixed);
        assert_eq!(WireValue::Array(vec![1]).kind(), ArgKind::Array);
    }
}
