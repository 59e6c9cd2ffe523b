//! Interface descriptors and signature strings.
//!
//! Descriptors are the data contract between the protocol compiler and the
//! runtime: per interface an ordered request list and an ordered event list,
//! per message a compact signature string. A message's opcode is its position
//! in the list, defined solely by declaration order.
//!
//! Signature alphabet: `i` signed integer, `u` unsigned integer, `f`
//! fixed-point, `s` text, `o` object reference, `n` new-id, `a` byte array,
//! `h` file descriptor. A `?` prefix marks the following argument as
//! nullable; decimal digits before the first argument give the minimum
//! interface version at which the message was introduced. Modifiers never
//! consume a raw argument slot.

use std::fmt;

use crate::error::DecodeError;

/// Primitive kind of one wire argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Int,
    Uint,
    Fixed,
    Str,
    Object,
    NewId,
    Array,
    Fd,
}

impl ArgKind {
    pub fn from_char(c: char) -> Option<ArgKind> {
        Some(match c {
            'i' => ArgKind::Int,
            'u' => ArgKind::Uint,
            'f' => ArgKind::Fixed,
            's' => ArgKind::Str,
            'o' => ArgKind::Object,
            'n' => ArgKind::NewId,
            'a' => ArgKind::Array,
            'h' => ArgKind::Fd,
            _ => return None,
        })
    }

    pub fn to_char(self) -> char {
        match self {
            ArgKind::Int => 'i',
            ArgKind::Uint => 'u',
            ArgKind::Fixed => 'f',
            ArgKind::Str => 's',
            ArgKind::Object => 'o',
            ArgKind::NewId => 'n',
            ArgKind::Array => 'a',
            ArgKind::Fd => 'h',
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.to_char())
    }
}

/// One argument position parsed out of a signature string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub kind: ArgKind,
    pub nullable: bool,
}

/// Minimum interface version at which a message was introduced.
///
/// Leading decimal digits of the signature; absent digits mean 1.
pub fn since_version(signature: &str) -> u32 {
    let digits: String = signature.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { 1 } else { digits.parse().unwrap_or(1) }
}

/// Iterator over the argument positions of a signature string.
///
/// Yields `Err(DecodeError::BadSignature)` on a character outside the wire
/// alphabet; digits and `?` are treated as modifiers.
#[derive(Clone)]
pub struct SignatureIter<'a> {
    rest: std::str::Chars<'a>,
}

pub fn signature_args(signature: &str) -> SignatureIter<'_> {
    let body = signature.trim_start_matches(|c: char| c.is_ascii_digit());
    SignatureIter { rest: body.chars() }
}

impl Iterator for SignatureIter<'_> {
    type Item = Result<ArgSpec, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut nullable = false;
        loop {
            let c = self.rest.next()?;
            if c == '?' {
                nullable = true;
                continue;
            }
            return Some(match ArgKind::from_char(c) {
                Some(kind) => Ok(ArgSpec { kind, nullable }),
                None => Err(DecodeError::BadSignature(c)),
            });
        }
    }
}

/// Description of a single request or event.
#[derive(Debug)]
pub struct MessageDesc {
    pub name: &'static str,
    pub signature: &'static str,
    /// One entry per argument position; `Some` for `o`/`n` arguments whose
    /// referenced interface is statically known, `None` everywhere else
    /// (including dynamically-typed new-ids).
    pub arg_interfaces: &'static [Option<&'static Interface>],
}

impl MessageDesc {
    pub fn since(&self) -> u32 {
        since_version(self.signature)
    }

    pub fn args(&self) -> SignatureIter<'_> {
        signature_args(self.signature)
    }

    /// Statically-known interface for the argument at `index`, if any.
    pub fn arg_interface(&self, index: usize) -> Option<&'static Interface> {
        self.arg_interfaces.get(index).copied().flatten()
    }
}

/// Direction of a message relative to the declaring interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Event,
}

/// Description of one protocol interface, produced by the protocol compiler
/// and consumed read-only by the runtime.
#[derive(Debug)]
pub struct Interface {
    pub name: &'static str,
    pub version: u32,
    pub requests: &'static [MessageDesc],
    pub events: &'static [MessageDesc],
}

impl Interface {
    pub fn message(&'static self, direction: Direction, opcode: u16) -> Option<&'static MessageDesc> {
        let list = match direction {
            Direction::Request => self.requests,
            Direction::Event => self.events,
        };
        list.get(opcode as usize)
    }

    pub fn request(&'static self, opcode: u16) -> Option<&'static MessageDesc> {
        self.message(Direction::Request, opcode)
    }

    pub fn event(&'static self, opcode: u16) -> Option<&'static MessageDesc> {
        self.message(Direction::Event, opcode)
    }

    /// Descriptor identity: two references name the same interface when they
    /// point at the same static.
    pub fn same_as(&'static self, other: &'static Interface) -> bool {
        std::ptr::eq(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_modifiers_are_not_slots() {
        let specs: Vec<_> = signature_args("2?oii").map(Result::unwrap).collect();
        assert_eq!(
            specs,
            vec![
                ArgSpec { kind: ArgKind::Object, nullable: true },
                ArgSpec { kind: ArgKind::Int, nullable: false },
                ArgSpec { kind: ArgKind::Int, nullable: false },
            ]
        );
    }

    #[test]
    fn since_version_defaults_to_one() {
        assert_eq!(since_version("usun"), 1);
        assert_eq!(since_version("3n"), 3);
        assert_eq!(since_version("12u"), 12);
        assert_eq!(since_version(""), 1);
    }

    #[test]
    fn bad_signature_character_is_an_error() {
        let mut it = signature_args("ix");
        assert!(it.next().unwrap().is_ok());
        assert_eq!(it.next().unwrap(), Err(DecodeError::BadSignature('x')));
    }

    #[test]
    fn opcode_is_declaration_position() {
        static CALLEE: Interface =
            Interface { name: "callee", version: 1, requests: &[], events: &[] };
        static IFACE: Interface = Interface {
            name: "iface",
            version: 1,
            requests: &[
                MessageDesc { name: "destroy", signature: "", arg_interfaces: &[] },
                MessageDesc {
                    name: "attach",
                    signature: "?oii",
                    arg_interfaces: &[Some(&CALLEE), None, None],
                },
            ],
            events: &[MessageDesc { name: "done", signature: "u", arg_interfaces: &[None] }],
        };

        assert_eq!(IFACE.request(0).unwrap().name, "destroy");
        assert_eq!(IFACE.request(1).unwrap().name, "attach");
        assert_eq!(IFACE.event(0).unwrap().name, "done");
        assert!(IFACE.request(2).is_none());
        assert!(IFACE.request(1).unwrap().arg_interface(0).unwrap().same_as(&CALLEE));
    }
}
