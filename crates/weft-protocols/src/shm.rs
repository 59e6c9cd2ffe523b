//! `weft_shm` — shared-memory buffer-pool capability.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;
use weft_core::{Interface, MessageDesc, ObjectHandle, SendError, WireValue};

use crate::glue::install_events;
use crate::shm_pool::{self, ShmPool, ShmPoolResource};

pub const REQ_CREATE_POOL: u16 = 0;
pub const EVT_FORMAT: u16 = 0;

pub static INTERFACE: Interface = Interface {
    name: "weft_shm",
    version: 1,
    requests: &[MessageDesc {
        name: "create_pool",
        signature: "nhi",
        arg_interfaces: &[Some(&shm_pool::INTERFACE), None, None],
    }],
    events: &[MessageDesc { name: "format", signature: "u", arg_interfaces: &[None] }],
};

/// Pixel formats the pool capability can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Format {
    Argb8888 = 0,
    Xrgb8888 = 1,
    Rgb565 = 2,
}

impl From<Format> for u32 {
    fn from(f: Format) -> u32 {
        f as u32
    }
}

impl TryFrom<u32> for Format {
    type Error = UnknownFormat;

    fn try_from(raw: u32) -> Result<Format, UnknownFormat> {
        match raw {
            0 => Ok(Format::Argb8888),
            1 => Ok(Format::Xrgb8888),
            2 => Ok(Format::Rgb565),
            other => Err(UnknownFormat(other)),
        }
    }
}

/// A format word outside the declared enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownFormat(pub u32);

impl fmt::Display for UnknownFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown pixel format {:#x}", self.0)
    }
}

impl std::error::Error for UnknownFormat {}

#[derive(Default)]
struct ShmEvents {
    format: Mutex<Option<Box<dyn FnMut(Format) + Send>>>,
}

/// Outbound-role wrapper.
#[derive(Debug, Clone)]
pub struct Shm {
    handle: ObjectHandle,
}

impl Shm {
    pub fn from_handle(handle: ObjectHandle) -> Shm {
        Shm { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    /// Share `size` bytes of the mapping behind `fd` as a buffer pool. The
    /// fd is duplicated for transfer; the caller keeps its copy.
    pub fn create_pool(&self, fd: RawFd, size: i32) -> Result<ShmPool, SendError> {
        let handle = self.handle.send_constructor(
            REQ_CREATE_POOL,
            &[WireValue::Fd(fd), WireValue::Int(size)],
            &shm_pool::INTERFACE,
            None,
        )?;
        Ok(ShmPool::from_handle(handle))
    }

    fn events(&self) -> Arc<ShmEvents> {
        install_events(&self.handle, INTERFACE.events.len(), |events: &Arc<ShmEvents>, table| {
            let events = events.clone();
            table.on(EVT_FORMAT, move |_, args| {
                let raw = args[0].as_uint()?;
                match Format::try_from(raw) {
                    Ok(format) => {
                        if let Some(f) = events.format.lock().as_mut() {
                            f(format);
                        }
                    }
                    Err(e) => warn!(%e, "format announcement dropped"),
                }
                Ok(())
            })
        })
    }

    pub fn on_format(&self, f: impl FnMut(Format) + Send + 'static) {
        *self.events().format.lock() = Some(Box::new(f));
    }
}

#[derive(Default)]
struct ShmRequests {
    create_pool: Mutex<Option<Box<dyn FnMut(ShmPoolResource, RawFd, i32) + Send>>>,
}

/// Inbound-role wrapper.
#[derive(Debug, Clone)]
pub struct ShmResource {
    handle: ObjectHandle,
}

impl ShmResource {
    pub fn from_handle(handle: ObjectHandle) -> ShmResource {
        ShmResource { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    fn requests(&self) -> Arc<ShmRequests> {
        install_events(&self.handle, INTERFACE.requests.len(), |requests: &Arc<ShmRequests>, table| {
            let requests = requests.clone();
            table.on(REQ_CREATE_POOL, move |_, args| {
                if let Some(f) = requests.create_pool.lock().as_mut() {
                    f(
                        ShmPoolResource::from_handle(args[0].as_new_id()?.clone()),
                        args[1].as_fd()?,
                        args[2].as_int()?,
                    );
                }
                Ok(())
            })
        })
    }

    /// The received fd stays valid only for the duration of the callback;
    /// duplicate it to keep the pool mapping alive beyond it.
    pub fn on_create_pool(&self, f: impl FnMut(ShmPoolResource, RawFd, i32) + Send + 'static) {
        *self.requests().create_pool.lock() = Some(Box::new(f));
    }

    pub fn format(&self, format: Format) -> Result<(), SendError> {
        self.handle.send(EVT_FORMAT, &[WireValue::Uint(format.into())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_roundtrips_through_u32() {
        assert_eq!(Format::try_from(u32::from(Format::Rgb565)), Ok(Format::Rgb565));
        assert_eq!(Format::try_from(7), Err(UnknownFormat(7)));
    }
}
