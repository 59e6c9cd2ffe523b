//! `weft_shm_pool` — buffer slicing over a shared mapping.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;
use weft_core::{Interface, MessageDesc, ObjectHandle, SendError, WireValue};

use crate::buffer::{self, Buffer, BufferResource};
use crate::glue::install_events;
use crate::shm::Format;

pub const REQ_CREATE_BUFFER: u16 = 0;
pub const REQ_DESTROY: u16 = 1;
pub const REQ_RESIZE: u16 = 2;

pub static INTERFACE: Interface = Interface {
    name: "weft_shm_pool",
    version: 1,
    requests: &[
        MessageDesc {
            name: "create_buffer",
            signature: "niiiiu",
            arg_interfaces: &[Some(&buffer::INTERFACE), None, None, None, None, None],
        },
        MessageDesc { name: "destroy", signature: "", arg_interfaces: &[] },
        MessageDesc { name: "resize", signature: "i", arg_interfaces: &[None] },
    ],
    events: &[],
};

/// Outbound-role wrapper. Dropping the last clone sends `destroy`.
#[derive(Debug, Clone)]
pub struct ShmPool {
    handle: ObjectHandle,
}

impl ShmPool {
    pub fn from_handle(handle: ObjectHandle) -> ShmPool {
        handle.set_destroy_opcode(Some(REQ_DESTROY));
        ShmPool { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    pub fn create_buffer(
        &self,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: Format,
    ) -> Result<Buffer, SendError> {
        let handle = self.handle.send_constructor(
            REQ_CREATE_BUFFER,
            &[
                WireValue::Int(offset),
                WireValue::Int(width),
                WireValue::Int(height),
                WireValue::Int(stride),
                WireValue::Uint(format.into()),
            ],
            &buffer::INTERFACE,
            None,
        )?;
        Ok(Buffer::from_handle(handle))
    }

    /// Grow the pool. The mapping behind the pool only ever grows.
    pub fn resize(&self, size: i32) -> Result<(), SendError> {
        self.handle.send(REQ_RESIZE, &[WireValue::Int(size)])
    }
}

/// Decoded `create_buffer` parameters, handed to the serving side whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub offset: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: Format,
}

#[derive(Default)]
struct ShmPoolRequests {
    create_buffer: Mutex<Option<Box<dyn FnMut(BufferResource, BufferSpec) + Send>>>,
    destroy: Mutex<Option<Box<dyn FnMut() + Send>>>,
    resize: Mutex<Option<Box<dyn FnMut(i32) + Send>>>,
}

/// Inbound-role wrapper.
#[derive(Debug, Clone)]
pub struct ShmPoolResource {
    handle: ObjectHandle,
}

impl ShmPoolResource {
    pub fn from_handle(handle: ObjectHandle) -> ShmPoolResource {
        ShmPoolResource { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    fn requests(&self) -> Arc<ShmPoolRequests> {
        install_events(&self.handle, INTERFACE.requests.len(), |requests: &Arc<ShmPoolRequests>, table| {
            table
                .on(REQ_CREATE_BUFFER, {
                    let requests = requests.clone();
                    move |_, args| {
                        let raw_format = args[5].as_uint()?;
                        let format = match Format::try_from(raw_format) {
                            Ok(format) => format,
                            Err(e) => {
                                warn!(%e, "create_buffer with unknown format dropped");
                                return Ok(());
                            }
                        };
                        if let Some(f) = requests.create_buffer.lock().as_mut() {
                            f(
                                BufferResource::from_handle(args[0].as_new_id()?.clone()),
                                BufferSpec {
                                    offset: args[1].as_int()?,
                                    width: args[2].as_int()?,
                                    height: args[3].as_int()?,
                                    stride: args[4].as_int()?,
                                    format,
                                },
                            );
                        }
                        Ok(())
                    }
                })
                .on(REQ_DESTROY, {
                    let requests = requests.clone();
                    move |_, _| {
                        if let Some(f) = requests.destroy.lock().as_mut() {
                            f();
                        }
                        Ok(())
                    }
                })
                .on(REQ_RESIZE, {
                    let requests = requests.clone();
                    move |_, args| {
                        if let Some(f) = requests.resize.lock().as_mut() {
                            f(args[0].as_int()?);
                        }
                        Ok(())
                    }
                })
        })
    }

    pub fn on_create_buffer(&self, f: impl FnMut(BufferResource, BufferSpec) + Send + 'static) {
        *self.requests().create_buffer.lock() = Some(Box::new(f));
    }

    pub fn on_destroy(&self, f: impl FnMut() + Send + 'static) {
        *self.requests().destroy.lock() = Some(Box::new(f));
    }

    pub fn on_resize(&self, f: impl FnMut(i32) + Send + 'static) {
        *self.requests().resize.lock() = Some(Box::new(f));
    }
}
