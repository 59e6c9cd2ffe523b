//! `weft_buffer` — a chunk of presentable pixel storage.

use std::sync::Arc;

use parking_lot::Mutex;
use weft_core::{Interface, MessageDesc, ObjectHandle, SendError};

use crate::glue::install_events;

pub const REQ_DESTROY: u16 = 0;
pub const EVT_RELEASE: u16 = 0;

pub static INTERFACE: Interface = Interface {
    name: "weft_buffer",
    version: 1,
    requests: &[MessageDesc { name: "destroy", signature: "", arg_interfaces: &[] }],
    events: &[MessageDesc { name: "release", signature: "", arg_interfaces: &[] }],
};

#[derive(Default)]
struct BufferEvents {
    release: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

/// Outbound-role wrapper. Dropping the last clone sends `destroy`.
#[derive(Debug, Clone)]
pub struct Buffer {
    handle: ObjectHandle,
}

impl Buffer {
    pub fn from_handle(handle: ObjectHandle) -> Buffer {
        handle.set_destroy_opcode(Some(REQ_DESTROY));
        Buffer { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    fn events(&self) -> Arc<BufferEvents> {
        install_events(&self.handle, INTERFACE.events.len(), |events: &Arc<BufferEvents>, table| {
            let events = events.clone();
            table.on(EVT_RELEASE, move |_, _| {
                if let Some(f) = events.release.lock().as_mut() {
                    f();
                }
                Ok(())
            })
        })
    }

    /// The peer no longer reads the storage; it may be reused.
    pub fn on_release(&self, f: impl FnMut() + Send + 'static) {
        *self.events().release.lock() = Some(Box::new(f));
    }
}

#[derive(Default)]
struct BufferRequests {
    destroy: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

/// Inbound-role wrapper.
#[derive(Debug, Clone)]
pub struct BufferResource {
    handle: ObjectHandle,
}

impl BufferResource {
    pub fn from_handle(handle: ObjectHandle) -> BufferResource {
        BufferResource { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    fn requests(&self) -> Arc<BufferRequests> {
        install_events(&self.handle, INTERFACE.requests.len(), |requests: &Arc<BufferRequests>, table| {
            let requests = requests.clone();
            table.on(REQ_DESTROY, move |_, _| {
                if let Some(f) = requests.destroy.lock().as_mut() {
                    f();
                }
                Ok(())
            })
        })
    }

    pub fn on_destroy(&self, f: impl FnMut() + Send + 'static) {
        *self.requests().destroy.lock() = Some(Box::new(f));
    }

    pub fn release(&self) -> Result<(), SendError> {
        self.handle.send(EVT_RELEASE, &[])
    }
}
