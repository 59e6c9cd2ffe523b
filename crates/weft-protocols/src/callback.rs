//! `weft_callback` — one-shot completion notification.

use std::sync::Arc;

use parking_lot::Mutex;
use weft_core::{Interface, MessageDesc, ObjectHandle, SendError, WireValue};

use crate::glue::install_events;

pub const EVT_DONE: u16 = 0;

pub static INTERFACE: Interface = Interface {
    name: "weft_callback",
    version: 1,
    requests: &[],
    events: &[MessageDesc { name: "done", signature: "u", arg_interfaces: &[None] }],
};

#[derive(Default)]
struct CallbackEvents {
    done: Mutex<Option<Box<dyn FnMut(u32) + Send>>>,
}

/// Outbound-role wrapper: receives `done`.
#[derive(Debug, Clone)]
pub struct Callback {
    handle: ObjectHandle,
}

impl Callback {
    pub fn from_handle(handle: ObjectHandle) -> Callback {
        Callback { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    fn events(&self) -> Arc<CallbackEvents> {
        install_events(&self.handle, INTERFACE.events.len(), |events: &Arc<CallbackEvents>, table| {
            let events = events.clone();
            table.on(EVT_DONE, move |_, args| {
                if let Some(f) = events.done.lock().as_mut() {
                    f(args[0].as_uint()?);
                }
                Ok(())
            })
        })
    }

    pub fn on_done(&self, f: impl FnMut(u32) + Send + 'static) {
        *self.events().done.lock() = Some(Box::new(f));
    }
}

/// Inbound-role wrapper: emits `done`.
#[derive(Debug, Clone)]
pub struct CallbackResource {
    handle: ObjectHandle,
}

impl CallbackResource {
    pub fn from_handle(handle: ObjectHandle) -> CallbackResource {
        CallbackResource { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    pub fn done(&self, serial: u32) -> Result<(), SendError> {
        self.handle.send(EVT_DONE, &[WireValue::Uint(serial)])
    }
}
