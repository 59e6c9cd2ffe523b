//! `weft_surface` — a presentable content object.

use std::sync::Arc;

use parking_lot::Mutex;
use weft_core::{Interface, MessageDesc, ObjectHandle, SendError, WireValue};

use crate::buffer::Buffer;
use crate::callback::{self, Callback, CallbackResource};
use crate::glue::install_events;

pub const REQ_DESTROY: u16 = 0;
pub const REQ_ATTACH: u16 = 1;
pub const REQ_FRAME: u16 = 2;
pub const REQ_COMMIT: u16 = 3;

pub static INTERFACE: Interface = Interface {
    name: "weft_surface",
    version: 1,
    requests: &[
        MessageDesc { name: "destroy", signature: "", arg_interfaces: &[] },
        MessageDesc { name: "attach", signature: "?oii", arg_interfaces: &[None, None, None] },
        MessageDesc {
            name: "frame",
            signature: "n",
            arg_interfaces: &[Some(&callback::INTERFACE)],
        },
        MessageDesc { name: "commit", signature: "", arg_interfaces: &[] },
    ],
    events: &[],
};

/// Outbound-role wrapper. Dropping the last clone sends `destroy`.
#[derive(Debug, Clone)]
pub struct Surface {
    handle: ObjectHandle,
}

impl Surface {
    pub fn from_handle(handle: ObjectHandle) -> Surface {
        handle.set_destroy_opcode(Some(REQ_DESTROY));
        Surface { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    /// Stage `buffer` as the surface content at the given offset; `None`
    /// stages removal of the current content.
    pub fn attach(&self, buffer: Option<&Buffer>, x: i32, y: i32) -> Result<(), SendError> {
        let reference = match buffer {
            Some(b) => b.handle().clone(),
            None => self.handle.null_handle(),
        };
        self.handle.send(
            REQ_ATTACH,
            &[WireValue::Object(reference), WireValue::Int(x), WireValue::Int(y)],
        )
    }

    /// Request a callback for the next time presenting new content makes
    /// sense.
    pub fn frame(&self) -> Result<Callback, SendError> {
        let handle = self.handle.send_constructor(REQ_FRAME, &[], &callback::INTERFACE, None)?;
        Ok(Callback::from_handle(handle))
    }

    /// Apply all staged state atomically.
    pub fn commit(&self) -> Result<(), SendError> {
        self.handle.send(REQ_COMMIT, &[])
    }
}

#[derive(Default)]
struct SurfaceRequests {
    destroy: Mutex<Option<Box<dyn FnMut() + Send>>>,
    attach: Mutex<Option<Box<dyn FnMut(ObjectHandle, i32, i32) + Send>>>,
    frame: Mutex<Option<Box<dyn FnMut(CallbackResource) + Send>>>,
    commit: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

/// Inbound-role wrapper.
#[derive(Debug, Clone)]
pub struct SurfaceResource {
    handle: ObjectHandle,
}

impl SurfaceResource {
    pub fn from_handle(handle: ObjectHandle) -> SurfaceResource {
        SurfaceResource { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    fn requests(&self) -> Arc<SurfaceRequests> {
        install_events(&self.handle, INTERFACE.requests.len(), |requests: &Arc<SurfaceRequests>, table| {
            table
                .on(REQ_DESTROY, {
                    let requests = requests.clone();
                    move |_, _| {
                        if let Some(f) = requests.destroy.lock().as_mut() {
                            f();
                        }
                        Ok(())
                    }
                })
                .on(REQ_ATTACH, {
                    let requests = requests.clone();
                    move |_, args| {
                        if let Some(f) = requests.attach.lock().as_mut() {
                            f(args[0].as_object()?.clone(), args[1].as_int()?, args[2].as_int()?);
                        }
                        Ok(())
                    }
                })
                .on(REQ_FRAME, {
                    let requests = requests.clone();
                    move |_, args| {
                        if let Some(f) = requests.frame.lock().as_mut() {
                            f(CallbackResource::from_handle(args[0].as_new_id()?.clone()));
                        }
                        Ok(())
                    }
                })
                .on(REQ_COMMIT, {
                    let requests = requests.clone();
                    move |_, _| {
                        if let Some(f) = requests.commit.lock().as_mut() {
                            f();
                        }
                        Ok(())
                    }
                })
        })
    }

    pub fn on_destroy(&self, f: impl FnMut() + Send + 'static) {
        *self.requests().destroy.lock() = Some(Box::new(f));
    }

    /// The attached buffer arrives as a possibly-empty handle (empty means
    /// content removal).
    pub fn on_attach(&self, f: impl FnMut(ObjectHandle, i32, i32) + Send + 'static) {
        *self.requests().attach.lock() = Some(Box::new(f));
    }

    pub fn on_frame(&self, f: impl FnMut(CallbackResource) + Send + 'static) {
        *self.requests().frame.lock() = Some(Box::new(f));
    }

    pub fn on_commit(&self, f: impl FnMut() + Send + 'static) {
        *self.requests().commit.lock() = Some(Box::new(f));
    }
}
