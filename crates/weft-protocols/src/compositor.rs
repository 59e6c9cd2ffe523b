//! `weft_compositor` — surface factory.

use std::sync::Arc;

use parking_lot::Mutex;
use weft_core::{Interface, MessageDesc, ObjectHandle, SendError};

use crate::glue::install_events;
use crate::surface::{self, Surface, SurfaceResource};

pub const REQ_CREATE_SURFACE: u16 = 0;

pub static INTERFACE: Interface = Interface {
    name: "weft_compositor",
    version: 1,
    requests: &[MessageDesc {
        name: "create_surface",
        signature: "n",
        arg_interfaces: &[Some(&surface::INTERFACE)],
    }],
    events: &[],
};

/// Outbound-role wrapper.
#[derive(Debug, Clone)]
pub struct Compositor {
    handle: ObjectHandle,
}

impl Compositor {
    pub fn from_handle(handle: ObjectHandle) -> Compositor {
        Compositor { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    pub fn create_surface(&self) -> Result<Surface, SendError> {
        let handle =
            self.handle.send_constructor(REQ_CREATE_SURFACE, &[], &surface::INTERFACE, None)?;
        Ok(Surface::from_handle(handle))
    }
}

#[derive(Default)]
struct CompositorRequests {
    create_surface: Mutex<Option<Box<dyn FnMut(SurfaceResource) + Send>>>,
}

/// Inbound-role wrapper.
#[derive(Debug, Clone)]
pub struct CompositorResource {
    handle: ObjectHandle,
}

impl CompositorResource {
    pub fn from_handle(handle: ObjectHandle) -> CompositorResource {
        CompositorResource { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    fn requests(&self) -> Arc<CompositorRequests> {
        install_events(&self.handle, INTERFACE.requests.len(), |requests: &Arc<CompositorRequests>, table| {
            let requests = requests.clone();
            table.on(REQ_CREATE_SURFACE, move |_, args| {
                if let Some(f) = requests.create_surface.lock().as_mut() {
                    f(SurfaceResource::from_handle(args[0].as_new_id()?.clone()));
                }
                Ok(())
            })
        })
    }

    pub fn on_create_surface(&self, f: impl FnMut(SurfaceResource) + Send + 'static) {
        *self.requests().create_surface.lock() = Some(Box::new(f));
    }
}
