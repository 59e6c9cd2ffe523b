//! `weft_display` — the connection root interface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use weft_core::{
    Connection, ConnectionError, Interface, MessageDesc, ObjectHandle, SendError, WireValue,
};

use crate::callback::{self, Callback, CallbackResource};
use crate::glue::install_events;
use crate::registry::{self, Registry, RegistryResource};

pub const REQ_SYNC: u16 = 0;
pub const REQ_GET_REGISTRY: u16 = 1;
pub const EVT_ERROR: u16 = 0;
pub const EVT_DELETE_ID: u16 = 1;

pub static INTERFACE: Interface = Interface {
    name: "weft_display",
    version: 1,
    requests: &[
        MessageDesc { name: "sync", signature: "n", arg_interfaces: &[Some(&callback::INTERFACE)] },
        MessageDesc {
            name: "get_registry",
            signature: "n",
            arg_interfaces: &[Some(&registry::INTERFACE)],
        },
    ],
    events: &[
        MessageDesc { name: "error", signature: "ous", arg_interfaces: &[None, None, None] },
        MessageDesc { name: "delete_id", signature: "u", arg_interfaces: &[None] },
    ],
};

#[derive(Default)]
struct DisplayEvents {
    error: Mutex<Option<Box<dyn FnMut(ObjectHandle, u32, String) + Send>>>,
    delete_id: Mutex<Option<Box<dyn FnMut(u32) + Send>>>,
}

/// Outbound-role wrapper over the connection root.
#[derive(Debug, Clone)]
pub struct Display {
    handle: ObjectHandle,
}

impl Display {
    /// The root of an outbound connection.
    pub fn from_connection(conn: &Connection) -> Display {
        Display { handle: conn.root() }
    }

    pub fn from_handle(handle: ObjectHandle) -> Display {
        Display { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    /// Request a completion callback; the peer fires `done` once every
    /// earlier message was processed.
    pub fn sync(&self) -> Result<Callback, SendError> {
        let handle = self.handle.send_constructor(REQ_SYNC, &[], &callback::INTERFACE, None)?;
        Ok(Callback::from_handle(handle))
    }

    pub fn get_registry(&self) -> Result<Registry, SendError> {
        let handle =
            self.handle.send_constructor(REQ_GET_REGISTRY, &[], &registry::INTERFACE, None)?;
        Ok(Registry::from_handle(handle))
    }

    /// Block until the peer has processed every message sent so far.
    pub fn roundtrip(&self, conn: &Connection) -> Result<(), ConnectionError> {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let callback = self.sync().map_err(|e| match e {
            SendError::Connection(e) => e,
            SendError::Encode(_) => ConnectionError::InvariantViolated("sync encode failed"),
        })?;
        callback.on_done(move |_| flag.store(true, Ordering::SeqCst));
        while !done.load(Ordering::SeqCst) {
            conn.dispatch_default()?;
        }
        Ok(())
    }

    fn events(&self) -> Arc<DisplayEvents> {
        install_events(&self.handle, INTERFACE.events.len(), |events: &Arc<DisplayEvents>, table| {
            table
                .on(EVT_ERROR, {
                    let events = events.clone();
                    move |_, args| {
                        if let Some(f) = events.error.lock().as_mut() {
                            f(
                                args[0].as_object()?.clone(),
                                args[1].as_uint()?,
                                args[2].as_str()?.to_owned(),
                            );
                        }
                        Ok(())
                    }
                })
                .on(EVT_DELETE_ID, {
                    let events = events.clone();
                    move |_, args| {
                        if let Some(f) = events.delete_id.lock().as_mut() {
                            f(args[0].as_uint()?);
                        }
                        Ok(())
                    }
                })
        })
    }

    pub fn on_error(&self, f: impl FnMut(ObjectHandle, u32, String) + Send + 'static) {
        *self.events().error.lock() = Some(Box::new(f));
    }

    pub fn on_delete_id(&self, f: impl FnMut(u32) + Send + 'static) {
        *self.events().delete_id.lock() = Some(Box::new(f));
    }
}

#[derive(Default)]
struct DisplayRequests {
    sync: Mutex<Option<Box<dyn FnMut(CallbackResource) + Send>>>,
    get_registry: Mutex<Option<Box<dyn FnMut(RegistryResource) + Send>>>,
}

/// Inbound-role wrapper over the connection root.
#[derive(Debug, Clone)]
pub struct DisplayResource {
    handle: ObjectHandle,
}

impl DisplayResource {
    /// The root of an inbound connection.
    pub fn from_connection(conn: &Connection) -> DisplayResource {
        DisplayResource { handle: conn.root() }
    }

    pub fn from_handle(handle: ObjectHandle) -> DisplayResource {
        DisplayResource { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    fn requests(&self) -> Arc<DisplayRequests> {
        install_events(&self.handle, INTERFACE.requests.len(), |requests: &Arc<DisplayRequests>, table| {
            table
                .on(REQ_SYNC, {
                    let requests = requests.clone();
                    move |_, args| {
                        if let Some(f) = requests.sync.lock().as_mut() {
                            f(CallbackResource::from_handle(args[0].as_new_id()?.clone()));
                        }
                        Ok(())
                    }
                })
                .on(REQ_GET_REGISTRY, {
                    let requests = requests.clone();
                    move |_, args| {
                        if let Some(f) = requests.get_registry.lock().as_mut() {
                            f(RegistryResource::from_handle(args[0].as_new_id()?.clone()));
                        }
                        Ok(())
                    }
                })
        })
    }

    pub fn on_sync(&self, f: impl FnMut(CallbackResource) + Send + 'static) {
        *self.requests().sync.lock() = Some(Box::new(f));
    }

    pub fn on_get_registry(&self, f: impl FnMut(RegistryResource) + Send + 'static) {
        *self.requests().get_registry.lock() = Some(Box::new(f));
    }

    /// Report a protocol error on `target` to the peer.
    pub fn error(&self, target: &ObjectHandle, code: u32, message: &str) -> Result<(), SendError> {
        self.handle.send(
            EVT_ERROR,
            &[
                WireValue::Object(target.clone()),
                WireValue::Uint(code),
                WireValue::Str(message.to_owned()),
            ],
        )
    }

    /// Tell the peer an id was retired and may be reused.
    pub fn delete_id(&self, id: u32) -> Result<(), SendError> {
        self.handle.send(EVT_DELETE_ID, &[WireValue::Uint(id)])
    }

    /// Answer `sync` requests automatically with an immediate `done`.
    pub fn serve_sync(&self) {
        let serial = Arc::new(std::sync::atomic::AtomicU32::new(0));
        self.on_sync(move |callback| {
            let n = serial.fetch_add(1, Ordering::SeqCst);
            let _ = callback.done(n);
        });
    }
}
