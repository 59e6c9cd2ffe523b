//! `weft_registry` — capability discovery and binding.
//!
//! The bind request carries the interface name and version on the wire
//! ahead of the new-id slot, so the serving side can type the object without
//! out-of-band agreement.

use std::sync::Arc;

use parking_lot::Mutex;
use weft_core::{Connection, Interface, MessageDesc, ObjectHandle, SendError, WireValue};

use crate::glue::install_events;

pub const REQ_BIND: u16 = 0;
pub const EVT_ANNOUNCE: u16 = 0;
pub const EVT_WITHDRAW: u16 = 1;

pub static INTERFACE: Interface = Interface {
    name: "weft_registry",
    version: 1,
    requests: &[MessageDesc {
        name: "bind",
        // name, interface, version, then the dynamically-typed new id
        signature: "usun",
        arg_interfaces: &[None, None, None, None],
    }],
    events: &[
        MessageDesc { name: "announce", signature: "usu", arg_interfaces: &[None, None, None] },
        MessageDesc { name: "withdraw", signature: "u", arg_interfaces: &[None] },
    ],
};

#[derive(Default)]
struct RegistryEvents {
    announce: Mutex<Option<Box<dyn FnMut(u32, String, u32) + Send>>>,
    withdraw: Mutex<Option<Box<dyn FnMut(u32) + Send>>>,
}

/// Outbound-role wrapper: observes announcements, binds capabilities.
#[derive(Debug, Clone)]
pub struct Registry {
    handle: ObjectHandle,
}

impl Registry {
    pub fn from_handle(handle: ObjectHandle) -> Registry {
        Registry { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    /// Bind the announced capability `name` as a fresh object speaking
    /// `interface` at `version`.
    pub fn bind(
        &self,
        name: u32,
        interface: &'static Interface,
        version: u32,
    ) -> Result<ObjectHandle, SendError> {
        self.handle.send_constructor(
            REQ_BIND,
            &[
                WireValue::Uint(name),
                WireValue::Str(interface.name.to_owned()),
                WireValue::Uint(version),
            ],
            interface,
            Some(version),
        )
    }

    fn events(&self) -> Arc<RegistryEvents> {
        install_events(&self.handle, INTERFACE.events.len(), |events: &Arc<RegistryEvents>, table| {
            table
                .on(EVT_ANNOUNCE, {
                    let events = events.clone();
                    move |_, args| {
                        if let Some(f) = events.announce.lock().as_mut() {
                            f(args[0].as_uint()?, args[1].as_str()?.to_owned(), args[2].as_uint()?);
                        }
                        Ok(())
                    }
                })
                .on(EVT_WITHDRAW, {
                    let events = events.clone();
                    move |_, args| {
                        if let Some(f) = events.withdraw.lock().as_mut() {
                            f(args[0].as_uint()?);
                        }
                        Ok(())
                    }
                })
        })
    }

    pub fn on_announce(&self, f: impl FnMut(u32, String, u32) + Send + 'static) {
        *self.events().announce.lock() = Some(Box::new(f));
    }

    pub fn on_withdraw(&self, f: impl FnMut(u32) + Send + 'static) {
        *self.events().withdraw.lock() = Some(Box::new(f));
    }
}

#[derive(Default)]
struct RegistryRequests {
    bind: Mutex<Option<Box<dyn FnMut(u32, String, u32, ObjectHandle) + Send>>>,
}

/// Inbound-role wrapper: announces capabilities, serves bind requests.
#[derive(Debug, Clone)]
pub struct RegistryResource {
    handle: ObjectHandle,
}

impl RegistryResource {
    pub fn from_handle(handle: ObjectHandle) -> RegistryResource {
        RegistryResource { handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    fn requests(&self) -> Arc<RegistryRequests> {
        install_events(&self.handle, INTERFACE.requests.len(), |requests: &Arc<RegistryRequests>, table| {
            let requests = requests.clone();
            table.on(REQ_BIND, move |_, args| {
                if let Some(f) = requests.bind.lock().as_mut() {
                    f(
                        args[0].as_uint()?,
                        args[1].as_str()?.to_owned(),
                        args[2].as_uint()?,
                        args[3].as_new_id()?.clone(),
                    );
                }
                Ok(())
            })
        })
    }

    pub fn on_bind(&self, f: impl FnMut(u32, String, u32, ObjectHandle) + Send + 'static) {
        *self.requests().bind.lock() = Some(Box::new(f));
    }

    pub fn announce(&self, name: u32, interface: &str, version: u32) -> Result<(), SendError> {
        self.handle.send(
            EVT_ANNOUNCE,
            &[
                WireValue::Uint(name),
                WireValue::Str(interface.to_owned()),
                WireValue::Uint(version),
            ],
        )
    }

    pub fn withdraw(&self, name: u32) -> Result<(), SendError> {
        self.handle.send(EVT_WITHDRAW, &[WireValue::Uint(name)])
    }

    /// Wire this registry to the connection's capability table: bind
    /// requests route to the advertised capability, and everything
    /// currently advertised is announced to the peer.
    pub fn serve(&self, conn: &Connection) -> Result<(), SendError> {
        let router = conn.clone();
        self.on_bind(move |name, _interface, _version, handle| {
            router.bind_capability(name, handle);
        });
        for (name, capability) in conn.capabilities() {
            self.announce(name, capability.interface().name, capability.version())?;
        }
        Ok(())
    }
}
