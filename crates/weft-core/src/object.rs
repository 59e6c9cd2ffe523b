//! The shared object store and reference-counted handles.
//!
//! One [`ObjectRecord`] exists per native object id, held in an arena keyed
//! by id; every live [`ObjectHandle`] for that id shares the record. The
//! record is created by the first handle construction for an id
//! (insert-if-absent) and destroyed exactly once, when the reference count
//! first reaches zero.
//!
//! The count tracks owning handles only: cloning an owning handle
//! increments it, dropping one decrements it, moves never touch it.
//! Non-owning handles observe without ever destroying; the connection root
//! never destroys the native object on release.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::arg::WireValue;
use crate::connection::ConnectionInner;
use crate::dispatch::HandlerTable;
use crate::error::{ConnectionError, SendError};
use crate::interface::{Direction, Interface};
use crate::queue::QueueId;

/// A native protocol object id. Id 0 is the null object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

impl ObjectId {
    pub const NULL: ObjectId = ObjectId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the message flow a handle represents.
///
/// An outbound handle issues requests and receives events (a proxy); an
/// inbound handle receives requests and issues events (a resource). The two
/// roles are structurally identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Outbound,
    Inbound,
}

impl Role {
    /// Direction of messages this role sends.
    pub(crate) fn outgoing(self) -> Direction {
        match self {
            Role::Outbound => Direction::Request,
            Role::Inbound => Direction::Event,
        }
    }

    /// Direction of messages this role receives.
    pub(crate) fn incoming(self) -> Direction {
        match self {
            Role::Outbound => Direction::Event,
            Role::Inbound => Direction::Request,
        }
    }
}

/// The single shared record for one native object id.
pub(crate) struct ObjectRecord {
    /// Number of live owning handles. Never negative; the record is freed
    /// the first time this reaches zero.
    pub refcount: u32,
    pub interface: &'static Interface,
    pub version: u32,
    /// Installed at most once, first writer wins.
    pub handlers: Option<Arc<HandlerTable>>,
    /// Request opcode emitted when the last owning handle drops, if the
    /// interface declares an explicit destructor.
    pub destroy_opcode: Option<u16>,
    /// Opaque payload attached by higher layers.
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
    pub queue: QueueId,
}

impl ObjectRecord {
    fn new(interface: &'static Interface, version: u32) -> ObjectRecord {
        ObjectRecord {
            refcount: 0,
            interface,
            version,
            handlers: None,
            destroy_opcode: None,
            user_data: None,
            queue: QueueId::DEFAULT,
        }
    }
}

/// Arena of object records, keyed by native id.
pub(crate) struct ObjectStore {
    records: HashMap<ObjectId, ObjectRecord>,
    /// Released local ids, reused before fresh allocation.
    free: Vec<u32>,
    next_id: u32,
}

impl ObjectStore {
    /// `first_id` is the start of this side's id allocation range.
    pub fn new(first_id: u32) -> ObjectStore {
        ObjectStore { records: HashMap::new(), free: Vec::new(), next_id: first_id }
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjectRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut ObjectRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.records.contains_key(&id)
    }

    /// Insert-if-absent: the first handle construction for an id creates the
    /// record with reference count 0, before the first increment.
    pub fn ensure(
        &mut self,
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
    ) -> &mut ObjectRecord {
        self.records.entry(id).or_insert_with(|| ObjectRecord::new(interface, version))
    }

    /// Insert a record for a peer-chosen id; fails if the id is live.
    pub fn insert_new(
        &mut self,
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
    ) -> bool {
        if self.records.contains_key(&id) {
            return false;
        }
        self.records.insert(id, ObjectRecord::new(interface, version));
        true
    }

    /// Allocate a fresh local id and its record.
    pub fn allocate(&mut self, interface: &'static Interface, version: u32) -> ObjectId {
        let id = loop {
            let candidate = match self.free.pop() {
                Some(n) => n,
                None => {
                    let n = self.next_id;
                    self.next_id += 1;
                    n
                }
            };
            if !self.records.contains_key(&ObjectId(candidate)) {
                break ObjectId(candidate);
            }
        };
        self.records.insert(id, ObjectRecord::new(interface, version));
        id
    }

    /// Drop the record and mark the id reusable.
    pub fn release(&mut self, id: ObjectId) {
        if self.records.remove(&id).is_some() {
            self.free.push(id.0);
        }
    }

}

/// Reference-counted front end over an [`ObjectRecord`].
pub struct ObjectHandle {
    conn: Arc<ConnectionInner>,
    id: ObjectId,
    interface: Option<&'static Interface>,
    role: Role,
    /// The connection root never destroys the native object on release.
    root: bool,
    /// Observes the object without owning it; never touches the count.
    non_owning: bool,
}

impl ObjectHandle {
    /// The explicitly-empty handle (id 0).
    pub(crate) fn null(conn: Arc<ConnectionInner>) -> ObjectHandle {
        ObjectHandle {
            conn,
            id: ObjectId::NULL,
            interface: None,
            role: Role::Outbound,
            root: false,
            non_owning: true,
        }
    }

    /// Owning handle over an existing or fresh record; seeds the count to 0
    /// on first construction, then increments.
    pub(crate) fn attach_owning(
        conn: Arc<ConnectionInner>,
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
        role: Role,
    ) -> ObjectHandle {
        {
            let mut store = conn.store.lock();
            let rec = store.ensure(id, interface, version);
            rec.refcount += 1;
        }
        ObjectHandle { conn, id, interface: Some(interface), role, root: false, non_owning: false }
    }

    /// Owning handle for a peer-allocated new-id; `None` when the id is
    /// already live.
    pub(crate) fn attach_new(
        conn: Arc<ConnectionInner>,
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
        role: Role,
    ) -> Option<ObjectHandle> {
        {
            let mut store = conn.store.lock();
            if !store.insert_new(id, interface, version) {
                return None;
            }
            store.get_mut(id).map(|rec| rec.refcount += 1);
        }
        trace!(id = id.0, interface = interface.name, "object materialized from new-id");
        Some(ObjectHandle {
            conn,
            id,
            interface: Some(interface),
            role,
            root: false,
            non_owning: false,
        })
    }

    /// Non-owning handle over whatever record the id currently has.
    pub(crate) fn attach_non_owning(
        conn: Arc<ConnectionInner>,
        id: ObjectId,
        role: Role,
    ) -> ObjectHandle {
        let interface = conn.store.lock().get(id).map(|rec| rec.interface);
        ObjectHandle { conn, id, interface, role, root: false, non_owning: true }
    }

    /// Allocate a fresh local object (used when a request creates one).
    pub(crate) fn create_local(
        conn: Arc<ConnectionInner>,
        interface: &'static Interface,
        version: u32,
        role: Role,
    ) -> ObjectHandle {
        let id = {
            let mut store = conn.store.lock();
            let id = store.allocate(interface, version);
            store.get_mut(id).map(|rec| rec.refcount += 1);
            id
        };
        trace!(id = id.0, interface = interface.name, "object allocated");
        ObjectHandle { conn, id, interface: Some(interface), role, root: false, non_owning: false }
    }

    /// Owning handle over the connection root object.
    pub(crate) fn attach_root(
        conn: Arc<ConnectionInner>,
        id: ObjectId,
        interface: &'static Interface,
        role: Role,
    ) -> ObjectHandle {
        let mut handle = ObjectHandle::attach_owning(conn, id, interface, interface.version, role);
        handle.root = true;
        handle
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The explicitly-empty handle on the same connection, for nullable
    /// object arguments.
    pub fn null_handle(&self) -> ObjectHandle {
        ObjectHandle::null(self.conn.clone())
    }

    pub fn is_null(&self) -> bool {
        self.id.is_null()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn interface(&self) -> Option<&'static Interface> {
        self.interface
    }

    /// Interface version the object was created at.
    pub fn version(&self) -> Option<u32> {
        self.conn.store.lock().get(self.id).map(|rec| rec.version)
    }

    /// Number of live owning handles sharing this record (0 when the record
    /// is gone or the handle is null).
    pub fn ref_count(&self) -> u32 {
        self.conn.store.lock().get(self.id).map_or(0, |rec| rec.refcount)
    }

    /// Install the callback table. At most one table is ever installed; a
    /// second attempt is a no-op and returns false.
    pub fn set_handlers(&self, table: HandlerTable) -> bool {
        let mut store = self.conn.store.lock();
        match store.get_mut(self.id) {
            Some(rec) if rec.handlers.is_none() => {
                rec.handlers = Some(Arc::new(table));
                true
            }
            _ => false,
        }
    }

    /// Opaque state stashed alongside the installed callback table.
    pub fn handler_state(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        let store = self.conn.store.lock();
        store.get(self.id).and_then(|rec| rec.handlers.as_ref()).and_then(|t| t.state())
    }

    /// Request opcode emitted when the last owning handle drops.
    pub fn set_destroy_opcode(&self, opcode: Option<u16>) {
        if let Some(rec) = self.conn.store.lock().get_mut(self.id) {
            rec.destroy_opcode = opcode;
        }
    }

    pub fn set_user_data(&self, data: Arc<dyn Any + Send + Sync>) {
        if let Some(rec) = self.conn.store.lock().get_mut(self.id) {
            rec.user_data = Some(data);
        }
    }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.conn.store.lock().get(self.id).and_then(|rec| rec.user_data.clone())
    }

    /// Route this object's incoming messages to `queue`.
    pub fn assign_queue(&self, queue: &crate::queue::EventQueue) {
        if let Some(rec) = self.conn.store.lock().get_mut(self.id) {
            rec.queue = queue.id();
        }
    }

    /// Emit a message carrying no new-id argument.
    pub fn send(&self, opcode: u16, values: &[WireValue]) -> Result<(), SendError> {
        let interface = match self.interface {
            Some(i) => i,
            None => return Err(SendError::Connection(ConnectionError::InvariantViolated(
                "send through an interface-less handle",
            ))),
        };
        let desc = interface
            .message(self.role.outgoing(), opcode)
            .ok_or(SendError::Connection(ConnectionError::InvariantViolated(
                "send with an opcode outside the interface",
            )))?;
        self.conn.send_values(self.id, opcode, desc, values)?;
        Ok(())
    }

    /// Emit a message that creates a new object, returning its owning
    /// handle. `values` lists every argument except the new-id slot, in
    /// declaration order; the runtime fills that slot in.
    ///
    /// `version` must be given for dynamically-typed new-id slots and is
    /// ignored for static ones (the new object inherits this object's
    /// version, per contract).
    pub fn send_constructor(
        &self,
        opcode: u16,
        values: &[WireValue],
        interface: &'static Interface,
        version: Option<u32>,
    ) -> Result<ObjectHandle, SendError> {
        let own_iface = match self.interface {
            Some(i) => i,
            None => return Err(SendError::Connection(ConnectionError::InvariantViolated(
                "send through an interface-less handle",
            ))),
        };
        let desc = own_iface
            .message(self.role.outgoing(), opcode)
            .ok_or(SendError::Connection(ConnectionError::InvariantViolated(
                "send with an opcode outside the interface",
            )))?;

        let new_version = match version {
            Some(v) => v,
            None => self.version().unwrap_or(1),
        };
        let handle =
            ObjectHandle::create_local(self.conn.clone(), interface, new_version, self.role);

        // Splice the new-id slot into the caller-supplied arguments.
        let mut full = Vec::with_capacity(values.len() + 1);
        let mut rest = values.iter();
        for spec in desc.args() {
            match spec {
                Ok(s) if s.kind == crate::interface::ArgKind::NewId => {
                    full.push(WireValue::NewId(handle.clone()));
                }
                _ => {
                    if let Some(v) = rest.next() {
                        full.push(v.clone());
                    }
                }
            }
        }

        self.conn.send_values(self.id, opcode, desc, &full)?;
        Ok(handle)
    }
}

impl Clone for ObjectHandle {
    fn clone(&self) -> ObjectHandle {
        if !self.id.is_null() && !self.non_owning {
            if let Some(rec) = self.conn.store.lock().get_mut(self.id) {
                rec.refcount += 1;
            }
        }
        ObjectHandle {
            conn: self.conn.clone(),
            id: self.id,
            interface: self.interface,
            role: self.role,
            root: self.root,
            non_owning: self.non_owning,
        }
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        if self.id.is_null() || self.non_owning {
            return;
        }
        let destroy = {
            let mut store = self.conn.store.lock();
            let Some(rec) = store.get_mut(self.id) else {
                error!(id = self.id.0, "owning handle dropped after its record was destroyed");
                self.conn.poison(ConnectionError::InvariantViolated(
                    "owning handle outlived its object record",
                ));
                return;
            };
            rec.refcount = rec.refcount.saturating_sub(1);
            if rec.refcount > 0 || self.root {
                return;
            }
            rec.destroy_opcode
        };
        if let Some(opcode) = destroy {
            if let Some(desc) =
                self.interface.and_then(|i| i.message(self.role.outgoing(), opcode))
            {
                if let Err(e) = self.conn.send_values(self.id, opcode, desc, &[]) {
                    debug!(id = self.id.0, error = %e, "destroy request not sent");
                }
            }
        }
        self.conn.store.lock().release(self.id);
        debug!(id = self.id.0, "last owning handle dropped, object released");
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &ObjectHandle) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.conn, &other.conn)
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.id.0)
            .field("interface", &self.interface.map(|i| i.name))
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static THING: Interface =
        Interface { name: "thing", version: 1, requests: &[], events: &[] };

    #[test]
    fn store_insert_if_absent() {
        let mut store = ObjectStore::new(2);
        let rec = store.ensure(ObjectId(7), &THING, 1);
        assert_eq!(rec.refcount, 0);
        rec.refcount = 3;
        // second ensure reuses the record
        assert_eq!(store.ensure(ObjectId(7), &THING, 1).refcount, 3);
    }

    #[test]
    fn store_allocates_fresh_ids() {
        let mut store = ObjectStore::new(2);
        let a = store.allocate(&THING, 1);
        let b = store.allocate(&THING, 1);
        assert_ne!(a, b);
        assert!(store.contains(a));
        assert!(store.contains(b));
    }

    #[test]
    fn released_ids_are_reused() {
        let mut store = ObjectStore::new(2);
        let a = store.allocate(&THING, 1);
        store.release(a);
        assert!(!store.contains(a));
        let b = store.allocate(&THING, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn insert_new_rejects_live_ids() {
        let mut store = ObjectStore::new(2);
        assert!(store.insert_new(ObjectId(9), &THING, 1));
        assert!(!store.insert_new(ObjectId(9), &THING, 1));
    }
}
