//! Opcode-indexed dispatch into data-driven handler tables.
//!
//! The opcode-to-slot mapping is data, not generated switch statements: a
//! [`HandlerTable`] is an array of optional callback entries, indexed by the
//! message's position in the interface declaration. Generated glue populates
//! the slots it cares about; an unpopulated slot is a documented no-op.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::arg::{WireValue, decode_args};
use crate::connection::ConnectionInner;
use crate::error::DispatchError;
use crate::object::ObjectHandle;
use crate::wire::RawMessage;

/// One callback slot: receives the target handle and the decoded arguments.
pub type HandlerFn =
    Box<dyn FnMut(&ObjectHandle, &[WireValue]) -> Result<(), DispatchError> + Send>;

/// Per-object callback table, installed at most once via
/// [`ObjectHandle::set_handlers`].
pub struct HandlerTable {
    /// Opaque per-table state (generated glue stashes its event-closure
    /// struct here so later wrappers over the same object can reach it).
    state: Option<Arc<dyn Any + Send + Sync>>,
    slots: Vec<Option<Mutex<HandlerFn>>>,
}

impl HandlerTable {
    /// A table with `len` empty slots.
    pub fn new(len: usize) -> HandlerTable {
        HandlerTable { state: None, slots: (0..len).map(|_| None).collect() }
    }

    pub fn with_state(len: usize, state: Arc<dyn Any + Send + Sync>) -> HandlerTable {
        HandlerTable { state: Some(state), slots: (0..len).map(|_| None).collect() }
    }

    /// Populate the slot at `opcode`. Slots outside the declared range are
    /// ignored.
    pub fn on(
        mut self,
        opcode: u16,
        f: impl FnMut(&ObjectHandle, &[WireValue]) -> Result<(), DispatchError> + Send + 'static,
    ) -> Self {
        if let Some(slot) = self.slots.get_mut(opcode as usize) {
            *slot = Some(Mutex::new(Box::new(f)));
        }
        self
    }

    pub fn state(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.state.clone()
    }

    /// Invoke the slot at `opcode`; Ok(false) when the slot is unpopulated.
    pub(crate) fn invoke(
        &self,
        opcode: u16,
        target: &ObjectHandle,
        args: &[WireValue],
    ) -> Result<bool, DispatchError> {
        match self.slots.get(opcode as usize).and_then(|s| s.as_ref()) {
            Some(slot) => {
                (slot.lock())(target, args)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Decode one queued message and route it to its callback slot.
///
/// Identity errors (no live record for the target id) and decode errors
/// abort this message only; the caller reports them and carries on.
pub(crate) fn dispatch_message(
    conn: &Arc<ConnectionInner>,
    msg: &RawMessage,
) -> Result<(), DispatchError> {
    let (interface, version, handlers) = {
        let store = conn.store.lock();
        let rec = store
            .get(msg.object_id)
            .ok_or(DispatchError::UnknownObject(msg.object_id))?;
        (rec.interface, rec.version, rec.handlers.clone())
    };

    let direction = conn.local_role().incoming();
    let desc = interface
        .message(direction, msg.opcode)
        .ok_or(DispatchError::BadOpcode { interface: interface.name, opcode: msg.opcode })?;

    let values = decode_args(conn, desc, &msg.args, version)?;
    let target = ObjectHandle::attach_non_owning(conn.clone(), msg.object_id, conn.local_role());

    trace!(
        id = msg.object_id.0,
        interface = interface.name,
        message = desc.name,
        opcode = msg.opcode,
        "dispatch"
    );

    match handlers {
        Some(table) => {
            if !table.invoke(msg.opcode, &target, &values)? {
                trace!(message = desc.name, "slot unpopulated, dropped");
            }
        }
        None => trace!(message = desc.name, "no handler table installed, dropped"),
    }
    Ok(())
}

/// Report a dispatch failure at the severity its taxonomy calls for.
pub(crate) fn report_failure(msg: &RawMessage, err: &DispatchError) {
    warn!(
        id = msg.object_id.0,
        opcode = msg.opcode,
        error = %err,
        "message dropped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn unpopulated_slot_is_a_noop() {
        let table = HandlerTable::new(3);
        // no connection needed to check slot bookkeeping
        assert!(table.slots.iter().all(|s| s.is_none()));
    }

    #[test]
    fn slots_index_by_opcode() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let table = HandlerTable::new(2).on(1, move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(table.slots[0].is_none());
        assert!(table.slots[1].is_some());
    }

    #[test]
    fn out_of_range_slot_is_ignored() {
        let table = HandlerTable::new(1).on(5, |_, _| Ok(()));
        assert_eq!(table.slots.len(), 1);
        assert!(table.slots[0].is_none());
    }
}
