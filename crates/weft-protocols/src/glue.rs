//! Shared plumbing for the generated-shaped wrappers.

use std::sync::Arc;

use weft_core::{HandlerTable, ObjectHandle};

/// Fetch the object's event-closure struct, installing the handler table on
/// first use.
///
/// The table is installed at most once per object (first writer wins); a
/// wrapper that loses the race reads the winner's state back so every clone
/// mutates the same closure set.
pub(crate) fn install_events<T, F>(handle: &ObjectHandle, slots: usize, wire: F) -> Arc<T>
where
    T: Default + Send + Sync + 'static,
    F: FnOnce(&Arc<T>, HandlerTable) -> HandlerTable,
{
    if let Some(state) = handle.handler_state() {
        if let Ok(events) = state.downcast::<T>() {
            return events;
        }
    }
    let events = Arc::new(T::default());
    let table = wire(&events, HandlerTable::with_state(slots, events.clone()));
    if handle.set_handlers(table) {
        events
    } else {
        handle
            .handler_state()
            .and_then(|state| state.downcast::<T>().ok())
            .unwrap_or(events)
    }
}
