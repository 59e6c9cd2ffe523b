//! Named capability registry.
//!
//! The serving side advertises capabilities under small integer names; the
//! peer binds a name to instantiate a fresh object speaking the capability's
//! interface. Binding an unknown or withdrawn name is reported and ignored,
//! never fatal.

use std::collections::HashMap;
use std::sync::Arc;

use crate::interface::Interface;
use crate::object::ObjectHandle;

/// One advertised capability.
///
/// Implementations hold whatever backing state the capability needs (a
/// buffer pool, an output, ...) and wire up handler tables for each object
/// bound against them.
pub trait Capability: Send + Sync {
    /// The interface objects bound to this capability will speak.
    fn interface(&self) -> &'static Interface;

    /// Highest version this capability serves. Defaults to the interface's
    /// declared version.
    fn version(&self) -> u32 {
        self.interface().version
    }

    /// Called with the freshly created object each time a peer binds this
    /// capability. The default implementation drops the handle, releasing
    /// the object again immediately.
    fn bind(&self, handle: ObjectHandle) {
        let _ = handle;
    }
}

/// Capability table keyed by advertised name.
pub(crate) struct GlobalRegistry {
    entries: HashMap<u32, Arc<dyn Capability>>,
    next_name: u32,
}

impl GlobalRegistry {
    pub(crate) fn new() -> GlobalRegistry {
        GlobalRegistry { entries: HashMap::new(), next_name: 1 }
    }

    /// Insert a capability under a fresh name and return it.
    pub(crate) fn advertise(&mut self, capability: Arc<dyn Capability>) -> u32 {
        let name = self.next_name;
        self.next_name += 1;
        self.entries.insert(name, capability);
        name
    }

    /// Withdraw a capability; names are never reused.
    pub(crate) fn withdraw(&mut self, name: u32) -> Option<Arc<dyn Capability>> {
        self.entries.remove(&name)
    }

    pub(crate) fn get(&self, name: u32) -> Option<Arc<dyn Capability>> {
        self.entries.get(&name).cloned()
    }

    /// Snapshot for announcing the current set to a new observer.
    pub(crate) fn entries(&self) -> Vec<(u32, Arc<dyn Capability>)> {
        let mut out: Vec<_> = self.entries.iter().map(|(n, c)| (*n, c.clone())).collect();
        out.sort_by_key(|(n, _)| *n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::Interface;

    static IFACE: Interface =
        Interface { name: "test_output", version: 2, requests: &[], events: &[] };

    struct Stub;
    impl Capability for Stub {
        fn interface(&self) -> &'static Interface {
            &IFACE
        }
    }

    #[test]
    fn names_are_unique_and_never_reused() {
        let mut reg = GlobalRegistry::new();
        let a = reg.advertise(Arc::new(Stub));
        let b = reg.advertise(Arc::new(Stub));
        assert_ne!(a, b);
        reg.withdraw(a);
        let c = reg.advertise(Arc::new(Stub));
        assert_ne!(c, a);
        assert!(reg.get(a).is_none());
        assert!(reg.get(b).is_some());
        assert!(reg.get(c).is_some());
    }

    #[test]
    fn default_version_comes_from_the_interface() {
        assert_eq!(Stub.version(), 2);
    }

    #[test]
    fn default_bind_drops_its_handle() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let conn =
            crate::connection::Connection::from_stream(a, crate::object::Role::Inbound, &IFACE)
                .unwrap();
        let handle = conn.attach(crate::object::ObjectId(9), &IFACE, 1);
        Stub.bind(handle.clone());
        // only the copy given to bind was released
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn entries_snapshot_is_ordered() {
        let mut reg = GlobalRegistry::new();
        let a = reg.advertise(Arc::new(Stub));
        let b = reg.advertise(Arc::new(Stub));
        let names: Vec<u32> = reg.entries().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec![a, b]);
    }
}
