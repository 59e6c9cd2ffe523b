//! The connection: transport, object store, queues, and the read handshake.
//!
//! One [`Connection`] owns a unix-socket transport, the object record arena,
//! the pending-message queues, and the capability registry. All state sits
//! behind an `Arc`'d inner so handles and queues can outlive the front-end
//! value.
//!
//! Blocking is cooperative: `dispatch_default`/`dispatch_queue` block only
//! in `poll(2)` or on the queue condvar, never while holding a lock. At most
//! one thread holds read intent at a time; everyone else either drains
//! queues or waits for the reader to finish.
//!
//! Lock ordering: transport before store, loop state before last-error.
//! No path takes the transport lock while holding the store or loop-state
//! lock.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::arg::{WireValue, encode_args};
use crate::dispatch::{dispatch_message, report_failure};
use crate::error::{ConnectionError, PrepareError, SendError};
use crate::global::{Capability, GlobalRegistry};
use crate::interface::Interface;
use crate::object::{ObjectHandle, ObjectId, ObjectStore, Role};
use crate::queue::{EventQueue, PendingQueues, QueueId};
use crate::transport::{WireSocket, poll_readable};
use crate::wire::{RawMessage, encode_message, parse_body, split_frame};

/// The connection root object always has id 1.
const ROOT_ID: ObjectId = ObjectId(1);

/// First id the outbound side allocates (1 is the root).
const CLIENT_ID_BASE: u32 = 2;

/// First id the inbound side allocates; the ranges must not collide.
const SERVER_ID_BASE: u32 = 0xFF00_0000;

/// Queues plus the read-intent flag, under one lock so the dispatch condvar
/// observes both atomically.
struct LoopState {
    queues: PendingQueues,
    reader_active: bool,
}

pub(crate) struct ConnectionInner {
    role: Role,
    fd: RawFd,
    transport: Mutex<WireSocket>,
    pub(crate) store: Mutex<ObjectStore>,
    loop_state: Mutex<LoopState>,
    loop_cond: Condvar,
    last_error: Mutex<Option<ConnectionError>>,
    interfaces: Mutex<HashMap<&'static str, &'static Interface>>,
    globals: Mutex<GlobalRegistry>,
}

impl ConnectionInner {
    pub(crate) fn local_role(&self) -> Role {
        self.role
    }

    pub(crate) fn lookup_interface(&self, name: &str) -> Option<&'static Interface> {
        self.interfaces.lock().get(name).copied()
    }

    /// Record the first fatal error and wake every parked dispatcher.
    pub(crate) fn poison(&self, err: ConnectionError) {
        {
            let mut slot = self.last_error.lock();
            if slot.is_none() {
                warn!(error = %err, "connection poisoned");
                *slot = Some(err);
            }
        }
        drop(self.loop_state.lock());
        self.loop_cond.notify_all();
    }

    fn check_live(&self) -> Result<(), ConnectionError> {
        if self.last_error.lock().is_some() {
            return Err(ConnectionError::Defunct);
        }
        Ok(())
    }

    /// Encode and queue one outgoing message, then push opportunistically.
    pub(crate) fn send_values(
        &self,
        id: ObjectId,
        opcode: u16,
        desc: &'static crate::interface::MessageDesc,
        values: &[WireValue],
    ) -> Result<(), SendError> {
        self.check_live()?;
        let raw = encode_args(desc, values)?;

        let mut frame = BytesMut::new();
        let mut fds = Vec::new();
        encode_message(id, opcode, desc, &raw, &mut frame, &mut fds)?;

        trace!(id = id.0, message = desc.name, opcode, bytes = frame.len(), "send");
        let mut transport = self.transport.lock();
        transport.queue(&frame, &fds).map_err(|e| self.fatalize(e))?;
        match transport.flush() {
            Ok(()) | Err(ConnectionError::Again) => Ok(()),
            Err(e) => Err(self.fatalize(e).into()),
        }
    }

    /// Poison on fatal errors, pass retry conditions through.
    fn fatalize(&self, err: ConnectionError) -> ConnectionError {
        if err.is_fatal() {
            self.poison(err.clone());
        }
        err
    }

    pub(crate) fn retire_queue(&self, queue: QueueId) {
        self.loop_state.lock().queues.retire(queue);
        self.loop_cond.notify_all();
    }

    fn prepare_read(&self, queue: QueueId) -> Result<(), PrepareError> {
        if self.check_live().is_err() {
            let stored = self.last_error.lock().clone().unwrap_or(ConnectionError::Defunct);
            return Err(PrepareError::Defunct(stored));
        }
        let mut state = self.loop_state.lock();
        if !state.queues.is_empty(queue) {
            return Err(PrepareError::QueuePending);
        }
        if state.reader_active {
            return Err(PrepareError::ReadInProgress);
        }
        state.reader_active = true;
        trace!(%queue, "read intent acquired");
        Ok(())
    }

    fn cancel_read(&self) {
        let mut state = self.loop_state.lock();
        state.reader_active = false;
        drop(state);
        self.loop_cond.notify_all();
        trace!("read intent cancelled");
    }

    /// Pull bytes off the socket, frame them, and distribute messages to
    /// their queues. Clears the read intent regardless of outcome.
    fn read_events(&self) -> Result<(), ConnectionError> {
        {
            let state = self.loop_state.lock();
            if !state.reader_active {
                return Err(ConnectionError::InvariantViolated(
                    "read_events without prepared read intent",
                ));
            }
        }

        let result = self.read_and_frame();
        match result {
            Ok(batch) => {
                let mut state = self.loop_state.lock();
                for (queue, msg) in batch {
                    state.queues.push(queue, msg);
                }
                state.reader_active = false;
                drop(state);
                self.loop_cond.notify_all();
                Ok(())
            }
            Err(e) => {
                self.cancel_read();
                Err(self.fatalize(e))
            }
        }
    }

    fn read_and_frame(&self) -> Result<Vec<(QueueId, RawMessage)>, ConnectionError> {
        let mut transport = self.transport.lock();
        loop {
            match transport.fill() {
                Ok(_) => continue,
                Err(ConnectionError::Again) => break,
                Err(e) => return Err(e),
            }
        }

        let mut batch = Vec::new();
        loop {
            let frame = match split_frame(&mut transport.inbound) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "unrecoverable frame header, stream desynchronized");
                    return Err(ConnectionError::Io(io::ErrorKind::InvalidData));
                }
            };

            let target = {
                let store = self.store.lock();
                store.get(frame.object_id).map(|rec| (rec.interface, rec.queue))
            };
            let Some((interface, queue)) = target else {
                warn!(id = frame.object_id.0, opcode = frame.opcode, "message for unknown object dropped");
                continue;
            };
            let Some(desc) = interface.message(self.role.incoming(), frame.opcode) else {
                warn!(
                    id = frame.object_id.0,
                    interface = interface.name,
                    opcode = frame.opcode,
                    "message with unknown opcode dropped"
                );
                continue;
            };
            match parse_body(desc, &frame.body, &mut transport.in_fds) {
                Ok(args) => batch.push((
                    queue,
                    RawMessage { object_id: frame.object_id, opcode: frame.opcode, args },
                )),
                Err(e) => {
                    warn!(id = frame.object_id.0, message = desc.name, error = %e, "malformed message body dropped");
                }
            }
        }
        Ok(batch)
    }

    fn flush(&self) -> Result<(), ConnectionError> {
        self.check_live()?;
        match self.transport.lock().flush() {
            Ok(()) => Ok(()),
            Err(ConnectionError::Again) => Err(ConnectionError::Again),
            Err(e) => Err(self.fatalize(e)),
        }
    }

    /// Drain one queue without blocking; returns the number of messages
    /// taken off the queue (failed messages are reported and count as
    /// progress).
    fn dispatch_queue_pending(conn: &Arc<ConnectionInner>, queue: QueueId) -> usize {
        let mut count = 0usize;
        loop {
            let msg = match conn.loop_state.lock().queues.pop(queue) {
                Some(msg) => msg,
                None => break,
            };
            count += 1;
            if let Err(e) = dispatch_message(conn, &msg) {
                report_failure(&msg, &e);
            }
        }
        count
    }

    /// Block until at least one message on `queue` was dispatched or the
    /// connection dies.
    fn dispatch_queue(conn: &Arc<ConnectionInner>, queue: QueueId) -> Result<usize, ConnectionError> {
        loop {
            let n = ConnectionInner::dispatch_queue_pending(conn, queue);
            if n > 0 {
                return Ok(n);
            }
            conn.check_live()?;

            match conn.prepare_read(queue) {
                Ok(()) => {
                    // Push queued output before sleeping so the peer is not
                    // deadlocked waiting for our requests.
                    match conn.flush() {
                        Ok(()) | Err(ConnectionError::Again) => {}
                        Err(e) => {
                            conn.cancel_read();
                            return Err(e);
                        }
                    }
                    if let Err(e) = poll_readable(conn.fd, None) {
                        conn.cancel_read();
                        return Err(conn.fatalize(e.into()));
                    }
                    conn.read_events()?;
                }
                Err(PrepareError::QueuePending) => continue,
                Err(PrepareError::ReadInProgress) => {
                    let mut state = conn.loop_state.lock();
                    while state.reader_active
                        && state.queues.is_empty(queue)
                        && conn.last_error.lock().is_none()
                    {
                        conn.loop_cond.wait(&mut state);
                    }
                }
                Err(PrepareError::Defunct(e)) => return Err(e),
            }
        }
    }
}

/// One end of a wire-object connection.
///
/// Cheap to clone: all state lives behind a shared inner. The clone holds
/// its own owning reference to the root object.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
    root: ObjectHandle,
}

impl Connection {
    /// Connect to a serving peer over the unix socket at `path`.
    pub fn connect(path: impl AsRef<Path>, root_interface: &'static Interface) -> io::Result<Connection> {
        Connection::from_stream(UnixStream::connect(path.as_ref())?, Role::Outbound, root_interface)
    }

    /// Wrap an already-connected stream. `Role::Outbound` is the side that
    /// issues requests; `Role::Inbound` the side that serves them.
    pub fn from_stream(
        stream: UnixStream,
        role: Role,
        root_interface: &'static Interface,
    ) -> io::Result<Connection> {
        let transport = WireSocket::new(stream)?;
        let fd = transport.raw_fd();
        let first_id = match role {
            Role::Outbound => CLIENT_ID_BASE,
            Role::Inbound => SERVER_ID_BASE,
        };
        let inner = Arc::new(ConnectionInner {
            role,
            fd,
            transport: Mutex::new(transport),
            store: Mutex::new(ObjectStore::new(first_id)),
            loop_state: Mutex::new(LoopState { queues: PendingQueues::new(), reader_active: false }),
            loop_cond: Condvar::new(),
            last_error: Mutex::new(None),
            interfaces: Mutex::new(HashMap::new()),
            globals: Mutex::new(GlobalRegistry::new()),
        });
        inner.interfaces.lock().insert(root_interface.name, root_interface);

        let root = ObjectHandle::attach_root(inner.clone(), ROOT_ID, root_interface, role);
        debug!(role = ?role, "connection established");
        Ok(Connection { inner, root })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Raw descriptor, for integrating with an external poll loop.
    pub fn connection_fd(&self) -> RawFd {
        self.inner.fd
    }

    /// Owning handle over the connection root object (never destroyed on
    /// release).
    pub fn root(&self) -> ObjectHandle {
        self.root.clone()
    }

    /// The explicitly-empty handle for `?o` arguments.
    pub fn null_handle(&self) -> ObjectHandle {
        ObjectHandle::null(self.inner.clone())
    }

    /// Owning handle over `id`, creating the record on first attach.
    /// Subsequent attaches to the same id share the record and raise its
    /// count.
    pub fn attach(
        &self,
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
    ) -> ObjectHandle {
        ObjectHandle::attach_owning(self.inner.clone(), id, interface, version, self.inner.role)
    }

    /// Make an interface resolvable for dynamically-typed new-id arguments.
    pub fn register_interface(&self, interface: &'static Interface) {
        self.inner.interfaces.lock().insert(interface.name, interface);
    }

    pub fn register_interfaces(&self, interfaces: &[&'static Interface]) {
        let mut map = self.inner.interfaces.lock();
        for interface in interfaces {
            map.insert(interface.name, interface);
        }
    }

    /// The first fatal error this connection hit, if any.
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.inner.last_error.lock().clone()
    }

    /// Push queued output. `Err(Again)` means the kernel buffer is full;
    /// poll the descriptor writable and retry.
    pub fn flush(&self) -> Result<(), ConnectionError> {
        self.inner.flush()
    }

    /// Announce intent to read on behalf of `queue`.
    ///
    /// Fails retryably while the queue holds undispatched messages or
    /// another thread already holds the intent. On success the caller must
    /// follow up with [`read_events`](Connection::read_events) or
    /// [`cancel_read`](Connection::cancel_read).
    pub fn prepare_read(&self, queue: QueueId) -> Result<(), PrepareError> {
        self.inner.prepare_read(queue)
    }

    /// Read available messages off the socket and distribute them to their
    /// queues. Consumes the read intent.
    pub fn read_events(&self) -> Result<(), ConnectionError> {
        self.inner.read_events()
    }

    /// Give up the read intent without reading.
    pub fn cancel_read(&self) {
        self.inner.cancel_read()
    }

    /// Dispatch pending messages on the default queue, blocking until at
    /// least one was processed.
    pub fn dispatch_default(&self) -> Result<usize, ConnectionError> {
        ConnectionInner::dispatch_queue(&self.inner, QueueId::DEFAULT)
    }

    /// Dispatch pending messages on `queue`, blocking until at least one
    /// was processed.
    pub fn dispatch_queue(&self, queue: QueueId) -> Result<usize, ConnectionError> {
        ConnectionInner::dispatch_queue(&self.inner, queue)
    }

    /// Drain the default queue without blocking or reading.
    pub fn dispatch_pending(&self) -> usize {
        ConnectionInner::dispatch_queue_pending(&self.inner, QueueId::DEFAULT)
    }

    /// Drain `queue` without blocking or reading.
    pub fn dispatch_queue_pending(&self, queue: QueueId) -> usize {
        ConnectionInner::dispatch_queue_pending(&self.inner, queue)
    }

    /// Create an auxiliary event queue.
    pub fn create_queue(&self) -> EventQueue {
        let id = self.inner.loop_state.lock().queues.create();
        EventQueue::new(self.inner.clone(), id)
    }

    /// Advertise a capability; returns its registry name.
    pub fn advertise(&self, capability: Arc<dyn Capability>) -> u32 {
        let interface = capability.interface();
        self.register_interface(interface);
        let name = self.inner.globals.lock().advertise(capability);
        debug!(name, interface = interface.name, "capability advertised");
        name
    }

    /// Withdraw an advertised capability. Names are never reused.
    pub fn withdraw(&self, name: u32) -> bool {
        self.inner.globals.lock().withdraw(name).is_some()
    }

    /// Snapshot of advertised capabilities, ordered by name.
    pub fn capabilities(&self) -> Vec<(u32, Arc<dyn Capability>)> {
        self.inner.globals.lock().entries()
    }

    /// Route a freshly bound object to the capability advertised under
    /// `name`. Binding an unknown or withdrawn name is reported and
    /// ignored, never an error.
    pub fn bind_capability(&self, name: u32, handle: ObjectHandle) {
        match self.inner.globals.lock().get(name) {
            Some(capability) => capability.bind(handle),
            None => warn!(name, "bind for unknown capability name dropped"),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("fd", &self.inner.fd)
            .finish_non_exhaustive()
    }
}
