//! Event queues: per-connection buckets of undispatched messages.
//!
//! Every connection owns a default queue; additional queues let a thread
//! dispatch a subset of objects without racing the main loop. Objects are
//! assigned to queues, messages land on the queue their target object is
//! assigned to, and dispatch drains one queue at a time.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::connection::ConnectionInner;
use crate::wire::RawMessage;

/// Identifies one event queue within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub(crate) u32);

impl QueueId {
    /// Every connection's built-in queue.
    pub const DEFAULT: QueueId = QueueId(0);
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue#{}", self.0)
    }
}

/// All pending messages of a connection, bucketed by queue.
///
/// Lives behind the connection's queue lock together with the condvar that
/// wakes threads parked in queue-scoped dispatch.
pub(crate) struct PendingQueues {
    buckets: HashMap<QueueId, VecDeque<RawMessage>>,
    next: u32,
}

impl PendingQueues {
    pub(crate) fn new() -> PendingQueues {
        let mut buckets = HashMap::new();
        buckets.insert(QueueId::DEFAULT, VecDeque::new());
        PendingQueues { buckets, next: 1 }
    }

    pub(crate) fn create(&mut self) -> QueueId {
        let id = QueueId(self.next);
        self.next += 1;
        self.buckets.insert(id, VecDeque::new());
        id
    }

    /// Push a message on its queue. A message assigned to a retired queue
    /// falls back to the default queue rather than vanishing.
    pub(crate) fn push(&mut self, queue: QueueId, msg: RawMessage) {
        match self.buckets.get_mut(&queue) {
            Some(bucket) => bucket.push_back(msg),
            None => {
                if let Some(default) = self.buckets.get_mut(&QueueId::DEFAULT) {
                    default.push_back(msg);
                }
            }
        }
    }

    pub(crate) fn pop(&mut self, queue: QueueId) -> Option<RawMessage> {
        self.buckets.get_mut(&queue)?.pop_front()
    }

    pub(crate) fn is_empty(&self, queue: QueueId) -> bool {
        self.buckets.get(&queue).is_none_or(|b| b.is_empty())
    }

    /// Remove a queue, migrating anything still pending to the default
    /// queue so no message is silently lost.
    pub(crate) fn retire(&mut self, queue: QueueId) {
        if queue == QueueId::DEFAULT {
            return;
        }
        if let Some(mut bucket) = self.buckets.remove(&queue) {
            if !bucket.is_empty() {
                debug!(%queue, pending = bucket.len(), "retiring queue with pending messages");
            }
            if let Some(default) = self.buckets.get_mut(&QueueId::DEFAULT) {
                default.append(&mut bucket);
            }
        }
    }
}

/// Owning handle to a non-default event queue.
///
/// Not cloneable: the queue retires when this handle drops, and any messages
/// still pending migrate to the connection's default queue.
pub struct EventQueue {
    conn: Arc<ConnectionInner>,
    id: QueueId,
}

impl EventQueue {
    pub(crate) fn new(conn: Arc<ConnectionInner>, id: QueueId) -> EventQueue {
        EventQueue { conn, id }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.conn.retire_queue(self.id);
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventQueue").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arg::RawArg;
    use crate::object::ObjectId;

    fn msg(id: u32) -> RawMessage {
        RawMessage { object_id: ObjectId(id), opcode: 0, args: vec![RawArg::Word(id)] }
    }

    #[test]
    fn default_queue_exists_up_front() {
        let mut q = PendingQueues::new();
        assert!(q.is_empty(QueueId::DEFAULT));
        q.push(QueueId::DEFAULT, msg(1));
        assert!(!q.is_empty(QueueId::DEFAULT));
        assert_eq!(q.pop(QueueId::DEFAULT).map(|m| m.object_id), Some(ObjectId(1)));
    }

    #[test]
    fn queues_are_independent() {
        let mut q = PendingQueues::new();
        let side = q.create();
        q.push(side, msg(2));
        assert!(q.is_empty(QueueId::DEFAULT));
        assert!(!q.is_empty(side));
        assert!(q.pop(QueueId::DEFAULT).is_none());
        assert_eq!(q.pop(side).map(|m| m.object_id), Some(ObjectId(2)));
    }

    #[test]
    fn retire_migrates_pending_to_default() {
        let mut q = PendingQueues::new();
        let side = q.create();
        q.push(side, msg(3));
        q.push(side, msg(4));
        q.retire(side);
        assert_eq!(q.pop(QueueId::DEFAULT).map(|m| m.object_id), Some(ObjectId(3)));
        assert_eq!(q.pop(QueueId::DEFAULT).map(|m| m.object_id), Some(ObjectId(4)));
    }

    #[test]
    fn push_to_retired_queue_falls_back_to_default() {
        let mut q = PendingQueues::new();
        let side = q.create();
        q.retire(side);
        q.push(side, msg(5));
        assert_eq!(q.pop(QueueId::DEFAULT).map(|m| m.object_id), Some(ObjectId(5)));
    }

    #[test]
    fn default_queue_cannot_be_retired() {
        let mut q = PendingQueues::new();
        q.push(QueueId::DEFAULT, msg(6));
        q.retire(QueueId::DEFAULT);
        assert!(!q.is_empty(QueueId::DEFAULT));
    }
}
