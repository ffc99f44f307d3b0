//! Outgoing request queue shared by a session and its writable nodes.
//!
//! Cells and blocks enqueue control messages here; the connection
//! manager drains the queue into the transport. Requests awaiting a
//! server `done` are tracked alongside so acknowledgements can be
//! routed back.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use serde_json::Value;

use mimir_types::ObjectId;

use crate::protocol::{ClientMsg, RequestId};

pub(crate) type OutboundHandle = Rc<RefCell<Outbound>>;

/// Handle that resolves when the server acknowledges the request it
/// was issued for. Never resolves if the connection dies first.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    done: Rc<RefCell<bool>>,
}

impl Completion {
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) fn resolve(&self) {
        *self.done.borrow_mut() = true;
    }
}

/// What to do when the matching `done` arrives.
pub(crate) enum PendingOp {
    /// Acknowledge one optimistic write on the cell with this id.
    Write(ObjectId),
    /// Resolve a command or collection-edit completion.
    Resolve(Completion),
}

pub(crate) struct Outbound {
    next_request: u64,
    queue: VecDeque<ClientMsg>,
    pending: HashMap<RequestId, PendingOp>,
}

impl Outbound {
    pub fn handle() -> OutboundHandle {
        Rc::new(RefCell::new(Self {
            next_request: 1,
            queue: VecDeque::new(),
            pending: HashMap::new(),
        }))
    }

    fn next_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request);
        self.next_request += 1;
        id
    }

    pub fn enqueue_write(&mut self, id: ObjectId, value: Value) -> RequestId {
        let request_id = self.next_id();
        self.queue.push_back(ClientMsg::Set {
            id,
            value,
            request_id,
        });
        self.pending.insert(request_id, PendingOp::Write(id));
        request_id
    }

    pub fn enqueue_invoke(&mut self, id: ObjectId) -> Completion {
        let request_id = self.next_id();
        // commands travel on the write path with a null payload
        self.queue.push_back(ClientMsg::Set {
            id,
            value: Value::Null,
            request_id,
        });
        self.track(request_id)
    }

    pub fn enqueue_create(&mut self, id: ObjectId, description: Value) -> Completion {
        let request_id = self.next_id();
        self.queue.push_back(ClientMsg::Create {
            id,
            description,
            request_id,
        });
        self.track(request_id)
    }

    pub fn enqueue_delete_member(&mut self, id: ObjectId, key: &str) -> Completion {
        let request_id = self.next_id();
        self.queue.push_back(ClientMsg::DeleteMember {
            id,
            key: key.to_string(),
            request_id,
        });
        self.track(request_id)
    }

    fn track(&mut self, request_id: RequestId) -> Completion {
        let completion = Completion::default();
        self.pending
            .insert(request_id, PendingOp::Resolve(completion.clone()));
        completion
    }

    pub fn take_pending(&mut self, request_id: RequestId) -> Option<PendingOp> {
        self.pending.remove(&request_id)
    }

    pub fn drain(&mut self) -> Vec<ClientMsg> {
        self.queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_ids_are_fresh() {
        let outbound = Outbound::handle();
        let mut outbound = outbound.borrow_mut();
        let a = outbound.enqueue_write(ObjectId::new(1), json!(1));
        let b = outbound.enqueue_write(ObjectId::new(1), json!(2));
        assert_ne!(a, b);

        let msgs = outbound.drain();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].request_id(), a);
        assert_eq!(msgs[1].request_id(), b);
        assert!(outbound.drain().is_empty());
    }

    #[test]
    fn invoke_resolves_through_pending() {
        let outbound = Outbound::handle();
        let mut outbound = outbound.borrow_mut();
        let completion = outbound.enqueue_invoke(ObjectId::new(3));
        assert!(!completion.is_done());

        let request_id = outbound.drain()[0].request_id();
        match outbound.take_pending(request_id) {
            Some(PendingOp::Resolve(c)) => c.resolve(),
            _ => panic!("expected a resolvable pending op"),
        }
        assert!(completion.is_done());
        assert!(outbound.take_pending(request_id).is_none());
    }
}
