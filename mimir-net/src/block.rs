//! Blocks: named collections of cells and nested blocks.
//!
//! A block's contents are always pushed by the server as a complete
//! key -> id snapshot, never patched incrementally. Structural change
//! ("reshape") is signalled separately from value changes of the
//! member cells.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;

use mimir_types::ObjectId;

use crate::cell::{Cell, SubscriptionId};
use crate::outbound::{Completion, OutboundHandle};
use crate::protocol::ProtocolError;

/// Interface tag marking a block whose members the client may create
/// and delete.
pub const WRITABLE_COLLECTION: &str = "writable_collection";

/// One node of the mirrored object graph.
#[derive(Debug, Clone)]
pub enum Node {
    Cell(Rc<Cell>),
    Block(Rc<Block>),
}

impl Node {
    pub fn as_cell(&self) -> Option<&Rc<Cell>> {
        match self {
            Node::Cell(cell) => Some(cell),
            Node::Block(_) => None,
        }
    }

    pub fn as_block(&self) -> Option<&Rc<Block>> {
        match self {
            Node::Block(block) => Some(block),
            Node::Cell(_) => None,
        }
    }
}

type ReshapeObserver = Rc<dyn Fn()>;

#[derive(Default)]
struct ReshapeObservers {
    next: u64,
    subs: Vec<(SubscriptionId, ReshapeObserver)>,
}

/// Mutable named mapping from string keys to graph nodes.
pub struct Block {
    id: ObjectId,
    url: String,
    interfaces: Vec<String>,
    entries: RefCell<BTreeMap<String, Node>>,
    observers: RefCell<ReshapeObservers>,
    outbound: OutboundHandle,
}

impl Block {
    pub(crate) fn new(
        id: ObjectId,
        url: String,
        interfaces: Vec<String>,
        outbound: OutboundHandle,
    ) -> Rc<Self> {
        Rc::new(Self {
            id,
            url,
            interfaces,
            entries: RefCell::new(BTreeMap::new()),
            observers: RefCell::new(ReshapeObservers::default()),
            outbound,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Interface tags the server attached at registration.
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn implements(&self, tag: &str) -> bool {
        self.interfaces.iter().any(|t| t == tag)
    }

    pub fn is_writable_collection(&self) -> bool {
        self.implements(WRITABLE_COLLECTION)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Node> {
        self.entries.borrow().get(key).cloned()
    }

    /// Notify whenever the key set is replaced. Fires once per applied
    /// snapshot, regardless of how many keys changed.
    pub fn subscribe_reshape(&self, observer: impl Fn() + 'static) -> SubscriptionId {
        let mut observers = self.observers.borrow_mut();
        let id = SubscriptionId::new(observers.next);
        observers.next += 1;
        observers.subs.push((id, Rc::new(observer)));
        id
    }

    pub fn unsubscribe_reshape(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.borrow_mut();
        let before = observers.subs.len();
        observers.subs.retain(|(sid, _)| *sid != id);
        observers.subs.len() != before
    }

    /// Install a complete snapshot and fire one reshape notification.
    pub(crate) fn replace_entries(&self, entries: BTreeMap<String, Node>) {
        *self.entries.borrow_mut() = entries;
        let snapshot: Vec<ReshapeObserver> = self
            .observers
            .borrow()
            .subs
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for observer in snapshot {
            observer();
        }
    }

    /// Ask the server to create a member of this collection. The
    /// server answers with fresh registrations and a new snapshot; the
    /// completion resolves on its `done`.
    pub fn create(&self, description: Value) -> Result<Completion, ProtocolError> {
        if !self.is_writable_collection() {
            return Err(ProtocolError::NotWritable(self.id));
        }
        Ok(self.outbound.borrow_mut().enqueue_create(self.id, description))
    }

    /// Ask the server to delete a member of this collection.
    pub fn delete_member(&self, key: &str) -> Result<Completion, ProtocolError> {
        if !self.is_writable_collection() {
            return Err(ProtocolError::NotWritable(self.id));
        }
        Ok(self
            .outbound
            .borrow_mut()
            .enqueue_delete_member(self.id, key))
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("keys", &self.keys())
            .finish()
    }
}
