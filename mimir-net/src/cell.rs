//! Observable cells, the leaves of the mirrored object graph.
//!
//! A cell holds one value of one [`ValueType`], fixed at registration.
//! Which operations it supports depends on its variant, decided once
//! from the registration descriptor and never changed afterward.

use std::cell::RefCell;
use std::rc::Rc;

use log::warn;
use serde_json::Value;

use mimir_types::{BulkFormat, EnumRow, ObjectId, ValueType};

use crate::bulk::BulkChunk;
use crate::outbound::{Completion, OutboundHandle};
use crate::protocol::{CellDescriptor, ProtocolError};

/// Handle for removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Which operations a cell supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// Value settable only by server pushes.
    ReadOnly,
    /// Locally writable with optimistic reconciliation.
    ReadWrite,
    /// No persistent value; invoked for its side effect.
    Command,
    /// Read-only, updated through the binary channel.
    BulkData,
    /// Indirection to another node of the graph.
    BlockRef,
}

/// Snapshot of a cell's current value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    /// Plain JSON value. Also what command cells and bulk cells that
    /// have not yet received data report (null).
    Json(Value),
    /// Latest bulk-data update.
    Bulk(BulkChunk),
    /// Id of the node a block-typed cell currently points at.
    Reference(Option<ObjectId>),
}

type Observer = Rc<dyn Fn(&CellValue)>;

#[derive(Default)]
struct Observers {
    next: u64,
    subs: Vec<(SubscriptionId, Observer)>,
}

/// Reconciliation state of a read-write cell.
///
/// `local` is what observers see; `remote` is the latest authoritative
/// value; `pending_writes` counts our writes the server has not yet
/// acknowledged. Whenever `pending_writes` is zero, `local == remote`.
struct WriteBack {
    local: Value,
    remote: Value,
    pending_writes: u32,
}

enum CellBody {
    ReadOnly(RefCell<Value>),
    ReadWrite(RefCell<WriteBack>),
    Command,
    Bulk {
        format: BulkFormat,
        latest: RefCell<Option<BulkChunk>>,
    },
    BlockRef(RefCell<Option<ObjectId>>),
}

/// Observable holder of one value of one value type.
pub struct Cell {
    id: ObjectId,
    url: String,
    value_type: ValueType,
    naming: EnumRow,
    persists: bool,
    body: CellBody,
    observers: RefCell<Observers>,
    outbound: OutboundHandle,
}

impl Cell {
    pub(crate) fn from_descriptor(
        id: ObjectId,
        url: String,
        descriptor: CellDescriptor,
        outbound: OutboundHandle,
    ) -> Rc<Self> {
        let current = descriptor.current.unwrap_or(Value::Null);
        let body = match &descriptor.value_type {
            ValueType::Block => CellBody::BlockRef(RefCell::new(None)),
            ValueType::BulkData(b) => CellBody::Bulk {
                format: b.format,
                latest: RefCell::new(None),
            },
            _ if descriptor.command => CellBody::Command,
            _ if descriptor.writable => CellBody::ReadWrite(RefCell::new(WriteBack {
                local: current.clone(),
                remote: current,
                pending_writes: 0,
            })),
            _ => CellBody::ReadOnly(RefCell::new(current)),
        };
        Rc::new(Self {
            id,
            url,
            value_type: descriptor.value_type,
            naming: descriptor.naming,
            persists: descriptor.persists,
            body,
            observers: RefCell::new(Observers::default()),
            outbound,
        })
    }

    /// The root indirection cell, present before the server says
    /// anything; its value names the root block.
    pub(crate) fn root(outbound: OutboundHandle) -> Rc<Self> {
        Rc::new(Self {
            id: ObjectId::new(0),
            url: "/".to_string(),
            value_type: ValueType::Block,
            naming: EnumRow::new(""),
            persists: false,
            body: CellBody::BlockRef(RefCell::new(None)),
            observers: RefCell::new(Observers::default()),
            outbound,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    /// Naming metadata from the registration descriptor.
    pub fn naming(&self) -> &EnumRow {
        &self.naming
    }

    pub fn label(&self) -> &str {
        &self.naming.label
    }

    pub fn persists(&self) -> bool {
        self.persists
    }

    pub fn kind(&self) -> CellKind {
        match &self.body {
            CellBody::ReadOnly(_) => CellKind::ReadOnly,
            CellBody::ReadWrite(_) => CellKind::ReadWrite,
            CellBody::Command => CellKind::Command,
            CellBody::Bulk { .. } => CellKind::BulkData,
            CellBody::BlockRef(_) => CellKind::BlockRef,
        }
    }

    pub(crate) fn bulk_format(&self) -> Option<BulkFormat> {
        match &self.body {
            CellBody::Bulk { format, .. } => Some(*format),
            _ => None,
        }
    }

    /// Current value as observers see it.
    pub fn get(&self) -> CellValue {
        match &self.body {
            CellBody::ReadOnly(value) => CellValue::Json(value.borrow().clone()),
            CellBody::ReadWrite(state) => CellValue::Json(state.borrow().local.clone()),
            CellBody::Command => CellValue::Json(Value::Null),
            CellBody::Bulk { latest, .. } => match latest.borrow().clone() {
                Some(chunk) => CellValue::Bulk(chunk),
                None => CellValue::Json(Value::Null),
            },
            CellBody::BlockRef(target) => CellValue::Reference(*target.borrow()),
        }
    }

    /// Target of a block-typed cell.
    pub fn reference_target(&self) -> Option<ObjectId> {
        match &self.body {
            CellBody::BlockRef(target) => *target.borrow(),
            _ => None,
        }
    }

    /// Unacknowledged local writes. Zero for all but read-write cells.
    pub fn pending_writes(&self) -> u32 {
        match &self.body {
            CellBody::ReadWrite(state) => state.borrow().pending_writes,
            _ => 0,
        }
    }

    /// Register an observer invoked with every value applied to this
    /// cell from now on, not just distinct ones.
    pub fn subscribe(&self, observer: impl Fn(&CellValue) + 'static) -> SubscriptionId {
        let mut observers = self.observers.borrow_mut();
        let id = SubscriptionId(observers.next);
        observers.next += 1;
        observers.subs.push((id, Rc::new(observer)));
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.borrow_mut();
        let before = observers.subs.len();
        observers.subs.retain(|(sid, _)| *sid != id);
        observers.subs.len() != before
    }

    fn notify(&self, value: &CellValue) {
        // snapshot so observers may (un)subscribe reentrantly
        let snapshot: Vec<Observer> = self
            .observers
            .borrow()
            .subs
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for observer in snapshot {
            observer(value);
        }
    }

    /// Optimistic local write.
    ///
    /// The new value is visible to `get` and observers immediately;
    /// the server's acknowledgement is reconciled asynchronously. While
    /// any write is unacknowledged, server pushes are buffered rather
    /// than applied, so the local value never regresses to a superseded
    /// state; once the last `done` arrives the latest authoritative
    /// value is adopted.
    pub fn set(&self, value: Value) -> Result<(), ProtocolError> {
        let state = match &self.body {
            CellBody::ReadWrite(state) => state,
            _ => return Err(ProtocolError::NotWritable(self.id)),
        };
        state.borrow_mut().local = value.clone();
        self.notify(&CellValue::Json(value.clone()));
        state.borrow_mut().pending_writes += 1;
        self.outbound.borrow_mut().enqueue_write(self.id, value);
        Ok(())
    }

    /// Trigger a command cell. The completion resolves when the server
    /// reports the invocation done; concurrent invocations may complete
    /// in any order.
    pub fn invoke(&self) -> Result<Completion, ProtocolError> {
        match &self.body {
            CellBody::Command => Ok(self.outbound.borrow_mut().enqueue_invoke(self.id)),
            _ => Err(ProtocolError::BadPayload {
                id: self.id,
                reason: "not a command cell".to_string(),
            }),
        }
    }

    /// Apply a server push to a value-holding cell.
    pub(crate) fn apply_push(&self, value: Value) {
        match &self.body {
            CellBody::ReadOnly(slot) => {
                *slot.borrow_mut() = value.clone();
                self.notify(&CellValue::Json(value));
            }
            CellBody::ReadWrite(state) => {
                let applied = {
                    let mut state = state.borrow_mut();
                    state.remote = value.clone();
                    if state.pending_writes == 0 {
                        state.local = value.clone();
                        true
                    } else {
                        false
                    }
                };
                if applied {
                    self.notify(&CellValue::Json(value));
                }
            }
            _ => warn!("dropping value push for cell {} of kind {:?}", self.id, self.kind()),
        }
    }

    /// Acknowledge one optimistic write; adopt the authoritative value
    /// once nothing is outstanding.
    pub(crate) fn ack_write(&self) {
        let state = match &self.body {
            CellBody::ReadWrite(state) => state,
            _ => {
                warn!("write acknowledged for non-writable cell {}", self.id);
                return;
            }
        };
        let adopted = {
            let mut state = state.borrow_mut();
            if state.pending_writes == 0 {
                warn!("unexpected write acknowledgement for cell {}", self.id);
                return;
            }
            state.pending_writes -= 1;
            if state.pending_writes == 0 {
                state.local = state.remote.clone();
                Some(state.local.clone())
            } else {
                None
            }
        };
        if let Some(value) = adopted {
            self.notify(&CellValue::Json(value));
        }
    }

    /// Point a block-typed cell at a (re)registered node.
    pub(crate) fn apply_reference(&self, target: ObjectId) {
        match &self.body {
            CellBody::BlockRef(slot) => {
                *slot.borrow_mut() = Some(target);
                self.notify(&CellValue::Reference(Some(target)));
            }
            _ => warn!("dropping reference push for cell {}", self.id),
        }
    }

    /// Apply a decoded binary update to a bulk-data cell. Exactly one
    /// notification per frame, no coalescing.
    pub(crate) fn apply_chunk(&self, chunk: BulkChunk) {
        match &self.body {
            CellBody::Bulk { latest, .. } => {
                *latest.borrow_mut() = Some(chunk.clone());
                self.notify(&CellValue::Bulk(chunk));
            }
            _ => warn!("dropping bulk update for non-bulk cell {}", self.id),
        }
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Outbound;
    use serde_json::json;

    fn read_write_cell(current: Value) -> (Rc<Cell>, OutboundHandle) {
        let outbound = Outbound::handle();
        let cell = Cell::from_descriptor(
            ObjectId::new(1),
            "/x".to_string(),
            CellDescriptor {
                command: false,
                value_type: ValueType::Number { integer: false },
                naming: EnumRow::new("x"),
                persists: true,
                writable: true,
                current: Some(current),
            },
            outbound.clone(),
        );
        (cell, outbound)
    }

    fn get_json(cell: &Cell) -> Value {
        match cell.get() {
            CellValue::Json(v) => v,
            other => panic!("expected a JSON value, got {:?}", other),
        }
    }

    #[test]
    fn set_is_visible_immediately() {
        let (cell, outbound) = read_write_cell(json!("A"));
        assert_eq!(get_json(&cell), json!("A"));

        cell.set(json!("B")).unwrap();
        assert_eq!(get_json(&cell), json!("B"));
        assert_eq!(cell.pending_writes(), 1);

        let sent = outbound.borrow_mut().drain();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            crate::protocol::ClientMsg::Set { id, value, .. } => {
                assert_eq!(*id, ObjectId::new(1));
                assert_eq!(value, &json!("B"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn push_is_buffered_while_writes_pending() {
        let (cell, _outbound) = read_write_cell(json!("A"));
        cell.set(json!("B")).unwrap();

        cell.apply_push(json!("C"));
        assert_eq!(get_json(&cell), json!("B"), "optimistic value must hold");

        cell.ack_write();
        assert_eq!(cell.pending_writes(), 0);
        assert_eq!(get_json(&cell), json!("C"), "authoritative value adopted");
    }

    #[test]
    fn overlapping_writes_resolve_after_last_ack() {
        let (cell, _outbound) = read_write_cell(json!("A"));
        cell.set(json!("B")).unwrap();
        cell.set(json!("C")).unwrap();
        assert_eq!(cell.pending_writes(), 2);

        // server echoes B then applies its own logic
        cell.apply_push(json!("B"));
        cell.ack_write();
        assert_eq!(get_json(&cell), json!("C"), "still optimistic after one ack");

        cell.apply_push(json!("Z"));
        cell.ack_write();
        assert_eq!(get_json(&cell), json!("Z"));
        assert_eq!(cell.pending_writes(), 0);
    }

    #[test]
    fn push_applies_directly_when_idle() {
        let (cell, _outbound) = read_write_cell(json!(1));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        cell.subscribe(move |v| sink.borrow_mut().push(v.clone()));

        cell.apply_push(json!(2));
        assert_eq!(get_json(&cell), json!(2));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn observers_see_every_applied_value() {
        let (cell, _outbound) = read_write_cell(json!(0));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        cell.subscribe(move |v| {
            if let CellValue::Json(v) = v {
                sink.borrow_mut().push(v.clone());
            }
        });

        cell.set(json!(1)).unwrap();
        cell.apply_push(json!(1)); // buffered, no notification
        cell.ack_write(); // adoption notifies even though value is unchanged
        assert_eq!(*seen.borrow(), vec![json!(1), json!(1)]);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let (cell, _outbound) = read_write_cell(json!(0));
        let seen = Rc::new(RefCell::new(0u32));
        let sink = seen.clone();
        let sub = cell.subscribe(move |_| *sink.borrow_mut() += 1);

        cell.apply_push(json!(1));
        assert!(cell.unsubscribe(sub));
        cell.apply_push(json!(2));
        assert_eq!(*seen.borrow(), 1);
        assert!(!cell.unsubscribe(sub));
    }

    #[test]
    fn read_only_cells_reject_set() {
        let outbound = Outbound::handle();
        let cell = Cell::from_descriptor(
            ObjectId::new(2),
            "/ro".to_string(),
            CellDescriptor {
                command: false,
                value_type: ValueType::String,
                naming: EnumRow::new("ro"),
                persists: true,
                writable: false,
                current: None,
            },
            outbound,
        );
        assert_eq!(cell.kind(), CellKind::ReadOnly);
        assert!(matches!(
            cell.set(json!("nope")),
            Err(ProtocolError::NotWritable(_))
        ));
    }

    #[test]
    fn command_cells_invoke() {
        let outbound = Outbound::handle();
        let cell = Cell::from_descriptor(
            ObjectId::new(3),
            "/scan".to_string(),
            CellDescriptor {
                command: true,
                value_type: ValueType::Any,
                naming: EnumRow::new("scan"),
                persists: false,
                writable: true,
                current: None,
            },
            outbound.clone(),
        );
        assert_eq!(cell.kind(), CellKind::Command);
        let completion = cell.invoke().unwrap();
        assert!(!completion.is_done());

        let sent = outbound.borrow_mut().drain();
        match &sent[0] {
            crate::protocol::ClientMsg::Set { value, .. } => assert_eq!(value, &Value::Null),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn variant_selection_prefers_type_over_flags() {
        let outbound = Outbound::handle();
        // a writable descriptor with a reference type is still an indirection
        let cell = Cell::from_descriptor(
            ObjectId::new(4),
            "/ref".to_string(),
            CellDescriptor {
                command: false,
                value_type: ValueType::Block,
                naming: EnumRow::new("ref"),
                persists: true,
                writable: true,
                current: None,
            },
            outbound,
        );
        assert_eq!(cell.kind(), CellKind::BlockRef);
        assert_eq!(cell.get(), CellValue::Reference(None));
        cell.apply_reference(ObjectId::new(9));
        assert_eq!(cell.reference_target(), Some(ObjectId::new(9)));
    }
}
