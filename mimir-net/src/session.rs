//! The object-graph registry for one connection's lifetime.
//!
//! A [`Session`] owns every node the server has registered and
//! dispatches incoming control messages to create, update, and delete
//! them. It lives exactly as long as one socket: on reconnect the whole
//! registry is discarded and rebuilt, since the server does not
//! guarantee id stability across connections.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use log::{debug, warn};
use serde_json::Value;

use mimir_types::ObjectId;

use crate::block::{Block, Node};
use crate::bulk;
use crate::cell::{Cell, CellKind};
use crate::outbound::{Outbound, OutboundHandle, PendingOp};
use crate::protocol::{parse_batch, ClientMsg, ProtocolError, ServerMsg};

/// Id of the pre-registered root indirection cell. Its value, pushed by
/// the server, names the root block of the graph.
pub const ROOT_ID: ObjectId = ObjectId::new(0);

/// Live mirror of the remote object graph.
pub struct Session {
    nodes: HashMap<ObjectId, Node>,
    outbound: OutboundHandle,
}

impl Session {
    pub fn new() -> Self {
        let outbound = Outbound::handle();
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, Node::Cell(Cell::root(outbound.clone())));
        Self { nodes, outbound }
    }

    /// Look up a node by id.
    pub fn get(&self, id: ObjectId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of registered nodes, the root cell included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The root block, once the server has pushed it.
    pub fn root(&self) -> Option<Rc<Block>> {
        let root_cell = self.nodes.get(&ROOT_ID)?.as_cell()?;
        let target = root_cell.reference_target()?;
        self.nodes.get(&target)?.as_block().cloned()
    }

    /// Walk the graph from the root by key path, resolving block-typed
    /// cells along the way.
    pub fn lookup(&self, path: &[&str]) -> Option<Node> {
        let mut node = Node::Block(self.root()?);
        for key in path {
            let block = match &node {
                Node::Block(block) => block.clone(),
                Node::Cell(cell) => {
                    let target = cell.reference_target()?;
                    self.nodes.get(&target)?.as_block()?.clone()
                }
            };
            node = block.get(key)?;
        }
        Some(node)
    }

    /// Apply one incoming text frame: an ordered batch of control
    /// messages. A message that fails to decode or references unknown
    /// state is logged and dropped; the rest of the batch continues.
    pub fn handle_text(&mut self, text: &str) {
        let batch = match parse_batch(text) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("dropping undecodable frame: {}", e);
                return;
            }
        };
        for raw in &batch {
            if let Err(e) = ServerMsg::parse(raw).and_then(|msg| self.apply(msg)) {
                warn!("dropping message: {}", e);
            }
        }
    }

    /// Apply one incoming binary frame to its bulk-data cell.
    pub fn handle_binary(&mut self, frame: &[u8]) {
        if let Err(e) = self.apply_binary(frame) {
            warn!("dropping binary frame: {}", e);
        }
    }

    /// Outgoing control messages queued by cells and blocks since the
    /// last drain, in send order.
    pub fn drain_outbound(&mut self) -> Vec<ClientMsg> {
        self.outbound.borrow_mut().drain()
    }

    fn apply(&mut self, msg: ServerMsg) -> Result<(), ProtocolError> {
        match msg {
            ServerMsg::RegisterBlock { id, url, interfaces } => {
                let block = Block::new(id, url, interfaces, self.outbound.clone());
                if self.nodes.insert(id, Node::Block(block)).is_some() {
                    warn!("object {} re-registered without delete", id);
                }
                Ok(())
            }
            ServerMsg::RegisterCell { id, url, descriptor } => {
                let cell = Cell::from_descriptor(id, url, descriptor, self.outbound.clone());
                if self.nodes.insert(id, Node::Cell(cell)).is_some() {
                    warn!("object {} re-registered without delete", id);
                }
                Ok(())
            }
            ServerMsg::Value { id, payload } => {
                let node = self
                    .nodes
                    .get(&id)
                    .cloned()
                    .ok_or(ProtocolError::UnknownId(id))?;
                match node {
                    Node::Block(block) => self.apply_block_snapshot(&block, payload),
                    Node::Cell(cell) => self.apply_cell_value(&cell, payload),
                }
            }
            ServerMsg::Delete { id } => {
                self.nodes
                    .remove(&id)
                    .map(|_| ())
                    .ok_or(ProtocolError::UnknownId(id))
            }
            ServerMsg::Done { request_id } => {
                let op = self
                    .outbound
                    .borrow_mut()
                    .take_pending(request_id)
                    .ok_or(ProtocolError::UnmatchedRequest(request_id))?;
                match op {
                    PendingOp::Write(id) => match self.nodes.get(&id) {
                        Some(Node::Cell(cell)) => cell.ack_write(),
                        // the object went away while the write was in
                        // flight; the acknowledgement is moot
                        _ => debug!("write acknowledged for deleted object {}", id),
                    },
                    PendingOp::Resolve(completion) => completion.resolve(),
                }
                Ok(())
            }
        }
    }

    /// Replace a block's entire key set from an id-keyed snapshot.
    /// Nothing is applied if any referenced id is unknown.
    fn apply_block_snapshot(&self, block: &Rc<Block>, payload: Value) -> Result<(), ProtocolError> {
        let keys = match payload {
            Value::Object(keys) => keys,
            other => {
                return Err(ProtocolError::BadPayload {
                    id: block.id(),
                    reason: format!("block snapshot must be an object, got {other}"),
                })
            }
        };
        let mut entries = BTreeMap::new();
        for (key, raw) in keys {
            let member = raw.as_u64().map(ObjectId::new).ok_or_else(|| {
                ProtocolError::BadPayload {
                    id: block.id(),
                    reason: format!("snapshot key {key:?} maps to non-id {raw}"),
                }
            })?;
            let node = self
                .nodes
                .get(&member)
                .cloned()
                .ok_or(ProtocolError::UnknownId(member))?;
            entries.insert(key, node);
        }
        block.replace_entries(entries);
        Ok(())
    }

    fn apply_cell_value(&self, cell: &Rc<Cell>, payload: Value) -> Result<(), ProtocolError> {
        match cell.kind() {
            CellKind::BlockRef => {
                let target = payload.as_u64().map(ObjectId::new).ok_or_else(|| {
                    ProtocolError::BadPayload {
                        id: cell.id(),
                        reason: format!("reference payload must be an id, got {payload}"),
                    }
                })?;
                if !self.nodes.contains_key(&target) {
                    return Err(ProtocolError::UnknownId(target));
                }
                cell.apply_reference(target);
                Ok(())
            }
            CellKind::BulkData => Err(ProtocolError::BadPayload {
                id: cell.id(),
                reason: "bulk cells update via the binary channel".to_string(),
            }),
            CellKind::Command => Err(ProtocolError::BadPayload {
                id: cell.id(),
                reason: "command cells have no value".to_string(),
            }),
            CellKind::ReadOnly | CellKind::ReadWrite => {
                cell.apply_push(payload);
                Ok(())
            }
        }
    }

    fn apply_binary(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        let id = bulk::frame_target(frame)?;
        let cell = match self.nodes.get(&id) {
            Some(Node::Cell(cell)) => cell.clone(),
            Some(Node::Block(_)) => {
                return Err(ProtocolError::BadPayload {
                    id,
                    reason: "binary frame targets a block".to_string(),
                })
            }
            None => return Err(ProtocolError::UnknownId(id)),
        };
        let format = cell.bulk_format().ok_or_else(|| ProtocolError::BadPayload {
            id,
            reason: "binary frame targets a non-bulk cell".to_string(),
        })?;
        let chunk = bulk::decode_payload(format, &frame[4..])?;
        cell.apply_chunk(chunk);
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
