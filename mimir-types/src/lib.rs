//! # mimir-types
//!
//! Shared type definitions for the Mimir state-mirror client.
//! This crate contains the value-type model used by mimir-net to
//! interpret cell descriptors and values; it is pure data with no I/O.

mod types;
mod unit;

pub use types::{
    BulkDataT, BulkFormat, ConstantT, EnumRow, EnumT, EnumTable, NoticeT, QuantityT, RangeT,
    TypeDecodeError, ValueType,
};
pub use unit::Unit;

/// Server-assigned handle for one node of the remote object graph.
///
/// Unique only within the lifetime of one connection; the server may
/// reuse an id immediately after deleting it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
