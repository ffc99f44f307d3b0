//! Client runtime for the Mimir live state-mirror protocol.
//!
//! Maintains, over one persistent connection, a local mirror of a
//! remote object graph of typed observable values ([`Cell`]) and
//! containers of values ([`Block`]). Server pushes reach local
//! observers with minimal latency, local writes apply optimistically
//! and reconcile against server acknowledgements, and high-rate
//! numeric telemetry arrives on a separate binary channel that never
//! perturbs the control-plane stream.

pub mod block;
pub mod bulk;
pub mod cell;
pub mod client;
pub mod framing;
mod outbound;
pub mod protocol;
pub mod session;

pub use block::{Block, Node, WRITABLE_COLLECTION};
pub use bulk::{BulkChunk, BulkInfo};
pub use cell::{Cell, CellKind, CellValue, SubscriptionId};
pub use client::{
    ConnectionEvent, Connector, MirrorClient, ReconnectConfig, TcpConnector, TcpTransport,
    Transport, TransportEvent,
};
pub use framing::Frame;
pub use outbound::Completion;
pub use protocol::{CellDescriptor, ClientMsg, ProtocolError, RequestId, ServerMsg};
pub use session::{Session, ROOT_ID};
