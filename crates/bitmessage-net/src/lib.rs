//! Bitmessage peer networking
//!
//! Wire framing, the `version`/`verack`/`addr`/`inv`/`getdata` message
//! shapes, the per-connection handshake and gossip state machine, and the
//! two small in-memory ports (`Inventory`, `NodeRegistry`) a daemon wires
//! up to a real store.
//!
//! # Modules
//!
//! - [`framing`]: the 24-byte frame header and [`framing::FrameCodec`].
//! - [`peer`]: [`peer::NetworkAddress`] and [`peer::KnownNode`].
//! - [`messages`]: `version`/`addr`/inventory-vector-list payloads.
//! - [`registry`]: the [`registry::NodeRegistry`] port.
//! - [`inventory`]: the [`inventory::Inventory`] port.
//! - [`connection`]: [`connection::ConnectionActor`], the per-connection task.

pub mod connection;
pub mod framing;
pub mod inventory;
pub mod messages;
pub mod peer;
pub mod registry;

pub use connection::{ConnState, ConnectionActor, ConnectionError};
pub use framing::{Frame, FrameCodec, FrameError, MAGIC};
pub use inventory::{InMemoryInventory, Inventory, InventoryEntry};
pub use messages::{AddrMessage, InventoryVectorList, VersionMessage, PROTOCOL_VERSION};
pub use peer::{KnownNode, NetworkAddress};
pub use registry::{InMemoryNodeRegistry, NodeRegistry};
