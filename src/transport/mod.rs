//! Gossip transport and the well-known ResistNet topics.
//!
//! Messages on every topic are CBOR-encoded (`crate::serialization`).

pub mod memory;
pub mod traits;

pub use memory::InMemoryGossip;
pub use traits::{GossipTransport, TransportError, TransportResult};

/// Publications and their co-signatures and reports.
pub const PUBLICATIONS_TOPIC: &str = "/resistnet/1/publications/proto";

/// Proposals, vote-cast notices, emergency alerts.
pub const COORDINATION_TOPIC: &str = "/resistnet/1/coordination/proto";

/// Evidence metadata announcements and access notices.
pub const VAULT_TOPIC: &str = "/resistnet/1/vault/proto";
