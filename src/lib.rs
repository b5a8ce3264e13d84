//! ResistNet - identity-gated publishing and coordination
//!
//! A caller's Human Passport score decides what they may do; permitted
//! requests reach one of four independent components:
//! - Content distribution over content-addressed storage and gossip
//! - Private voting where only aggregates are ever revealed
//! - An encrypted evidence vault with per-viewer access and custody chains
//! - Threshold key custody (FROST) so no single party holds a signing key,
//!   plus guardian-approved social recovery
//!
//! External networks are consumed through traits (`ReputationSource`,
//! `StorageBackend`, `GossipTransport`, `SecretBackend`, `Custodian`). Each
//! ships with an in-process implementation so a full node runs locally.
//! `service::ResistNet` composes everything from a `config::ResistConfig`.

pub mod config;
pub mod crypto;
pub mod custody;
pub mod identity;
pub mod policy;
pub mod publishing;
pub mod recovery;
pub mod retry;
pub mod secrets;
pub mod serialization;
pub mod service;
pub mod storage;
pub mod tally;
pub mod transport;
pub mod vault;

pub use config::ResistConfig;
pub use service::{Backends, MemberSession, ResistNet, ServiceError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
