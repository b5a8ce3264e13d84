//! Censorship-resistant publishing.

pub mod distributor;
pub mod types;

pub use distributor::{
    ContentDistributor, PublicationCallback, PublishError, PublishResult, SubscriptionHandle,
};
pub use types::{AbuseReport, Category, Draft, Publication, PublicationMessage, WitnessSignature};
