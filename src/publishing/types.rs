//! Publication records and the messages carried on the publications topic.

use crate::identity::Address;
use crate::storage::ContentRef;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Article,
    Evidence,
    Report,
    Investigation,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Article => "article",
            Self::Evidence => "evidence",
            Self::Report => "report",
            Self::Investigation => "investigation",
        };
        f.write_str(name)
    }
}

/// A witness vouching for a publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSignature {
    pub witness: Address,
    pub signature: String,
    pub signed_at: u64,
}

/// A published item. Only `signatures` ever changes, and only by appending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub id: String,
    pub title: String,
    pub content: String,
    pub author: Address,
    /// Unix millis.
    pub timestamp: u64,
    /// `None` when storage was unreachable and the item went out over
    /// gossip only.
    pub content_ref: Option<ContentRef>,
    pub category: Category,
    #[serde(default)]
    pub signatures: Vec<WitnessSignature>,
    #[serde(default)]
    pub author_score: Option<f64>,
}

impl Publication {
    /// Append a signature unless this witness already signed.
    pub fn add_signature(&mut self, signature: WitnessSignature) -> bool {
        if self
            .signatures
            .iter()
            .any(|s| s.witness == signature.witness)
        {
            return false;
        }
        self.signatures.push(signature);
        true
    }
}

/// Abuse report filed against a publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbuseReport {
    pub publication_id: String,
    pub reporter: Address,
    pub reason: String,
    pub reported_at: u64,
}

/// Envelope on the publications topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublicationMessage {
    Published(Publication),
    CoSigned {
        publication_id: String,
        signature: WitnessSignature,
    },
    Reported(AbuseReport),
}

/// Unpublished work held encrypted in the secret backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub title: String,
    pub content: String,
    pub category: Category,
    pub saved_at: u64,
}
