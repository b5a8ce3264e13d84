use crate::identity::Address;
use crate::secrets::SecretHandle;
use crate::storage::ContentRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceType {
    Photo,
    Video,
    Document,
    Audio,
}

impl fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
        };
        f.write_str(name)
    }
}

/// What the uploader says about the evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub evidence_type: EvidenceType,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A chain-of-custody attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodySignature {
    pub witness: Address,
    pub signature: String,
    pub signed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: String,
    pub evidence_type: EvidenceType,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Unix millis.
    pub timestamp: u64,
    pub owner: Address,
    /// Ciphertext location.
    pub content_ref: ContentRef,
    /// `0x`-prefixed SHA-256 of the plaintext.
    pub content_hash: String,
    pub size: usize,
    /// Mutated only by grant and revoke.
    pub authorized_viewers: BTreeSet<Address>,
    /// Append-only.
    pub custody: Vec<CustodySignature>,
    /// Data key in the secret backend.
    pub key_handle: SecretHandle,
}

impl EvidenceRecord {
    pub fn can_view(&self, address: &Address) -> bool {
        self.owner == *address || self.authorized_viewers.contains(address)
    }
}

/// Filter for `EvidenceVault::search`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceQuery {
    pub evidence_type: Option<EvidenceType>,
    /// Inclusive lower bound, unix millis.
    pub from: Option<u64>,
    /// Inclusive upper bound, unix millis.
    pub to: Option<u64>,
    pub min_witnesses: Option<usize>,
}

impl EvidenceQuery {
    pub fn matches(&self, record: &EvidenceRecord) -> bool {
        self.evidence_type.map_or(true, |t| record.evidence_type == t)
            && self.from.map_or(true, |from| record.timestamp >= from)
            && self.to.map_or(true, |to| record.timestamp <= to)
            && self
                .min_witnesses
                .map_or(true, |min| record.custody.len() >= min)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub description: String,
    pub owner: Address,
    pub evidence_ids: Vec<String>,
    pub created_at: u64,
}

/// One entry of an exported package. Carries hashes, never content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageItem {
    pub id: String,
    pub evidence_type: EvidenceType,
    pub title: String,
    pub description: String,
    pub timestamp: u64,
    pub owner: Address,
    pub content_ref: ContentRef,
    pub content_hash: String,
    pub custody: Vec<CustodySignature>,
}

impl From<&EvidenceRecord> for PackageItem {
    fn from(record: &EvidenceRecord) -> Self {
        Self {
            id: record.id.clone(),
            evidence_type: record.evidence_type,
            title: record.title.clone(),
            description: record.description.clone(),
            timestamp: record.timestamp,
            owner: record.owner.clone(),
            content_ref: record.content_ref.clone(),
            content_hash: record.content_hash.clone(),
            custody: record.custody.clone(),
        }
    }
}

/// Evidence package for legal proceedings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePackage {
    pub generated_at: u64,
    pub generated_by: Address,
    pub items: Vec<PackageItem>,
}

/// Envelope on the vault topic. Never carries content or keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultMessage {
    EvidenceAnnounced {
        id: String,
        evidence_type: EvidenceType,
        owner: Address,
        content_hash: String,
        timestamp: u64,
    },
    AccessGranted {
        evidence_id: String,
        viewer: Address,
        granted_by: Address,
        granted_at: u64,
    },
}
