//! Encrypted evidence storage with access control and chain of custody.

pub mod types;
#[allow(clippy::module_inception)]
pub mod vault;

pub use types::{
    Collection, CustodySignature, EvidenceMetadata, EvidencePackage, EvidenceQuery,
    EvidenceRecord, EvidenceType, PackageItem, VaultMessage,
};
pub use vault::{EvidenceVault, VaultError, VaultResult};
