//! Secret storage and private computation.

pub mod local;
pub mod sharing;
pub mod traits;

pub use local::LocalSecretVault;
pub use traits::{
    AccessPolicy, Program, SecretBackend, SecretError, SecretHandle, SecretResult, SecretValue,
};
