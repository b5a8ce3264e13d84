//! Local stand-in for the secret-computation network.
//!
//! Each secret is split across `node_count` in-process nodes. Reads
//! reconstruct only after the policy check; `compute` has every node sum
//! its own shares before the node sums are combined, so individual inputs
//! are never reassembled.

use super::sharing;
use super::traits::*;
use crate::identity::Address;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
enum Share {
    Blob(Vec<u8>),
    Vector(Vec<u64>),
}

struct Entry {
    policy: AccessPolicy,
    is_blob: bool,
}

#[derive(Clone)]
pub struct LocalSecretVault {
    node_count: usize,
    nodes: Arc<Vec<Mutex<HashMap<SecretHandle, Share>>>>,
    entries: Arc<Mutex<HashMap<SecretHandle, Entry>>>,
    offline: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
}

impl LocalSecretVault {
    pub fn new(node_count: usize) -> Self {
        let node_count = node_count.max(2);
        Self {
            node_count,
            nodes: Arc::new((0..node_count).map(|_| Mutex::new(HashMap::new())).collect()),
            entries: Arc::new(Mutex::new(HashMap::new())),
            offline: Arc::new(AtomicBool::new(false)),
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Simulate the secret network being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Accept requests but never answer.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn check_online(&self) -> SecretResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SecretError::Unavailable("secret nodes offline".to_string()));
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn collect_shares(&self, handle: &SecretHandle) -> SecretResult<Vec<Share>> {
        self.nodes
            .iter()
            .map(|node| {
                node.lock()
                    .get(handle)
                    .cloned()
                    .ok_or_else(|| SecretError::NotFound(handle.clone()))
            })
            .collect()
    }
}

impl Default for LocalSecretVault {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl SecretBackend for LocalSecretVault {
    async fn store_secret(
        &self,
        value: SecretValue,
        policy: AccessPolicy,
    ) -> SecretResult<SecretHandle> {
        self.check_online().await?;

        let handle = SecretHandle::generate();
        let (shares, is_blob): (Vec<Share>, bool) = match value {
            SecretValue::Blob(mut bytes) => {
                let shares = sharing::split_blob(&bytes, self.node_count);
                zeroize::Zeroize::zeroize(&mut bytes);
                (shares.into_iter().map(Share::Blob).collect(), true)
            }
            SecretValue::Vector(values) => (
                sharing::split_vector(&values, self.node_count)
                    .into_iter()
                    .map(Share::Vector)
                    .collect(),
                false,
            ),
        };

        for (node, share) in self.nodes.iter().zip(shares) {
            node.lock().insert(handle.clone(), share);
        }
        self.entries
            .lock()
            .insert(handle.clone(), Entry { policy, is_blob });

        debug!(handle = %handle, nodes = self.node_count, "secret stored");
        Ok(handle)
    }

    async fn retrieve(
        &self,
        handle: &SecretHandle,
        requester: &Address,
    ) -> SecretResult<SecretValue> {
        self.check_online().await?;

        let is_blob = {
            let entries = self.entries.lock();
            let entry = entries
                .get(handle)
                .ok_or_else(|| SecretError::NotFound(handle.clone()))?;
            if !entry.policy.can_read(requester) {
                warn!(handle = %handle, requester = %requester, "secret read denied");
                return Err(SecretError::Unauthorized {
                    handle: handle.clone(),
                    requester: requester.clone(),
                });
            }
            entry.is_blob
        };

        let shares = self.collect_shares(handle)?;
        if is_blob {
            let mut blobs: Vec<Vec<u8>> = shares
                .into_iter()
                .filter_map(|s| match s {
                    Share::Blob(b) => Some(b),
                    Share::Vector(_) => None,
                })
                .collect();
            let value = sharing::combine_blob(&blobs);
            sharing::wipe_blob_shares(&mut blobs);
            Ok(SecretValue::Blob(value))
        } else {
            let vectors: Vec<Vec<u64>> = shares
                .into_iter()
                .filter_map(|s| match s {
                    Share::Vector(v) => Some(v),
                    Share::Blob(_) => None,
                })
                .collect();
            Ok(SecretValue::Vector(sharing::combine_vector(&vectors)))
        }
    }

    async fn update_permissions(
        &self,
        handle: &SecretHandle,
        policy: AccessPolicy,
    ) -> SecretResult<()> {
        self.check_online().await?;

        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(handle)
            .ok_or_else(|| SecretError::NotFound(handle.clone()))?;
        if entry.policy.owner != policy.owner {
            return Err(SecretError::InvalidInput(
                "the owner of a secret cannot be changed".to_string(),
            ));
        }
        entry.policy = policy;
        Ok(())
    }

    async fn compute(&self, program: Program, bindings: &[SecretHandle]) -> SecretResult<Vec<u64>> {
        self.check_online().await?;

        {
            let entries = self.entries.lock();
            for handle in bindings {
                let entry = entries
                    .get(handle)
                    .ok_or_else(|| SecretError::NotFound(handle.clone()))?;
                if !entry.policy.programs.contains(&program) {
                    return Err(SecretError::ProgramNotPermitted {
                        program,
                        handle: handle.clone(),
                    });
                }
                if entry.is_blob {
                    return Err(SecretError::InvalidInput(format!(
                        "{} takes integer vectors",
                        program
                    )));
                }
            }
        }

        // Program::Tally: each node sums its own shares
        let mut node_sums = Vec::with_capacity(self.node_count);
        for node in self.nodes.iter() {
            let node = node.lock();
            let mut shares = Vec::with_capacity(bindings.len());
            for handle in bindings {
                match node.get(handle) {
                    Some(Share::Vector(v)) => shares.push(v.clone()),
                    _ => return Err(SecretError::NotFound(handle.clone())),
                }
            }

            let width = shares.first().map(Vec::len).unwrap_or(0);
            if shares.iter().any(|s| s.len() != width) {
                return Err(SecretError::InvalidInput(
                    "tally inputs differ in length".to_string(),
                ));
            }
            node_sums.push(sharing::sum_vectors(&shares, width));
        }

        debug!(%program, inputs = bindings.len(), "secret computation finished");
        Ok(sharing::combine_vector(&node_sums))
    }
}
