//! In-memory reputation source for tests and offline demos.

use super::{Address, PassportReport, ReputationSource, ScoreError, ScoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Reputation source backed by a map. Unknown addresses score zero.
#[derive(Clone, Default)]
pub struct MockReputation {
    reports: Arc<Mutex<HashMap<Address, PassportReport>>>,
    offline: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl MockReputation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an address's score with optional stamps.
    pub fn set_score(&self, address: &Address, score: f64, stamps: &[(&str, f64)]) {
        let report = PassportReport {
            address: address.to_string(),
            score,
            passing_score: Some(score >= 20.0),
            threshold: Some(20.0),
            last_score_timestamp: None,
            expiration_timestamp: None,
            stamp_scores: stamps
                .iter()
                .map(|(provider, s)| (provider.to_string(), *s))
                .collect::<BTreeMap<_, _>>(),
        };
        self.reports.lock().insert(address.clone(), report);
    }

    /// Simulate the API being unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `fetch_report` calls seen.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReputationSource for MockReputation {
    async fn fetch_report(&self, address: &Address) -> ScoreResult<PassportReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ScoreError::UpstreamUnavailable("mock offline".to_string()));
        }

        let reports = self.reports.lock();
        Ok(reports.get(address).cloned().unwrap_or(PassportReport {
            address: address.to_string(),
            score: 0.0,
            passing_score: Some(false),
            threshold: Some(20.0),
            last_score_timestamp: None,
            expiration_timestamp: None,
            stamp_scores: BTreeMap::new(),
        }))
    }

    async fn list_providers(&self) -> ScoreResult<Vec<serde_json::Value>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ScoreError::UpstreamUnavailable("mock offline".to_string()));
        }
        Ok(vec![
            serde_json::json!({"name": "Github"}),
            serde_json::json!({"name": "Google"}),
            serde_json::json!({"name": "Twitter"}),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_unknown_address_scores_zero() {
        let mock = MockReputation::new();
        let report = mock.fetch_report(&Address::new("0xnobody")).await.unwrap();
        assert_eq!(report.score, 0.0);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_offline() {
        let mock = MockReputation::new();
        mock.set_offline(true);
        assert!(mock.fetch_report(&Address::new("0xa")).await.is_err());
        mock.set_offline(false);
        assert!(mock.fetch_report(&Address::new("0xa")).await.is_ok());
    }
}
