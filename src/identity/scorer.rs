use super::{
    Address, IdentityScore, ReputationSource, ScoreError, ScoreResult, StampDetail,
    ThresholdCheck,
};
use crate::retry::{retry_with_backoff, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Scores addresses against a reputation source.
///
/// Every call goes to the source: there is no cache here. Transient failures
/// are retried with backoff, and each attempt is bounded by `timeout`.
#[derive(Clone)]
pub struct IdentityScorer {
    source: Arc<dyn ReputationSource>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl IdentityScorer {
    pub fn new(source: Arc<dyn ReputationSource>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            source,
            timeout,
            retry,
        }
    }

    async fn fetch_once(&self, address: &Address) -> ScoreResult<IdentityScore> {
        let report = tokio::time::timeout(self.timeout, self.source.fetch_report(address))
            .await
            .map_err(|_| ScoreError::Timeout)??;
        Ok(report.into_score(address.clone()))
    }

    /// Score for `address`, surfacing upstream failures.
    pub async fn fetch_score(&self, address: &Address) -> ScoreResult<IdentityScore> {
        let score = retry_with_backoff(
            &self.retry,
            || self.fetch_once(address),
            ScoreError::is_retryable,
        )
        .await?;

        debug!(address = %address, score = score.score, "identity score fetched");
        Ok(score)
    }

    /// Score for `address`, falling back to a degraded zero score when the
    /// reputation API cannot be reached. Zero grants nothing, so gated
    /// actions stay closed while public content remains readable.
    pub async fn get_score(&self, address: &Address) -> IdentityScore {
        match self.fetch_score(address).await {
            Ok(score) => score,
            Err(e) => {
                warn!(address = %address, error = %e, "reputation unavailable, using degraded score");
                IdentityScore::degraded(address.clone())
            }
        }
    }

    /// Contribution of one stamp provider to the address's score.
    pub async fn get_stamp_detail(
        &self,
        address: &Address,
        provider: &str,
    ) -> ScoreResult<StampDetail> {
        let score = self.fetch_score(address).await?;
        let stamp = score
            .stamp(provider)
            .ok_or_else(|| ScoreError::StampNotFound {
                address: address.clone(),
                provider: provider.to_string(),
            })?;

        Ok(StampDetail {
            address: address.clone(),
            provider: stamp.provider.clone(),
            score: stamp.score,
        })
    }

    /// Compare the live score against an arbitrary threshold.
    pub async fn meets_threshold(
        &self,
        address: &Address,
        threshold: f64,
    ) -> ScoreResult<ThresholdCheck> {
        let score = self.fetch_score(address).await?;
        Ok(ThresholdCheck {
            address: address.clone(),
            score: score.score,
            threshold,
            meets_threshold: score.score >= threshold,
        })
    }

    /// Stamp providers known to the reputation source.
    pub async fn providers(&self) -> ScoreResult<Vec<serde_json::Value>> {
        retry_with_backoff(
            &self.retry,
            || async {
                tokio::time::timeout(self.timeout, self.source.list_providers())
                    .await
                    .map_err(|_| ScoreError::Timeout)?
            },
            ScoreError::is_retryable,
        )
        .await
    }
}
