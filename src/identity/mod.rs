//! Identity scoring against the Human Passport reputation API.
//!
//! One identity model: the Human Passport score for an address, backed by
//! the stamps that produced it. The scorer never caches; callers that need
//! a cache hold the `IdentityScore` with their own TTL (see
//! `service::MemberSession`).

pub mod mock;
pub mod passport;
pub mod profile;
pub mod scorer;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub use mock::MockReputation;
pub use passport::PassportClient;
pub use profile::{IdentityProfile, PermissionSummary};
pub use scorer::IdentityScorer;

/// Wallet address. Compared case-insensitively (stored lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// One stamp's contribution to a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamp {
    pub provider: String,
    pub score: f64,
}

/// Score for one address at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityScore {
    pub address: Address,
    /// Always finite and ≥ 0.
    pub score: f64,
    pub passing: Option<bool>,
    pub threshold: Option<f64>,
    pub stamps: Vec<Stamp>,
    /// Unix millis when this score was obtained.
    pub computed_at: u64,
    /// Set when the reputation API could not be reached and `score` is the
    /// zero fallback.
    pub degraded: bool,
}

impl IdentityScore {
    /// Zero-score fallback used while the reputation API is unreachable.
    pub fn degraded(address: Address) -> Self {
        Self {
            address,
            score: 0.0,
            passing: None,
            threshold: None,
            stamps: Vec::new(),
            computed_at: crate::unix_millis(),
            degraded: true,
        }
    }

    pub fn stamp(&self, provider: &str) -> Option<&Stamp> {
        self.stamps
            .iter()
            .find(|s| s.provider.eq_ignore_ascii_case(provider))
    }
}

/// Raw score report as returned by `GET /v2/stamps/{scorer}/score/{address}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassportReport {
    pub address: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub score: f64,
    #[serde(default)]
    pub passing_score: Option<bool>,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub last_score_timestamp: Option<String>,
    #[serde(default)]
    pub expiration_timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient_score_map")]
    pub stamp_scores: BTreeMap<String, f64>,
}

impl PassportReport {
    /// Normalize into an `IdentityScore`, clamping garbage to zero.
    pub fn into_score(self, address: Address) -> IdentityScore {
        let score = if self.score.is_finite() && self.score > 0.0 {
            self.score
        } else {
            0.0
        };

        IdentityScore {
            address,
            score,
            passing: self.passing_score,
            threshold: self.threshold,
            stamps: self
                .stamp_scores
                .into_iter()
                .map(|(provider, score)| Stamp { provider, score })
                .collect(),
            computed_at: crate::unix_millis(),
            degraded: false,
        }
    }
}

/// Detail for a single stamp provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampDetail {
    pub address: Address,
    pub provider: String,
    pub score: f64,
}

/// Outcome of a threshold check against a live score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    pub address: Address,
    pub score: f64,
    pub threshold: f64,
    pub meets_threshold: bool,
}

/// Result type for reputation operations.
pub type ScoreResult<T> = Result<T, ScoreError>;

/// Reputation API errors.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("Reputation API unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Reputation API rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Reputation API timed out")]
    Timeout,

    #[error("Malformed reputation response: {0}")]
    Decode(String),

    #[error("No {provider} stamp found for {address}")]
    StampNotFound { address: Address, provider: String },

    #[error("Reputation API not configured: {0}")]
    NotConfigured(String),
}

impl ScoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_) | Self::Timeout)
    }
}

/// Source of reputation reports (the Human Passport API in production).
#[async_trait]
pub trait ReputationSource: Send + Sync {
    /// Fetch the score report for `address`.
    async fn fetch_report(&self, address: &Address) -> ScoreResult<PassportReport>;

    /// List the stamp providers the scorer knows about.
    async fn list_providers(&self) -> ScoreResult<Vec<serde_json::Value>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(f64),
    Text(String),
}

impl NumberOrString {
    fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            Self::Number(n) => Ok(n),
            Self::Text(s) => s.trim().parse::<f64>().map_err(E::custom),
        }
    }
}

// The API reports decimals as strings ("22.514") in some versions.
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    NumberOrString::deserialize(deserializer)?.into_f64()
}

fn lenient_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    match Option::<NumberOrString>::deserialize(deserializer)? {
        Some(value) => value.into_f64().map(Some),
        None => Ok(None),
    }
}

fn lenient_score_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, f64>, D::Error> {
    let raw = Option::<BTreeMap<String, NumberOrString>>::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(provider, value)| value.into_f64().map(|score| (provider, score)))
        .collect()
}
