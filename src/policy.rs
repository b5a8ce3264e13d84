//! Access policy: identity score → permitted actions.
//!
//! Pure and stateless. Thresholds come from `[policy]` in the config file;
//! the defaults below match the thresholds the network launched with.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Actions gated by identity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Publish,
    Vote,
    UploadEvidence,
    ReportAbuse,
    GrantAccess,
    EmergencyAlert,
    /// Add a chain-of-custody signature to evidence.
    Witness,
    CreateProposal,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        ActionKind::Publish,
        ActionKind::Vote,
        ActionKind::UploadEvidence,
        ActionKind::ReportAbuse,
        ActionKind::GrantAccess,
        ActionKind::EmergencyAlert,
        ActionKind::Witness,
        ActionKind::CreateProposal,
    ];
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Publish => "publish",
            Self::Vote => "vote",
            Self::UploadEvidence => "upload evidence",
            Self::ReportAbuse => "report abuse",
            Self::GrantAccess => "grant access",
            Self::EmergencyAlert => "emergency alert",
            Self::Witness => "witness",
            Self::CreateProposal => "create proposal",
        };
        f.write_str(name)
    }
}

/// Minimum score per action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyThresholds {
    pub publish: f64,
    pub vote: f64,
    pub upload_evidence: f64,
    pub report_abuse: f64,
    pub grant_access: f64,
    pub emergency_alert: f64,
    pub witness: f64,
    pub create_proposal: f64,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            publish: 15.0,
            vote: 10.0,
            upload_evidence: 20.0,
            report_abuse: 15.0,
            grant_access: 25.0,
            emergency_alert: 30.0,
            witness: 20.0,
            create_proposal: 15.0,
        }
    }
}

impl PolicyThresholds {
    pub fn threshold(&self, action: ActionKind) -> f64 {
        match action {
            ActionKind::Publish => self.publish,
            ActionKind::Vote => self.vote,
            ActionKind::UploadEvidence => self.upload_evidence,
            ActionKind::ReportAbuse => self.report_abuse,
            ActionKind::GrantAccess => self.grant_access,
            ActionKind::EmergencyAlert => self.emergency_alert,
            ActionKind::Witness => self.witness,
            ActionKind::CreateProposal => self.create_proposal,
        }
    }

    /// `true` when `score` meets the threshold for `action`.
    ///
    /// NaN scores are never permitted.
    pub fn is_permitted(&self, score: f64, action: ActionKind) -> bool {
        score >= self.threshold(action)
    }

    /// Like `is_permitted`, but returns a `Denied` explaining the shortfall.
    pub fn check(&self, score: f64, action: ActionKind) -> Result<(), Denied> {
        if self.is_permitted(score, action) {
            Ok(())
        } else {
            Err(Denied {
                action,
                score,
                required: self.threshold(action),
            })
        }
    }

    /// Every action the score unlocks.
    pub fn permitted_actions(&self, score: f64) -> Vec<ActionKind> {
        ActionKind::ALL
            .into_iter()
            .filter(|action| self.is_permitted(score, *action))
            .collect()
    }
}

/// Score below the policy threshold.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("insufficient identity score to {action}: have {score}, need {required}")]
pub struct Denied {
    pub action: ActionKind,
    pub score: f64,
    pub required: f64,
}
