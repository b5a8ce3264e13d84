use crate::identity::Address;
use crate::secrets::SecretHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A question put to the network. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Ordered; votes refer to options by index.
    pub options: Vec<String>,
    pub creator: Address,
    /// Unix millis.
    pub created_at: u64,
    /// Unix millis after which no vote is accepted.
    pub deadline: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Open,
    Closed,
    Tallied,
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Closed => f.write_str("closed"),
            Self::Tallied => f.write_str("tallied"),
        }
    }
}

/// Receipt for an accepted vote.
///
/// The option and weight exist only inside the secret behind `handle`;
/// the voter appears only as a peppered HMAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedVote {
    pub proposal_id: String,
    pub voter_hash: String,
    pub handle: SecretHandle,
    pub cast_at: u64,
}

/// Aggregate outcome. Never contains individual votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyResult {
    pub proposal_id: String,
    pub total_votes: u64,
    pub per_option_counts: Vec<u64>,
    /// Sum of voter weights per option.
    pub per_option_weight: Vec<f64>,
    pub tallied_at: u64,
}

impl TallyResult {
    /// Index of the option with the most votes; `None` on a tie or no votes.
    pub fn winner(&self) -> Option<usize> {
        let max = *self.per_option_counts.iter().max()?;
        if max == 0 {
            return None;
        }
        let mut leaders = self
            .per_option_counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == max);
        let (index, _) = leaders.next()?;
        if leaders.next().is_some() {
            None
        } else {
            Some(index)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAlert {
    pub sender: Address,
    pub severity: Severity,
    pub message: String,
    pub sent_at: u64,
}

/// A meeting put to a fixed set of participants, who each pick one of the
/// proposed times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: String,
    pub organizer: Address,
    pub title: String,
    pub description: String,
    /// Candidate start times, unix millis. Responses refer to them by index.
    pub proposed_times: Vec<u64>,
    pub participants: Vec<Address>,
    pub created_at: u64,
}

impl Meeting {
    pub fn is_invited(&self, address: &Address) -> bool {
        self.organizer == *address || self.participants.contains(address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingResponse {
    pub meeting_id: String,
    pub participant: Address,
    pub chosen_time: usize,
    pub responded_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub assignee: Address,
    pub created_by: Address,
    /// Unix millis.
    pub deadline: u64,
    /// Higher is more urgent.
    pub priority: u8,
    pub created_at: u64,
}

/// Envelope on the coordination topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationMessage {
    ProposalCreated(Proposal),
    /// Carries no choice and no voter identity.
    VoteCast { proposal_id: String, cast_at: u64 },
    TallyPublished(TallyResult),
    EmergencyAlert(EmergencyAlert),
    MeetingInvitation(Meeting),
    MeetingResponse(MeetingResponse),
    TaskAssigned(Task),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(counts: Vec<u64>) -> TallyResult {
        TallyResult {
            proposal_id: "p".to_string(),
            total_votes: counts.iter().sum(),
            per_option_weight: counts.iter().map(|c| *c as f64).collect(),
            per_option_counts: counts,
            tallied_at: 0,
        }
    }

    #[test]
    fn test_winner() {
        assert_eq!(result(vec![2, 1, 0]).winner(), Some(0));
        assert_eq!(result(vec![1, 1, 0]).winner(), None);
        assert_eq!(result(vec![0, 0]).winner(), None);
        assert_eq!(result(vec![]).winner(), None);
    }

    #[test]
    fn test_vote_cast_message_has_no_choice() {
        let msg = CoordinationMessage::VoteCast {
            proposal_id: "p".to_string(),
            cast_at: 1,
        };
        let json = serde_json::to_value(&msg).unwrap();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 3);
        assert!(json.get("option_index").is_none());
    }
}
