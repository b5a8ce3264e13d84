//! Private tally engine.
//!
//! Each vote becomes a compute-only secret: a vector with a one-hot count
//! for the chosen option followed by the voter's weight (in thousandths) at
//! the same position. Nobody can read a single vote back; the tally program
//! sums them share-wise and only the totals are reconstructed.
//!
//! Proposals live in a sharded map. No shard lock is held across an
//! `.await`: a vote reserves its voter slot, stores the secret, then
//! re-checks the proposal state before committing.
//!
//! The same engine carries the rest of the coordination topic: emergency
//! alerts, meeting invitations and responses, and task assignments. Those
//! are plain broadcasts; a record is kept only once it has gone out.

use super::types::*;
use crate::config::TimeoutConfig;
use crate::crypto::record_id;
use crate::identity::Address;
use crate::retry::{retry_with_backoff, with_timeout, RetryPolicy};
use crate::secrets::{AccessPolicy, Program, SecretBackend, SecretError, SecretHandle, SecretValue};
use crate::serialization::{to_cbor, SerializationError};
use crate::transport::{GossipTransport, TransportError, COORDINATION_TOPIC};
use dashmap::DashMap;
use ring::hmac;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Weights are stored as integer thousandths.
const WEIGHT_SCALE: f64 = 1000.0;

/// Largest accepted voter weight. Keeps scaled weights, and their sums
/// over any realistic number of votes, well inside `u64`.
pub const MAX_VOTER_WEIGHT: f64 = 1_000_000.0;

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("Proposal {0} not found")]
    NotFound(String),

    #[error("Proposal {0} is closed to voting")]
    ProposalClosed(String),

    #[error("Proposal {0} has already been tallied")]
    AlreadyTallied(String),

    #[error("Proposal {id} is {state}; close it before tallying")]
    NotClosed { id: String, state: ProposalState },

    #[error("Proposal {id} has not been tallied (state: {state})")]
    NotTallied { id: String, state: ProposalState },

    #[error("Option {index} does not exist (proposal has {options} options)")]
    InvalidOption { index: usize, options: usize },

    #[error("Only the creator of proposal {id} may close it early, not {requester}")]
    NotCreator { id: String, requester: Address },

    #[error("Voter has already voted on proposal {0}")]
    DuplicateVote(String),

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Invalid voter weight {0}")]
    InvalidWeight(f64),

    #[error("Meeting {0} not found")]
    MeetingNotFound(String),

    #[error("{participant} is not invited to meeting {meeting_id}")]
    NotInvited {
        meeting_id: String,
        participant: Address,
    },

    #[error("Time {index} does not exist (meeting has {times} proposed times)")]
    InvalidTime { index: usize, times: usize },

    #[error("Invalid meeting: {0}")]
    InvalidMeeting(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Compute backend unavailable: {0}")]
    ComputeUnavailable(String),

    #[error("Compute backend error: {0}")]
    Compute(SecretError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl TallyError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ComputeUnavailable(_) => true,
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<SecretError> for TallyError {
    fn from(e: SecretError) -> Self {
        if e.is_retryable() {
            Self::ComputeUnavailable(e.to_string())
        } else {
            Self::Compute(e)
        }
    }
}

pub type TallyOutcome<T> = Result<T, TallyError>;

struct ProposalEntry {
    proposal: Proposal,
    state: ProposalState,
    votes: Vec<EncryptedVote>,
    /// Voter hashes with a committed or in-flight vote.
    voters: HashSet<String>,
    tallying: bool,
    result: Option<TallyResult>,
}

impl ProposalEntry {
    /// Apply the deadline: an open proposal past it is closed.
    fn refresh(&mut self, now: u64) -> ProposalState {
        if self.state == ProposalState::Open && now >= self.proposal.deadline {
            self.state = ProposalState::Closed;
            info!(proposal = %self.proposal.id, "voting deadline passed, proposal closed");
        }
        self.state
    }
}

struct MeetingEntry {
    meeting: Meeting,
    /// Latest response per participant.
    responses: BTreeMap<Address, MeetingResponse>,
}

pub struct PrivateTallyEngine {
    secrets: Arc<dyn SecretBackend>,
    transport: Arc<dyn GossipTransport>,
    proposals: DashMap<String, ProposalEntry>,
    meetings: DashMap<String, MeetingEntry>,
    tasks: DashMap<String, Task>,
    pepper: Zeroizing<[u8; 32]>,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
}

impl PrivateTallyEngine {
    pub fn new(
        secrets: Arc<dyn SecretBackend>,
        transport: Arc<dyn GossipTransport>,
        voter_pepper: &[u8; 32],
        timeouts: TimeoutConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            secrets,
            transport,
            proposals: DashMap::new(),
            meetings: DashMap::new(),
            tasks: DashMap::new(),
            pepper: Zeroizing::new(*voter_pepper),
            timeouts,
            retry,
        }
    }

    /// Peppered HMAC of (proposal, voter). Raw addresses are never stored.
    fn voter_hash(&self, proposal_id: &str, voter: &Address) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.pepper[..]);
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(proposal_id.as_bytes());
        ctx.update(&[0]);
        ctx.update(voter.as_str().as_bytes());
        hex::encode(ctx.sign().as_ref())
    }

    async fn announce(&self, message: &CoordinationMessage) -> TallyOutcome<()> {
        let payload = to_cbor(message)?;
        retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.transport,
                    self.transport.publish(COORDINATION_TOPIC, payload.clone()),
                    || TransportError::Timeout,
                )
            },
            TransportError::is_retryable,
        )
        .await?;
        Ok(())
    }

    /// Create and announce a proposal open for `voting_period`.
    pub async fn create_proposal(
        &self,
        creator: &Address,
        title: &str,
        description: &str,
        options: Vec<String>,
        voting_period: Duration,
    ) -> TallyOutcome<Proposal> {
        if title.trim().is_empty() {
            return Err(TallyError::InvalidProposal("title is empty".to_string()));
        }
        if options.is_empty() {
            return Err(TallyError::InvalidProposal("no options".to_string()));
        }
        if options.iter().any(|o| o.trim().is_empty()) {
            return Err(TallyError::InvalidProposal("blank option".to_string()));
        }
        let unique: HashSet<&String> = options.iter().collect();
        if unique.len() != options.len() {
            return Err(TallyError::InvalidProposal("duplicate option".to_string()));
        }

        let created_at = crate::unix_millis();
        let id_source = format!("{}\n{}\n{}", title, description, options.join("\n"));
        let proposal = Proposal {
            id: record_id(id_source.as_bytes(), creator, created_at),
            title: title.to_string(),
            description: description.to_string(),
            options,
            creator: creator.clone(),
            created_at,
            deadline: created_at
                .saturating_add(u64::try_from(voting_period.as_millis()).unwrap_or(u64::MAX)),
        };

        self.announce(&CoordinationMessage::ProposalCreated(proposal.clone()))
            .await?;

        self.proposals.insert(
            proposal.id.clone(),
            ProposalEntry {
                proposal: proposal.clone(),
                state: ProposalState::Open,
                votes: Vec::new(),
                voters: HashSet::new(),
                tallying: false,
                result: None,
            },
        );

        info!(proposal = %proposal.id, options = proposal.options.len(), "proposal created");
        Ok(proposal)
    }

    pub fn proposal(&self, proposal_id: &str) -> TallyOutcome<Proposal> {
        self.proposals
            .get(proposal_id)
            .map(|entry| entry.proposal.clone())
            .ok_or_else(|| TallyError::NotFound(proposal_id.to_string()))
    }

    pub fn list_proposals(&self) -> Vec<(Proposal, ProposalState)> {
        let now = crate::unix_millis();
        let mut list: Vec<_> = self
            .proposals
            .iter_mut()
            .map(|mut entry| {
                let state = entry.refresh(now);
                (entry.proposal.clone(), state)
            })
            .collect();
        list.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
        list
    }

    pub fn state(&self, proposal_id: &str) -> TallyOutcome<ProposalState> {
        let mut entry = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| TallyError::NotFound(proposal_id.to_string()))?;
        Ok(entry.refresh(crate::unix_millis()))
    }

    pub fn has_voted(&self, proposal_id: &str, voter: &Address) -> bool {
        let hash = self.voter_hash(proposal_id, voter);
        self.proposals
            .get(proposal_id)
            .map(|entry| entry.votes.iter().any(|v| v.voter_hash == hash))
            .unwrap_or(false)
    }

    /// Number of accepted votes.
    pub fn vote_count(&self, proposal_id: &str) -> TallyOutcome<usize> {
        self.proposals
            .get(proposal_id)
            .map(|entry| entry.votes.len())
            .ok_or_else(|| TallyError::NotFound(proposal_id.to_string()))
    }

    /// Cast one vote. A voter gets one vote per proposal.
    pub async fn cast_vote(
        &self,
        proposal_id: &str,
        voter: &Address,
        option_index: usize,
        voter_weight: f64,
    ) -> TallyOutcome<EncryptedVote> {
        if !voter_weight.is_finite() || !(0.0..=MAX_VOTER_WEIGHT).contains(&voter_weight) {
            return Err(TallyError::InvalidWeight(voter_weight));
        }
        let voter_hash = self.voter_hash(proposal_id, voter);

        // Reserve the voter slot; the shard lock is released before any await
        let option_count = {
            let mut entry = self
                .proposals
                .get_mut(proposal_id)
                .ok_or_else(|| TallyError::NotFound(proposal_id.to_string()))?;
            if entry.refresh(crate::unix_millis()) != ProposalState::Open {
                return Err(TallyError::ProposalClosed(proposal_id.to_string()));
            }
            let options = entry.proposal.options.len();
            if option_index >= options {
                return Err(TallyError::InvalidOption {
                    index: option_index,
                    options,
                });
            }
            if !entry.voters.insert(voter_hash.clone()) {
                warn!(proposal = %proposal_id, "duplicate vote rejected");
                return Err(TallyError::DuplicateVote(proposal_id.to_string()));
            }
            options
        };

        let mut encoded = vec![0u64; option_count * 2];
        encoded[option_index] = 1;
        encoded[option_count + option_index] = (voter_weight * WEIGHT_SCALE).round() as u64;

        let stored = retry_with_backoff(
            &self.retry,
            || {
                with_timeout(
                    self.timeouts.compute,
                    self.secrets.store_secret(
                        SecretValue::Vector(encoded.clone()),
                        AccessPolicy::compute_only(Program::Tally),
                    ),
                    || SecretError::Timeout,
                )
            },
            SecretError::is_retryable,
        )
        .await;

        let handle = match stored {
            Ok(handle) => handle,
            Err(e) => {
                self.release_voter(proposal_id, &voter_hash);
                warn!(proposal = %proposal_id, error = %e, "vote could not be stored");
                return Err(e.into());
            }
        };

        let vote = EncryptedVote {
            proposal_id: proposal_id.to_string(),
            voter_hash: voter_hash.clone(),
            handle,
            cast_at: crate::unix_millis(),
        };

        // Commit only if the proposal is still open
        {
            let mut entry = self
                .proposals
                .get_mut(proposal_id)
                .ok_or_else(|| TallyError::NotFound(proposal_id.to_string()))?;
            if entry.refresh(crate::unix_millis()) != ProposalState::Open {
                entry.voters.remove(&voter_hash);
                warn!(proposal = %proposal_id, "proposal closed while vote was in flight");
                return Err(TallyError::ProposalClosed(proposal_id.to_string()));
            }
            entry.votes.push(vote.clone());
        }

        info!(proposal = %proposal_id, "vote accepted");

        let notice = CoordinationMessage::VoteCast {
            proposal_id: proposal_id.to_string(),
            cast_at: vote.cast_at,
        };
        if let Err(e) = self.announce(&notice).await {
            warn!(proposal = %proposal_id, error = %e, "vote-cast notice not broadcast");
        }

        Ok(vote)
    }

    fn release_voter(&self, proposal_id: &str, voter_hash: &str) {
        if let Some(mut entry) = self.proposals.get_mut(proposal_id) {
            entry.voters.remove(voter_hash);
        }
    }

    /// Stop accepting votes. Before the deadline only the creator may close
    /// a proposal; afterwards it is already closed and this is a no-op.
    pub fn close_proposal(&self, proposal_id: &str, requester: &Address) -> TallyOutcome<()> {
        let mut entry = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| TallyError::NotFound(proposal_id.to_string()))?;
        match entry.refresh(crate::unix_millis()) {
            ProposalState::Open if entry.proposal.creator != *requester => {
                warn!(proposal = %proposal_id, requester = %requester, "early close refused");
                Err(TallyError::NotCreator {
                    id: proposal_id.to_string(),
                    requester: requester.clone(),
                })
            }
            ProposalState::Open => {
                entry.state = ProposalState::Closed;
                info!(proposal = %proposal_id, votes = entry.votes.len(), "proposal closed");
                Ok(())
            }
            ProposalState::Closed => Ok(()),
            ProposalState::Tallied => Err(TallyError::AlreadyTallied(proposal_id.to_string())),
        }
    }

    /// Run the tally program over a closed proposal. Succeeds once.
    pub async fn tally(&self, proposal_id: &str) -> TallyOutcome<TallyResult> {
        let (handles, option_count) = {
            let mut entry = self
                .proposals
                .get_mut(proposal_id)
                .ok_or_else(|| TallyError::NotFound(proposal_id.to_string()))?;
            match entry.refresh(crate::unix_millis()) {
                ProposalState::Open => {
                    return Err(TallyError::NotClosed {
                        id: proposal_id.to_string(),
                        state: ProposalState::Open,
                    })
                }
                ProposalState::Tallied => {
                    return Err(TallyError::AlreadyTallied(proposal_id.to_string()))
                }
                ProposalState::Closed if entry.tallying => {
                    return Err(TallyError::AlreadyTallied(proposal_id.to_string()))
                }
                ProposalState::Closed => {}
            }
            entry.tallying = true;
            let handles: Vec<SecretHandle> = entry.votes.iter().map(|v| v.handle.clone()).collect();
            (handles, entry.proposal.options.len())
        };

        let computed = if handles.is_empty() {
            Ok(vec![0u64; option_count * 2])
        } else {
            retry_with_backoff(
                &self.retry,
                || {
                    with_timeout(
                        self.timeouts.compute,
                        self.secrets.compute(Program::Tally, &handles),
                        || SecretError::Timeout,
                    )
                },
                SecretError::is_retryable,
            )
            .await
        };

        let totals = match computed {
            Ok(totals) if totals.len() == option_count * 2 => totals,
            Ok(totals) => {
                self.abort_tally(proposal_id);
                return Err(TallyError::Compute(SecretError::InvalidInput(format!(
                    "tally returned {} values, expected {}",
                    totals.len(),
                    option_count * 2
                ))));
            }
            Err(e) => {
                self.abort_tally(proposal_id);
                warn!(proposal = %proposal_id, error = %e, "tally computation failed");
                return Err(e.into());
            }
        };

        let per_option_counts = totals[..option_count].to_vec();
        let per_option_weight = totals[option_count..]
            .iter()
            .map(|w| *w as f64 / WEIGHT_SCALE)
            .collect();
        let result = TallyResult {
            proposal_id: proposal_id.to_string(),
            total_votes: handles.len() as u64,
            per_option_counts,
            per_option_weight,
            tallied_at: crate::unix_millis(),
        };

        if let Some(mut entry) = self.proposals.get_mut(proposal_id) {
            entry.state = ProposalState::Tallied;
            entry.tallying = false;
            entry.result = Some(result.clone());
        }

        info!(
            proposal = %proposal_id,
            total_votes = result.total_votes,
            "tally computed"
        );

        if let Err(e) = self
            .announce(&CoordinationMessage::TallyPublished(result.clone()))
            .await
        {
            warn!(proposal = %proposal_id, error = %e, "tally result not broadcast");
        }
        Ok(result)
    }

    fn abort_tally(&self, proposal_id: &str) {
        if let Some(mut entry) = self.proposals.get_mut(proposal_id) {
            entry.tallying = false;
        }
    }

    /// Stored result of a completed tally.
    pub fn results(&self, proposal_id: &str) -> TallyOutcome<TallyResult> {
        let entry = self
            .proposals
            .get(proposal_id)
            .ok_or_else(|| TallyError::NotFound(proposal_id.to_string()))?;
        entry.result.clone().ok_or_else(|| TallyError::NotTallied {
            id: proposal_id.to_string(),
            state: entry.state,
        })
    }

    /// Broadcast an emergency alert on the coordination topic.
    pub async fn emergency_alert(
        &self,
        sender: &Address,
        severity: Severity,
        message: &str,
    ) -> TallyOutcome<EmergencyAlert> {
        let alert = EmergencyAlert {
            sender: sender.clone(),
            severity,
            message: message.to_string(),
            sent_at: crate::unix_millis(),
        };
        self.announce(&CoordinationMessage::EmergencyAlert(alert.clone()))
            .await?;
        debug!(?severity, "emergency alert broadcast");
        Ok(alert)
    }

    /// Invite `participants` to pick one of `proposed_times`.
    pub async fn schedule_meeting(
        &self,
        organizer: &Address,
        title: &str,
        description: &str,
        proposed_times: Vec<u64>,
        participants: Vec<Address>,
    ) -> TallyOutcome<Meeting> {
        if title.trim().is_empty() {
            return Err(TallyError::InvalidMeeting("title is empty".to_string()));
        }
        if proposed_times.is_empty() {
            return Err(TallyError::InvalidMeeting("no proposed times".to_string()));
        }
        if participants.is_empty() {
            return Err(TallyError::InvalidMeeting("no participants".to_string()));
        }
        let unique: HashSet<&Address> = participants.iter().collect();
        if unique.len() != participants.len() {
            return Err(TallyError::InvalidMeeting("duplicate participant".to_string()));
        }

        let created_at = crate::unix_millis();
        let meeting = Meeting {
            id: record_id(title.as_bytes(), organizer, created_at),
            organizer: organizer.clone(),
            title: title.to_string(),
            description: description.to_string(),
            proposed_times,
            participants,
            created_at,
        };

        self.announce(&CoordinationMessage::MeetingInvitation(meeting.clone()))
            .await?;

        self.meetings.insert(
            meeting.id.clone(),
            MeetingEntry {
                meeting: meeting.clone(),
                responses: BTreeMap::new(),
            },
        );
        info!(meeting = %meeting.id, participants = meeting.participants.len(), "meeting scheduled");
        Ok(meeting)
    }

    /// Record `participant`'s choice of time. A later response replaces an
    /// earlier one.
    pub async fn respond_to_meeting(
        &self,
        meeting_id: &str,
        participant: &Address,
        chosen_time: usize,
    ) -> TallyOutcome<MeetingResponse> {
        {
            let entry = self
                .meetings
                .get(meeting_id)
                .ok_or_else(|| TallyError::MeetingNotFound(meeting_id.to_string()))?;
            if !entry.meeting.is_invited(participant) {
                return Err(TallyError::NotInvited {
                    meeting_id: meeting_id.to_string(),
                    participant: participant.clone(),
                });
            }
            let times = entry.meeting.proposed_times.len();
            if chosen_time >= times {
                return Err(TallyError::InvalidTime {
                    index: chosen_time,
                    times,
                });
            }
        }

        let response = MeetingResponse {
            meeting_id: meeting_id.to_string(),
            participant: participant.clone(),
            chosen_time,
            responded_at: crate::unix_millis(),
        };
        self.announce(&CoordinationMessage::MeetingResponse(response.clone()))
            .await?;

        if let Some(mut entry) = self.meetings.get_mut(meeting_id) {
            entry
                .responses
                .insert(participant.clone(), response.clone());
        }
        debug!(meeting = %meeting_id, chosen_time, "meeting response recorded");
        Ok(response)
    }

    pub fn meeting(&self, meeting_id: &str) -> TallyOutcome<Meeting> {
        self.meetings
            .get(meeting_id)
            .map(|entry| entry.meeting.clone())
            .ok_or_else(|| TallyError::MeetingNotFound(meeting_id.to_string()))
    }

    /// Responses per proposed time, in the order the times were proposed.
    pub fn meeting_counts(&self, meeting_id: &str) -> TallyOutcome<Vec<usize>> {
        let entry = self
            .meetings
            .get(meeting_id)
            .ok_or_else(|| TallyError::MeetingNotFound(meeting_id.to_string()))?;
        let mut counts = vec![0; entry.meeting.proposed_times.len()];
        for response in entry.responses.values() {
            counts[response.chosen_time] += 1;
        }
        Ok(counts)
    }

    /// Assign a task and announce it to the network.
    pub async fn assign_task(
        &self,
        created_by: &Address,
        title: &str,
        assignee: &Address,
        deadline: u64,
        priority: u8,
    ) -> TallyOutcome<Task> {
        if title.trim().is_empty() {
            return Err(TallyError::InvalidTask("title is empty".to_string()));
        }
        let created_at = crate::unix_millis();
        if deadline <= created_at {
            return Err(TallyError::InvalidTask("deadline has passed".to_string()));
        }

        let task = Task {
            id: record_id(title.as_bytes(), created_by, created_at),
            title: title.to_string(),
            assignee: assignee.clone(),
            created_by: created_by.clone(),
            deadline,
            priority,
            created_at,
        };
        self.announce(&CoordinationMessage::TaskAssigned(task.clone()))
            .await?;

        self.tasks.insert(task.id.clone(), task.clone());
        info!(task = %task.id, assignee = %assignee, priority, "task assigned");
        Ok(task)
    }

    /// Tasks assigned to `assignee`, most urgent first, then by deadline.
    pub fn tasks_for(&self, assignee: &Address) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|task| task.value().assignee == *assignee)
            .map(|task| task.value().clone())
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.deadline.cmp(&b.deadline))
        });
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::LocalSecretVault;
    use crate::serialization::from_cbor;
    use crate::transport::InMemoryGossip;
    use proptest::prelude::*;

    struct Harness {
        secrets: LocalSecretVault,
        gossip: InMemoryGossip,
        engine: PrivateTallyEngine,
    }

    fn harness() -> Harness {
        harness_with(TimeoutConfig::default())
    }

    fn harness_with(timeouts: TimeoutConfig) -> Harness {
        let secrets = LocalSecretVault::new(3);
        let gossip = InMemoryGossip::new(100);
        let engine = PrivateTallyEngine::new(
            Arc::new(secrets.clone()),
            Arc::new(gossip.clone()),
            &[9u8; 32],
            timeouts,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        );
        Harness {
            secrets,
            gossip,
            engine,
        }
    }

    fn yes_no_abstain() -> Vec<String> {
        vec!["Yes".to_string(), "No".to_string(), "Abstain".to_string()]
    }

    async fn open_proposal(engine: &PrivateTallyEngine) -> Proposal {
        engine
            .create_proposal(
                &Address::new("0xcreator"),
                "Move the march",
                "Start at the park instead",
                yes_no_abstain(),
                Duration::from_secs(3600),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_yes_no_abstain_tally() {
        let h = harness();
        let p = open_proposal(&h.engine).await;

        h.engine.cast_vote(&p.id, &Address::new("0xa"), 0, 1.0).await.unwrap();
        h.engine.cast_vote(&p.id, &Address::new("0xb"), 0, 2.5).await.unwrap();
        h.engine.cast_vote(&p.id, &Address::new("0xc"), 1, 1.0).await.unwrap();

        h.engine.close_proposal(&p.id, &p.creator).unwrap();
        let result = h.engine.tally(&p.id).await.unwrap();

        assert_eq!(result.total_votes, 3);
        assert_eq!(result.per_option_counts, vec![2, 1, 0]);
        assert_eq!(result.per_option_weight, vec![3.5, 1.0, 0.0]);
        assert_eq!(result.winner(), Some(0));
    }

    #[tokio::test]
    async fn test_duplicate_vote_rejected() {
        let h = harness();
        let p = open_proposal(&h.engine).await;
        let voter = Address::new("0xa");

        h.engine.cast_vote(&p.id, &voter, 0, 1.0).await.unwrap();
        let err = h.engine.cast_vote(&p.id, &Address::new("0xA"), 1, 1.0).await.unwrap_err();
        assert!(matches!(err, TallyError::DuplicateVote(_)));
        assert_eq!(h.engine.vote_count(&p.id).unwrap(), 1);
        assert!(h.engine.has_voted(&p.id, &voter));
    }

    #[tokio::test]
    async fn test_only_creator_closes_early() {
        let h = harness();
        let p = open_proposal(&h.engine).await;

        let err = h
            .engine
            .close_proposal(&p.id, &Address::new("0xmallory"))
            .unwrap_err();
        assert!(matches!(err, TallyError::NotCreator { .. }));
        assert_eq!(h.engine.state(&p.id).unwrap(), ProposalState::Open);

        h.engine.close_proposal(&p.id, &Address::new("0xCreator")).unwrap();
        assert_eq!(h.engine.state(&p.id).unwrap(), ProposalState::Closed);
    }

    #[tokio::test]
    async fn test_vote_after_close_rejected() {
        let h = harness();
        let p = open_proposal(&h.engine).await;
        h.engine.close_proposal(&p.id, &p.creator).unwrap();

        let err = h.engine.cast_vote(&p.id, &Address::new("0xa"), 0, 1.0).await.unwrap_err();
        assert!(matches!(err, TallyError::ProposalClosed(_)));
    }

    #[tokio::test]
    async fn test_deadline_closes_proposal() {
        let h = harness();
        let p = h
            .engine
            .create_proposal(
                &Address::new("0xc"),
                "Quick",
                "",
                vec!["A".to_string()],
                Duration::ZERO,
            )
            .await
            .unwrap();

        assert_eq!(h.engine.state(&p.id).unwrap(), ProposalState::Closed);
        let err = h.engine.cast_vote(&p.id, &Address::new("0xa"), 0, 1.0).await.unwrap_err();
        assert!(matches!(err, TallyError::ProposalClosed(_)));
        // Deadline-closed proposals can be tallied directly
        assert_eq!(h.engine.tally(&p.id).await.unwrap().total_votes, 0);
    }

    #[tokio::test]
    async fn test_huge_voting_period_saturates_deadline() {
        let h = harness();
        let p = h
            .engine
            .create_proposal(
                &Address::new("0xc"),
                "Forever",
                "",
                vec!["A".to_string()],
                Duration::MAX,
            )
            .await
            .unwrap();
        assert_eq!(p.deadline, u64::MAX);
        assert_eq!(h.engine.state(&p.id).unwrap(), ProposalState::Open);
    }

    #[tokio::test]
    async fn test_max_weight_tallies_exactly() {
        let h = harness();
        let p = open_proposal(&h.engine).await;
        h.engine
            .cast_vote(&p.id, &Address::new("0xa"), 0, MAX_VOTER_WEIGHT)
            .await
            .unwrap();
        h.engine.close_proposal(&p.id, &p.creator).unwrap();
        let result = h.engine.tally(&p.id).await.unwrap();
        assert_eq!(result.per_option_weight[0], MAX_VOTER_WEIGHT);
    }

    #[tokio::test]
    async fn test_tally_twice_fails_but_results_remain() {
        let h = harness();
        let p = open_proposal(&h.engine).await;
        h.engine.cast_vote(&p.id, &Address::new("0xa"), 2, 1.0).await.unwrap();
        h.engine.close_proposal(&p.id, &p.creator).unwrap();

        let first = h.engine.tally(&p.id).await.unwrap();
        let err = h.engine.tally(&p.id).await.unwrap_err();
        assert!(matches!(err, TallyError::AlreadyTallied(_)));
        assert_eq!(h.engine.results(&p.id).unwrap(), first);
        assert_eq!(h.engine.state(&p.id).unwrap(), ProposalState::Tallied);
    }

    #[tokio::test]
    async fn test_tally_requires_closed() {
        let h = harness();
        let p = open_proposal(&h.engine).await;
        assert!(matches!(
            h.engine.tally(&p.id).await,
            Err(TallyError::NotClosed { .. })
        ));
        assert!(matches!(
            h.engine.results(&p.id),
            Err(TallyError::NotTallied { .. })
        ));
    }

    #[tokio::test]
    async fn test_compute_outage_is_retryable_and_recoverable() {
        let h = harness();
        let p = open_proposal(&h.engine).await;
        h.engine.cast_vote(&p.id, &Address::new("0xa"), 0, 1.0).await.unwrap();
        h.engine.close_proposal(&p.id, &p.creator).unwrap();

        h.secrets.set_offline(true);
        let err = h.engine.tally(&p.id).await.unwrap_err();
        assert!(matches!(err, TallyError::ComputeUnavailable(_)));
        assert!(err.is_retryable());

        h.secrets.set_offline(false);
        assert_eq!(h.engine.tally(&p.id).await.unwrap().total_votes, 1);
    }

    #[tokio::test]
    async fn test_failed_store_releases_voter_slot() {
        let h = harness();
        let p = open_proposal(&h.engine).await;
        let voter = Address::new("0xa");

        h.secrets.set_offline(true);
        assert!(h.engine.cast_vote(&p.id, &voter, 0, 1.0).await.is_err());
        h.secrets.set_offline(false);
        assert!(h.engine.cast_vote(&p.id, &voter, 0, 1.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_timed_out_vote_is_not_counted() {
        let h = harness_with(TimeoutConfig {
            compute: Duration::from_millis(50),
            ..TimeoutConfig::default()
        });
        let p = open_proposal(&h.engine).await;
        let voter = Address::new("0xa");

        h.secrets.set_stalled(true);
        let err = h.engine.cast_vote(&p.id, &voter, 0, 1.0).await.unwrap_err();
        assert!(matches!(err, TallyError::ComputeUnavailable(_)));
        assert_eq!(h.engine.vote_count(&p.id).unwrap(), 0);
        assert!(!h.engine.has_voted(&p.id, &voter));

        h.secrets.set_stalled(false);
        h.engine.cast_vote(&p.id, &voter, 0, 1.0).await.unwrap();
        assert_eq!(h.engine.vote_count(&p.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let h = harness();
        let p = open_proposal(&h.engine).await;
        assert!(matches!(
            h.engine.cast_vote(&p.id, &Address::new("0xa"), 3, 1.0).await,
            Err(TallyError::InvalidOption { index: 3, options: 3 })
        ));
        assert!(matches!(
            h.engine.cast_vote(&p.id, &Address::new("0xa"), 0, f64::NAN).await,
            Err(TallyError::InvalidWeight(_))
        ));
        assert!(matches!(
            h.engine.cast_vote(&p.id, &Address::new("0xa"), 0, 1e300).await,
            Err(TallyError::InvalidWeight(_))
        ));
        assert!(matches!(
            h.engine.cast_vote(&p.id, &Address::new("0xa"), 0, -1.0).await,
            Err(TallyError::InvalidWeight(_))
        ));
        assert!(matches!(
            h.engine.cast_vote("missing", &Address::new("0xa"), 0, 1.0).await,
            Err(TallyError::NotFound(_))
        ));
        assert!(matches!(
            h.engine
                .create_proposal(&Address::new("0xc"), "T", "", vec![], Duration::from_secs(1))
                .await,
            Err(TallyError::InvalidProposal(_))
        ));
    }

    #[tokio::test]
    async fn test_announcements_carry_no_choice() {
        let h = harness();
        let p = open_proposal(&h.engine).await;
        h.engine.cast_vote(&p.id, &Address::new("0xa"), 1, 1.0).await.unwrap();

        let history = h.gossip.query_history(COORDINATION_TOPIC, 10).await.unwrap();
        let messages: Vec<CoordinationMessage> =
            history.iter().map(|b| from_cbor(b).unwrap()).collect();

        assert!(matches!(messages[0], CoordinationMessage::VoteCast { .. }));
        assert!(matches!(messages[1], CoordinationMessage::ProposalCreated(_)));
    }

    #[tokio::test]
    async fn test_concurrent_votes() {
        let h = Arc::new(harness());
        let p = open_proposal(&h.engine).await;

        let mut tasks = Vec::new();
        for i in 0..20 {
            let h = h.clone();
            let id = p.id.clone();
            tasks.push(tokio::spawn(async move {
                h.engine
                    .cast_vote(&id, &Address::new(format!("0x{:02}", i)), i % 3, 1.0)
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        h.engine.close_proposal(&p.id, &p.creator).unwrap();
        let result = h.engine.tally(&p.id).await.unwrap();
        assert_eq!(result.total_votes, 20);
        assert_eq!(result.per_option_counts, vec![7, 7, 6]);
    }

    #[tokio::test]
    async fn test_emergency_alert_broadcast() {
        let h = harness();
        let alert = h
            .engine
            .emergency_alert(&Address::new("0xa"), Severity::Critical, "Police at the bridge")
            .await
            .unwrap();
        let history = h.gossip.query_history(COORDINATION_TOPIC, 1).await.unwrap();
        let message: CoordinationMessage = from_cbor(&history[0]).unwrap();
        assert_eq!(message, CoordinationMessage::EmergencyAlert(alert));
    }

    #[tokio::test]
    async fn test_meeting_invitation_and_responses() {
        let h = harness();
        let organizer = Address::new("0xorganizer");
        let (ana, ben) = (Address::new("0xana"), Address::new("0xben"));

        let meeting = h
            .engine
            .schedule_meeting(
                &organizer,
                "Legal briefing",
                "Before Saturday",
                vec![1_000, 2_000, 3_000],
                vec![ana.clone(), ben.clone()],
            )
            .await
            .unwrap();

        h.engine.respond_to_meeting(&meeting.id, &ana, 1).await.unwrap();
        h.engine.respond_to_meeting(&meeting.id, &ben, 0).await.unwrap();
        // Changing one's mind replaces the earlier choice
        h.engine.respond_to_meeting(&meeting.id, &ben, 1).await.unwrap();
        assert_eq!(h.engine.meeting_counts(&meeting.id).unwrap(), vec![0, 2, 0]);

        let history = h.gossip.query_history(COORDINATION_TOPIC, 10).await.unwrap();
        let messages: Vec<CoordinationMessage> =
            history.iter().map(|b| from_cbor(b).unwrap()).collect();
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], CoordinationMessage::MeetingResponse(_)));
        assert_eq!(messages[3], CoordinationMessage::MeetingInvitation(meeting));
    }

    #[tokio::test]
    async fn test_meeting_response_validation() {
        let h = harness();
        let ana = Address::new("0xana");
        let meeting = h
            .engine
            .schedule_meeting(&Address::new("0xo"), "Sync", "", vec![1], vec![ana.clone()])
            .await
            .unwrap();

        assert!(matches!(
            h.engine
                .respond_to_meeting(&meeting.id, &Address::new("0xstranger"), 0)
                .await,
            Err(TallyError::NotInvited { .. })
        ));
        assert!(matches!(
            h.engine.respond_to_meeting(&meeting.id, &ana, 1).await,
            Err(TallyError::InvalidTime { index: 1, times: 1 })
        ));
        assert!(matches!(
            h.engine.respond_to_meeting("missing", &ana, 0).await,
            Err(TallyError::MeetingNotFound(_))
        ));
        assert!(matches!(
            h.engine
                .schedule_meeting(&Address::new("0xo"), "Sync", "", vec![], vec![ana.clone()])
                .await,
            Err(TallyError::InvalidMeeting(_))
        ));
        assert!(matches!(
            h.engine
                .schedule_meeting(&Address::new("0xo"), "Sync", "", vec![1], vec![ana.clone(), ana])
                .await,
            Err(TallyError::InvalidMeeting(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_meeting_invitation_is_not_kept() {
        let h = harness();
        h.gossip.set_offline(true);
        let err = h
            .engine
            .schedule_meeting(
                &Address::new("0xo"),
                "Sync",
                "",
                vec![1],
                vec![Address::new("0xana")],
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(h.engine.meetings.is_empty());
    }

    #[tokio::test]
    async fn test_assign_task() {
        let h = harness();
        let lead = Address::new("0xlead");
        let ana = Address::new("0xana");
        let deadline = crate::unix_millis() + 86_400_000;

        let low = h.engine.assign_task(&lead, "Print flyers", &ana, deadline, 1).await.unwrap();
        let high = h.engine.assign_task(&lead, "Call lawyer", &ana, deadline, 5).await.unwrap();
        h.engine
            .assign_task(&lead, "Water", &Address::new("0xben"), deadline, 3)
            .await
            .unwrap();

        assert_eq!(h.engine.tasks_for(&ana), vec![high.clone(), low]);

        let history = h.gossip.query_history(COORDINATION_TOPIC, 10).await.unwrap();
        let message: CoordinationMessage = from_cbor(&history[1]).unwrap();
        assert_eq!(message, CoordinationMessage::TaskAssigned(high));

        assert!(matches!(
            h.engine.assign_task(&lead, "Late", &ana, 1, 1).await,
            Err(TallyError::InvalidTask(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// The tally always accounts for exactly the accepted votes.
        #[test]
        fn tally_sums_to_accepted_votes(choices in prop::collection::vec(0usize..3, 0..12)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let h = harness();
                let p = open_proposal(&h.engine).await;
                for (i, choice) in choices.iter().enumerate() {
                    h.engine
                        .cast_vote(&p.id, &Address::new(format!("0x{}", i)), *choice, 1.0)
                        .await
                        .unwrap();
                }
                h.engine.close_proposal(&p.id, &p.creator).unwrap();
                let result = h.engine.tally(&p.id).await.unwrap();

                assert_eq!(result.total_votes as usize, choices.len());
                assert_eq!(result.per_option_counts.iter().sum::<u64>() as usize, choices.len());
                for option in 0..3 {
                    let expected = choices.iter().filter(|c| **c == option).count() as u64;
                    assert_eq!(result.per_option_counts[option], expected);
                }
            });
        }
    }
}
