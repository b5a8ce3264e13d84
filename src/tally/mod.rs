//! Private voting and coordination.

pub mod engine;
pub mod types;

pub use engine::{PrivateTallyEngine, TallyError, TallyOutcome};
pub use types::{
    CoordinationMessage, EmergencyAlert, EncryptedVote, Meeting, MeetingResponse, Proposal,
    ProposalState, Severity, TallyResult, Task,
};
