//! The composed ResistNet service.
//!
//! `ResistNet` is built explicitly from a `ResistConfig`, the operator
//! keyring, and injected backends. Every gated operation follows the same
//! path: the member's score (cached on their `MemberSession` for an explicit
//! TTL) is checked against the access policy, and only a permitted request
//! reaches the effect component.

use crate::config::{ConfigError, ResistConfig};
use crate::crypto::ResistKeyring;
use crate::custody::{
    Custodian, CustodyError, KeyCustodyManager, KeyShareBundle, LocalCustodian,
};
use crate::identity::profile::is_sybil_resistant;
use crate::identity::{
    Address, IdentityProfile, IdentityScore, IdentityScorer, PassportClient, PermissionSummary,
    ReputationSource, ScoreError,
};
use crate::policy::{ActionKind, Denied, PolicyThresholds};
use crate::publishing::{
    AbuseReport, Category, ContentDistributor, Publication, PublishError,
};
use crate::recovery::{RecoveryError, RecoveryPlan, SocialRecovery};
use crate::secrets::{LocalSecretVault, SecretBackend};
use crate::storage::{open_backend, StorageBackend};
use crate::tally::{
    EmergencyAlert, EncryptedVote, Meeting, MeetingResponse, PrivateTallyEngine, Proposal,
    Severity, TallyError, TallyResult, Task,
};
use crate::transport::{GossipTransport, InMemoryGossip};
use crate::vault::{EvidenceMetadata, EvidenceRecord, EvidenceVault, VaultError};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// How long a session trusts a fetched score before refetching.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Denied(#[from] Denied),

    #[error(transparent)]
    Score(#[from] ScoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Tally(#[from] TallyError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Custody(#[from] CustodyError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Key custody is not attached to this session")]
    CustodyNotAttached,
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Score(e) => e.is_retryable(),
            Self::Publish(e) => e.is_retryable(),
            Self::Tally(e) => e.is_retryable(),
            Self::Vault(e) => e.is_retryable(),
            Self::Custody(e) => e.is_retryable(),
            Self::Recovery(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// The external collaborators `ResistNet` runs against.
pub struct Backends {
    pub reputation: Arc<dyn ReputationSource>,
    pub storage: Arc<dyn StorageBackend>,
    pub transport: Arc<dyn GossipTransport>,
    pub secrets: Arc<dyn SecretBackend>,
    pub custodians: Vec<Arc<dyn Custodian>>,
}

impl Backends {
    /// Backends described by `config`: the Human Passport API, the configured
    /// store, and in-process transport, secret nodes, and custodians.
    pub async fn from_config(config: &ResistConfig) -> ServiceResult<Self> {
        let reputation = PassportClient::from_config(&config.passport)?;
        let storage = open_backend(&config.storage).await?;
        Ok(Self {
            reputation: Arc::new(reputation),
            storage,
            ..Self::local(config)
        })
    }

    /// Everything in-process except the reputation source.
    pub fn in_memory(reputation: Arc<dyn ReputationSource>, config: &ResistConfig) -> Self {
        Self {
            reputation,
            ..Self::local(config)
        }
    }

    fn local(config: &ResistConfig) -> Self {
        let custodians = (0..config.secrets.node_count)
            .map(|i| Arc::new(LocalCustodian::new(format!("custodian-{}", i + 1))) as Arc<dyn Custodian>)
            .collect();
        Self {
            reputation: Arc::new(crate::identity::MockReputation::new()),
            storage: Arc::new(crate::storage::MemoryStore::new()),
            transport: Arc::new(InMemoryGossip::new(config.transport.history_retention)),
            secrets: Arc::new(LocalSecretVault::new(config.secrets.node_count)),
            custodians,
        }
    }
}

/// A member's identity within one client session.
///
/// Holds the member's score with an explicit expiry. Key custody is not
/// part of the base capability; it is attached with `attach_custody`.
pub struct MemberSession {
    address: Address,
    score: IdentityScore,
    fetched_at: Instant,
    ttl: Duration,
    custody: Option<Arc<KeyCustodyManager>>,
}

impl MemberSession {
    pub fn new(score: IdentityScore, ttl: Duration) -> Self {
        Self {
            address: score.address.clone(),
            score,
            fetched_at: Instant::now(),
            ttl,
            custody: None,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn score(&self) -> &IdentityScore {
        &self.score
    }

    pub fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }

    pub fn permissions(&self, policy: &PolicyThresholds) -> PermissionSummary {
        PermissionSummary::new(self.score.score, policy)
    }

    fn refresh(&mut self, score: IdentityScore) {
        self.score = score;
        self.fetched_at = Instant::now();
    }

    pub fn attach_custody(&mut self, custody: Arc<KeyCustodyManager>) {
        self.custody = Some(custody);
    }

    pub fn has_custody(&self) -> bool {
        self.custody.is_some()
    }

    fn custody(&self) -> ServiceResult<&KeyCustodyManager> {
        self.custody
            .as_deref()
            .ok_or(ServiceError::CustodyNotAttached)
    }

    /// Split a signing key this member owns across the custodians.
    pub async fn split_key(
        &self,
        secret: Zeroizing<Vec<u8>>,
        parties: u16,
        threshold: u16,
    ) -> ServiceResult<KeyShareBundle> {
        Ok(self
            .custody()?
            .split_key(&self.address, secret, parties, threshold)
            .await?)
    }

    pub async fn sign(&self, bundle_id: &str, payload: &[u8]) -> ServiceResult<Vec<u8>> {
        Ok(self.custody()?.sign_blind(bundle_id, payload).await?)
    }

    pub async fn revoke_key(&self, bundle_id: &str) -> ServiceResult<KeyShareBundle> {
        Ok(self.custody()?.revoke(bundle_id, &self.address).await?)
    }
}

pub struct ResistNet {
    config: ResistConfig,
    scorer: IdentityScorer,
    distributor: ContentDistributor,
    tally: PrivateTallyEngine,
    vault: EvidenceVault,
    custody: Arc<KeyCustodyManager>,
    recovery: SocialRecovery,
    session_ttl: Duration,
}

impl ResistNet {
    pub async fn new(
        config: ResistConfig,
        keyring: &ResistKeyring,
        backends: Backends,
    ) -> ServiceResult<Self> {
        config.validate()?;

        let scorer = IdentityScorer::new(
            backends.reputation,
            config.timeouts.reputation,
            config.retry,
        );
        let distributor = ContentDistributor::start(
            Arc::clone(&backends.storage),
            Arc::clone(&backends.transport),
            Arc::clone(&backends.secrets),
            keyring.draft_encryption_key(),
            config.timeouts,
            config.retry,
            config.transport.history_retention,
        )
        .await?;
        let tally = PrivateTallyEngine::new(
            Arc::clone(&backends.secrets),
            Arc::clone(&backends.transport),
            keyring.voter_pepper(),
            config.timeouts,
            config.retry,
        );
        let recovery = SocialRecovery::new(
            Arc::clone(&backends.secrets),
            config.timeouts.compute,
            config.retry,
        );
        let vault = EvidenceVault::new(
            backends.storage,
            backends.secrets,
            backends.transport,
            config.policy,
            config.timeouts,
            config.retry,
        );
        let custody = Arc::new(KeyCustodyManager::new(
            backends.custodians,
            config.timeouts.signing,
        ));

        info!(
            storage = ?config.storage.backend,
            custodians = custody.custodian_count(),
            "ResistNet started"
        );

        Ok(Self {
            config,
            scorer,
            distributor,
            tally,
            vault,
            custody,
            recovery,
            session_ttl: DEFAULT_SESSION_TTL,
        })
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn config(&self) -> &ResistConfig {
        &self.config
    }

    pub fn policy(&self) -> &PolicyThresholds {
        &self.config.policy
    }

    pub fn scorer(&self) -> &IdentityScorer {
        &self.scorer
    }

    pub fn distributor(&self) -> &ContentDistributor {
        &self.distributor
    }

    pub fn tally(&self) -> &PrivateTallyEngine {
        &self.tally
    }

    pub fn vault(&self) -> &EvidenceVault {
        &self.vault
    }

    pub fn custody(&self) -> Arc<KeyCustodyManager> {
        Arc::clone(&self.custody)
    }

    /// Start a session for `address`. An unreachable reputation API yields a
    /// degraded zero score, which can still read public content.
    pub async fn open_session(&self, address: &Address) -> MemberSession {
        MemberSession::new(self.scorer.get_score(address).await, self.session_ttl)
    }

    pub async fn profile(&self, address: &Address) -> IdentityProfile {
        IdentityProfile::build(self.scorer.get_score(address).await, &self.config.policy)
    }

    /// Whether `addresses` look like distinct verified humans. An
    /// unreachable reputation API makes every group fail the check.
    pub async fn is_sybil_resistant(&self, addresses: &[Address]) -> bool {
        let scores = join_all(addresses.iter().map(|a| self.scorer.get_score(a))).await;
        is_sybil_resistant(&scores)
    }

    /// Refresh a stale score, then check `action` against the policy.
    async fn authorize(&self, session: &mut MemberSession, action: ActionKind) -> ServiceResult<f64> {
        if session.is_stale() {
            let score = self.scorer.get_score(session.address()).await;
            session.refresh(score);
        }

        let score = session.score().score;
        if let Err(denied) = self.config.policy.check(score, action) {
            warn!(address = %session.address(), %action, score, "action denied");
            return Err(denied.into());
        }
        Ok(score)
    }

    pub async fn publish(
        &self,
        session: &mut MemberSession,
        title: &str,
        content: &str,
        category: Category,
    ) -> ServiceResult<Publication> {
        let score = self.authorize(session, ActionKind::Publish).await?;
        Ok(self
            .distributor
            .publish(title, content, category, session.address(), Some(score))
            .await?)
    }

    pub async fn co_sign(
        &self,
        session: &mut MemberSession,
        publication_id: &str,
        signature: &str,
    ) -> ServiceResult<Publication> {
        self.authorize(session, ActionKind::Witness).await?;
        Ok(self
            .distributor
            .co_sign(publication_id, session.address(), signature)
            .await?)
    }

    pub async fn report(
        &self,
        session: &mut MemberSession,
        publication_id: &str,
        reason: &str,
    ) -> ServiceResult<AbuseReport> {
        self.authorize(session, ActionKind::ReportAbuse).await?;
        Ok(self
            .distributor
            .report(publication_id, session.address(), reason)
            .await?)
    }

    pub async fn create_proposal(
        &self,
        session: &mut MemberSession,
        title: &str,
        description: &str,
        options: Vec<String>,
        voting_period: Duration,
    ) -> ServiceResult<Proposal> {
        self.authorize(session, ActionKind::CreateProposal).await?;
        Ok(self
            .tally
            .create_proposal(session.address(), title, description, options, voting_period)
            .await?)
    }

    /// Cast a vote weighted by the member's score.
    pub async fn vote(
        &self,
        session: &mut MemberSession,
        proposal_id: &str,
        option_index: usize,
    ) -> ServiceResult<EncryptedVote> {
        let score = self.authorize(session, ActionKind::Vote).await?;
        Ok(self
            .tally
            .cast_vote(proposal_id, session.address(), option_index, score)
            .await?)
    }

    /// Close a proposal and compute its result. Before the deadline only
    /// the proposal's creator may do this.
    pub async fn close_and_tally(
        &self,
        session: &MemberSession,
        proposal_id: &str,
    ) -> ServiceResult<TallyResult> {
        self.tally.close_proposal(proposal_id, session.address())?;
        Ok(self.tally.tally(proposal_id).await?)
    }

    pub async fn emergency_alert(
        &self,
        session: &mut MemberSession,
        severity: Severity,
        message: &str,
    ) -> ServiceResult<EmergencyAlert> {
        self.authorize(session, ActionKind::EmergencyAlert).await?;
        Ok(self
            .tally
            .emergency_alert(session.address(), severity, message)
            .await?)
    }

    /// Scheduling a meeting takes the same standing as creating a proposal.
    pub async fn schedule_meeting(
        &self,
        session: &mut MemberSession,
        title: &str,
        description: &str,
        proposed_times: Vec<u64>,
        participants: Vec<Address>,
    ) -> ServiceResult<Meeting> {
        self.authorize(session, ActionKind::CreateProposal).await?;
        Ok(self
            .tally
            .schedule_meeting(session.address(), title, description, proposed_times, participants)
            .await?)
    }

    pub async fn respond_to_meeting(
        &self,
        session: &mut MemberSession,
        meeting_id: &str,
        chosen_time: usize,
    ) -> ServiceResult<MeetingResponse> {
        self.authorize(session, ActionKind::Vote).await?;
        Ok(self
            .tally
            .respond_to_meeting(meeting_id, session.address(), chosen_time)
            .await?)
    }

    pub async fn assign_task(
        &self,
        session: &mut MemberSession,
        title: &str,
        assignee: &Address,
        deadline: u64,
        priority: u8,
    ) -> ServiceResult<Task> {
        self.authorize(session, ActionKind::CreateProposal).await?;
        Ok(self
            .tally
            .assign_task(session.address(), title, assignee, deadline, priority)
            .await?)
    }

    pub async fn upload_evidence(
        &self,
        session: &mut MemberSession,
        data: &[u8],
        metadata: EvidenceMetadata,
        viewers: Vec<Address>,
    ) -> ServiceResult<EvidenceRecord> {
        self.authorize(session, ActionKind::UploadEvidence).await?;
        Ok(self
            .vault
            .upload(session.address(), data, metadata, viewers)
            .await?)
    }

    pub async fn grant_access(
        &self,
        session: &mut MemberSession,
        evidence_id: &str,
        viewer: &Address,
    ) -> ServiceResult<EvidenceRecord> {
        self.authorize(session, ActionKind::GrantAccess).await?;
        Ok(self
            .vault
            .grant_access(evidence_id, session.score(), viewer)
            .await?)
    }

    pub async fn revoke_access(
        &self,
        session: &MemberSession,
        evidence_id: &str,
        viewer: &Address,
    ) -> ServiceResult<EvidenceRecord> {
        Ok(self
            .vault
            .revoke_access(evidence_id, session.address(), viewer)
            .await?)
    }

    pub async fn download_evidence(
        &self,
        session: &MemberSession,
        evidence_id: &str,
    ) -> ServiceResult<Vec<u8>> {
        Ok(self.vault.download(evidence_id, session.address()).await?)
    }

    pub async fn witness_evidence(
        &self,
        session: &mut MemberSession,
        evidence_id: &str,
        signature: &str,
    ) -> ServiceResult<EvidenceRecord> {
        self.authorize(session, ActionKind::Witness).await?;
        Ok(self
            .vault
            .witness(evidence_id, session.score(), signature)
            .await?)
    }

    /// Escrow a key with `guardians` for social recovery.
    pub async fn setup_social_recovery(
        &self,
        session: &MemberSession,
        secret: Zeroizing<Vec<u8>>,
        guardians: Vec<Address>,
        threshold: u16,
    ) -> ServiceResult<RecoveryPlan> {
        Ok(self
            .recovery
            .setup(session.address(), secret, guardians, threshold)
            .await?)
    }

    pub fn approve_recovery(&self, session: &MemberSession, plan_id: &str) -> ServiceResult<usize> {
        Ok(self.recovery.approve(plan_id, session.address())?)
    }

    pub async fn recover_key(
        &self,
        session: &MemberSession,
        plan_id: &str,
    ) -> ServiceResult<Zeroizing<Vec<u8>>> {
        Ok(self.recovery.recover(plan_id, session.address()).await?)
    }

    /// Stop background tasks. Owned by the caller; nothing stops implicitly.
    pub fn shutdown(&self) {
        self.distributor.shutdown();
        info!("ResistNet stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockReputation;

    async fn service(reputation: &MockReputation) -> ResistNet {
        let config = ResistConfig::default();
        let backends = Backends::in_memory(Arc::new(reputation.clone()), &config);
        ResistNet::new(config, &ResistKeyring::ephemeral(), backends)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_low_score_is_denied_before_component() {
        let reputation = MockReputation::new();
        let carol = Address::new("0xcarol");
        reputation.set_score(&carol, 8.0, &[]);
        let net = service(&reputation).await;

        let mut session = net.open_session(&carol).await;
        let err = net
            .publish(&mut session, "t", "c", Category::Article)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Denied(_)));
        assert!(net.distributor().query_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_caches_score_until_stale() {
        let reputation = MockReputation::new();
        let alice = Address::new("0xalice");
        reputation.set_score(&alice, 40.0, &[]);
        let net = service(&reputation).await;

        let mut session = net.open_session(&alice).await;
        let calls = reputation.calls();
        net.publish(&mut session, "a", "b", Category::Report)
            .await
            .unwrap();
        assert_eq!(reputation.calls(), calls);

        let net = net.with_session_ttl(Duration::ZERO);
        let mut session = net.open_session(&alice).await;
        reputation.set_score(&alice, 5.0, &[]);
        assert!(matches!(
            net.publish(&mut session, "a", "b", Category::Report).await,
            Err(ServiceError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn test_degraded_score_fails_closed() {
        let reputation = MockReputation::new();
        let alice = Address::new("0xalice");
        reputation.set_score(&alice, 40.0, &[]);
        reputation.set_offline(true);
        let net = service(&reputation).await;

        let mut session = net.open_session(&alice).await;
        assert!(session.score().degraded);
        assert!(matches!(
            net.upload_evidence(&mut session, b"x", photo(), vec![]).await,
            Err(ServiceError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn test_custody_must_be_attached() {
        let reputation = MockReputation::new();
        let alice = Address::new("0xalice");
        let net = service(&reputation).await;

        let mut session = net.open_session(&alice).await;
        assert!(matches!(
            session.sign("bundle", b"x").await,
            Err(ServiceError::CustodyNotAttached)
        ));

        session.attach_custody(net.custody());
        let bundle = session
            .split_key(crate::custody::generate_signing_secret(), 3, 2)
            .await
            .unwrap();
        let signature = session.sign(&bundle.id, b"x").await.unwrap();
        assert!(net.custody().verify(&bundle.id, b"x", &signature).unwrap());
    }

    #[tokio::test]
    async fn test_meetings_and_tasks_are_gated() {
        let reputation = MockReputation::new();
        let (lead, carol) = (Address::new("0xlead"), Address::new("0xcarol"));
        reputation.set_score(&lead, 30.0, &[]);
        reputation.set_score(&carol, 8.0, &[]);
        let net = service(&reputation).await;

        let mut lead_session = net.open_session(&lead).await;
        let mut carol_session = net.open_session(&carol).await;

        assert!(matches!(
            net.schedule_meeting(&mut carol_session, "Sync", "", vec![1], vec![lead.clone()])
                .await,
            Err(ServiceError::Denied(_))
        ));

        let meeting = net
            .schedule_meeting(&mut lead_session, "Sync", "", vec![1, 2], vec![carol.clone()])
            .await
            .unwrap();
        // Invited, but below the voting threshold
        assert!(matches!(
            net.respond_to_meeting(&mut carol_session, &meeting.id, 0).await,
            Err(ServiceError::Denied(_))
        ));
        net.respond_to_meeting(&mut lead_session, &meeting.id, 1)
            .await
            .unwrap();
        assert_eq!(net.tally().meeting_counts(&meeting.id).unwrap(), vec![0, 1]);

        let deadline = crate::unix_millis() + 60_000;
        assert!(matches!(
            net.assign_task(&mut carol_session, "Flyers", &lead, deadline, 1)
                .await,
            Err(ServiceError::Denied(_))
        ));
        let task = net
            .assign_task(&mut lead_session, "Flyers", &carol, deadline, 1)
            .await
            .unwrap();
        assert_eq!(net.tally().tasks_for(&carol), vec![task]);
    }

    #[tokio::test]
    async fn test_sybil_check_uses_live_scores() {
        let reputation = MockReputation::new();
        let group: Vec<Address> = ["0xa", "0xb", "0xc"].into_iter().map(Address::new).collect();
        for (address, score) in group.iter().zip([22.0, 45.0, 70.0]) {
            reputation.set_score(address, score, &[]);
        }
        let net = service(&reputation).await;

        assert!(net.is_sybil_resistant(&group).await);
        reputation.set_score(&group[0], 3.0, &[]);
        assert!(!net.is_sybil_resistant(&group).await);
        reputation.set_offline(true);
        reputation.set_score(&group[0], 22.0, &[]);
        assert!(!net.is_sybil_resistant(&group).await);
    }

    #[tokio::test]
    async fn test_social_recovery_through_sessions() {
        let reputation = MockReputation::new();
        let net = service(&reputation).await;
        let alice = net.open_session(&Address::new("0xalice")).await;
        let ana = net.open_session(&Address::new("0xana")).await;
        let ben = net.open_session(&Address::new("0xben")).await;

        let plan = net
            .setup_social_recovery(
                &alice,
                Zeroizing::new(b"seed".to_vec()),
                vec![ana.address().clone(), ben.address().clone()],
                2,
            )
            .await
            .unwrap();

        net.approve_recovery(&ana, &plan.id).unwrap();
        assert!(matches!(
            net.recover_key(&ana, &plan.id).await,
            Err(ServiceError::Recovery(RecoveryError::NotApproved { .. }))
        ));
        net.approve_recovery(&ben, &plan.id).unwrap();
        assert_eq!(&net.recover_key(&ana, &plan.id).await.unwrap()[..], b"seed");
    }

    fn photo() -> EvidenceMetadata {
        EvidenceMetadata {
            evidence_type: crate::vault::EvidenceType::Photo,
            title: "t".to_string(),
            description: String::new(),
            location: None,
            tags: vec![],
        }
    }
}
