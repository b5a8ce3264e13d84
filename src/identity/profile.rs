//! Member-facing identity profile: permissions, badges, and hints for
//! raising a score.

use super::IdentityScore;
use crate::policy::{ActionKind, PolicyThresholds};
use serde::{Deserialize, Serialize};

/// Score at or above which the Trusted Contributor badge is earned.
pub const TRUSTED_CONTRIBUTOR_SCORE: f64 = 25.0;

/// Score at or above which the Power User badge is earned.
pub const POWER_USER_SCORE: f64 = 40.0;

/// Stamp count at or above which the Well Connected badge is earned.
pub const WELL_CONNECTED_STAMPS: usize = 10;

/// Below this many stamps the profile suggests adding more.
const SUGGEST_MORE_STAMPS_BELOW: usize = 5;

/// Passport's passing score, used when a report does not carry its own.
pub const DEFAULT_HUMAN_THRESHOLD: f64 = 20.0;

/// Minimum standard deviation of scores across a group for it to count as
/// distinct people rather than one operator's wallets.
pub const SYBIL_SCORE_SPREAD: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    TrustedContributor,
    PowerUser,
    WellConnected,
    Developer,
    SocialPresence,
}

impl Badge {
    pub fn label(&self) -> &'static str {
        match self {
            Self::TrustedContributor => "Trusted Contributor",
            Self::PowerUser => "Power User",
            Self::WellConnected => "Well Connected",
            Self::Developer => "Developer",
            Self::SocialPresence => "Social Presence",
        }
    }
}

/// Which gated actions a score unlocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionSummary {
    pub score: f64,
    pub permitted: Vec<ActionKind>,
    pub denied: Vec<ActionKind>,
}

impl PermissionSummary {
    pub fn new(score: f64, policy: &PolicyThresholds) -> Self {
        let (permitted, denied) = ActionKind::ALL
            .into_iter()
            .partition(|action| policy.is_permitted(score, *action));
        Self {
            score,
            permitted,
            denied,
        }
    }

    pub fn allows(&self, action: ActionKind) -> bool {
        self.permitted.contains(&action)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub score: IdentityScore,
    pub verified_human: bool,
    pub permissions: PermissionSummary,
    pub badges: Vec<Badge>,
    pub suggestions: Vec<String>,
}

impl IdentityProfile {
    pub fn build(score: IdentityScore, policy: &PolicyThresholds) -> Self {
        let permissions = PermissionSummary::new(score.score, policy);
        let badges = badges_for(&score);
        let suggestions = suggestions_for(&score);
        Self {
            verified_human: is_verified_human(&score),
            score,
            permissions,
            badges,
            suggestions,
        }
    }
}

/// Whether Passport considers this address a unique human. A degraded score
/// never does.
pub fn is_verified_human(score: &IdentityScore) -> bool {
    if score.degraded {
        return false;
    }
    score
        .passing
        .unwrap_or_else(|| score.score >= score.threshold.unwrap_or(DEFAULT_HUMAN_THRESHOLD))
}

/// Anti-Sybil check over a group: every member is a verified human and
/// their scores are spread out rather than clustered.
pub fn is_sybil_resistant(scores: &[IdentityScore]) -> bool {
    if scores.is_empty() || !scores.iter().all(is_verified_human) {
        return false;
    }
    let n = scores.len() as f64;
    let mean = scores.iter().map(|s| s.score).sum::<f64>() / n;
    let variance = scores
        .iter()
        .map(|s| (s.score - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.sqrt() > SYBIL_SCORE_SPREAD
}

fn badges_for(score: &IdentityScore) -> Vec<Badge> {
    let mut badges = Vec::new();
    if score.score >= TRUSTED_CONTRIBUTOR_SCORE {
        badges.push(Badge::TrustedContributor);
    }
    if score.score >= POWER_USER_SCORE {
        badges.push(Badge::PowerUser);
    }
    if score.stamps.len() >= WELL_CONNECTED_STAMPS {
        badges.push(Badge::WellConnected);
    }
    if score.stamp("Github").is_some() {
        badges.push(Badge::Developer);
    }
    if score.stamp("Twitter").is_some() {
        badges.push(Badge::SocialPresence);
    }
    badges
}

fn suggestions_for(score: &IdentityScore) -> Vec<String> {
    let mut suggestions = Vec::new();
    if score.degraded {
        suggestions.push("Reputation service unreachable; try again later".to_string());
        return suggestions;
    }
    if score.stamps.len() < SUGGEST_MORE_STAMPS_BELOW {
        suggestions.push("Add more stamps to increase your score".to_string());
    }
    if score.stamp("Github").is_none() {
        suggestions.push("Connect your GitHub account for a developer badge".to_string());
    }
    if score.stamp("Twitter").is_none() {
        suggestions.push("Connect your Twitter account for a social presence badge".to_string());
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Address, Stamp};

    fn score_with(value: f64, providers: &[&str]) -> IdentityScore {
        let mut score = IdentityScore::degraded(Address::new("0xabc"));
        score.degraded = false;
        score.score = value;
        score.stamps = providers
            .iter()
            .map(|p| Stamp {
                provider: p.to_string(),
                score: 1.0,
            })
            .collect();
        score
    }

    #[test]
    fn test_new_member_profile() {
        let profile = IdentityProfile::build(score_with(8.0, &[]), &PolicyThresholds::default());

        assert!(profile.badges.is_empty());
        assert!(!profile.verified_human);
        assert!(profile.permissions.permitted.is_empty());
        assert_eq!(profile.permissions.denied.len(), ActionKind::ALL.len());
        assert_eq!(profile.suggestions.len(), 3);
    }

    #[test]
    fn test_established_member_badges() {
        let providers = [
            "Github", "Twitter", "Google", "Discord", "Linkedin", "Ens", "Brightid", "Gitcoin",
            "Lens", "Poh",
        ];
        let profile =
            IdentityProfile::build(score_with(42.0, &providers), &PolicyThresholds::default());

        assert_eq!(
            profile.badges,
            vec![
                Badge::TrustedContributor,
                Badge::PowerUser,
                Badge::WellConnected,
                Badge::Developer,
                Badge::SocialPresence,
            ]
        );
        assert!(profile.suggestions.is_empty());
        assert!(profile.permissions.allows(ActionKind::EmergencyAlert));
    }

    #[test]
    fn test_verified_human() {
        assert!(is_verified_human(&score_with(25.0, &[])));
        assert!(!is_verified_human(&score_with(15.0, &[])));

        let mut vouched = score_with(15.0, &[]);
        vouched.passing = Some(true);
        assert!(is_verified_human(&vouched));

        let mut strict = score_with(25.0, &[]);
        strict.threshold = Some(30.0);
        assert!(!is_verified_human(&strict));

        let mut offline = IdentityScore::degraded(Address::new("0xabc"));
        offline.passing = Some(true);
        assert!(!is_verified_human(&offline));
    }

    #[test]
    fn test_sybil_resistance_needs_humans_with_spread_scores() {
        let diverse = [score_with(22.0, &[]), score_with(45.0, &[]), score_with(70.0, &[])];
        assert!(is_sybil_resistant(&diverse));

        let clustered = [score_with(25.0, &[]), score_with(26.0, &[]), score_with(27.0, &[])];
        assert!(!is_sybil_resistant(&clustered));

        let with_bot = [score_with(5.0, &[]), score_with(45.0, &[]), score_with(70.0, &[])];
        assert!(!is_sybil_resistant(&with_bot));

        assert!(!is_sybil_resistant(&[]));
    }

    #[test]
    fn test_degraded_profile_has_single_suggestion() {
        let score = IdentityScore::degraded(Address::new("0xabc"));
        let profile = IdentityProfile::build(score, &PolicyThresholds::default());
        assert_eq!(profile.suggestions.len(), 1);
        assert!(!profile.permissions.allows(ActionKind::Vote));
    }
}
