use resistnet::config::ResistConfig;
use resistnet::identity::{Address, IdentityProfile, IdentityScorer, PassportClient};
use std::sync::Arc;

fn scorer(config: &ResistConfig) -> Result<IdentityScorer, Box<dyn std::error::Error>> {
    let client = PassportClient::from_config(&config.passport)?;
    Ok(IdentityScorer::new(
        Arc::new(client),
        config.timeouts.reputation,
        config.retry,
    ))
}

/// Print the live score and stamps for `address`.
pub async fn score(config: &ResistConfig, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let address = Address::new(address);
    let score = scorer(config)?.fetch_score(&address).await?;

    println!("Address: {}", score.address);
    println!("Score:   {:.2}", score.score);
    if let Some(threshold) = score.threshold {
        println!("Passing threshold: {:.2}", threshold);
    }
    if score.stamps.is_empty() {
        println!("No stamps");
    } else {
        println!("Stamps:");
        for stamp in &score.stamps {
            println!("  {:<20} {:.2}", stamp.provider, stamp.score);
        }
    }
    Ok(())
}

/// Print one provider's contribution.
pub async fn stamp(
    config: &ResistConfig,
    address: &str,
    provider: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let detail = scorer(config)?
        .get_stamp_detail(&Address::new(address), provider)
        .await?;
    println!("{} {}: {:.2}", detail.address, detail.provider, detail.score);
    Ok(())
}

/// Print permitted and denied actions, badges, and suggestions.
pub async fn permissions(
    config: &ResistConfig,
    address: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let score = scorer(config)?.get_score(&Address::new(address)).await;
    if score.degraded {
        println!("Warning: reputation API unreachable, showing zero-score permissions");
    }

    let profile = IdentityProfile::build(score, &config.policy);
    println!("Address: {}", profile.score.address);
    println!("Score:   {:.2}", profile.score.score);
    println!();
    for action in &profile.permissions.permitted {
        println!(
            "  allowed  {:<16} (needs {})",
            action.to_string(),
            config.policy.threshold(*action)
        );
    }
    for action in &profile.permissions.denied {
        println!(
            "  denied   {:<16} (needs {})",
            action.to_string(),
            config.policy.threshold(*action)
        );
    }
    if !profile.badges.is_empty() {
        println!();
        let labels: Vec<&str> = profile.badges.iter().map(|b| b.label()).collect();
        println!("Badges: {}", labels.join(", "));
    }
    for suggestion in &profile.suggestions {
        println!("Hint: {}", suggestion);
    }
    Ok(())
}
