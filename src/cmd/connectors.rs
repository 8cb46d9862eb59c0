//! Connector enablement report: `issue-enhancer connectors`.

use anyhow::Result;
use issue_enhancer::config::{ConnectorToggles, EnhancerConfig};

pub fn cmd_connectors(config: &EnhancerConfig) -> Result<()> {
    println!();
    println!("Connectors (sync order)");
    println!("=======================");
    for name in &config.sync.order {
        if config.connectors.is_enabled(name) {
            println!("  {:<8} enabled", name);
        } else {
            println!(
                "  {:<8} disabled (needs {})",
                name,
                ConnectorToggles::requirement(name)
            );
        }
    }

    let creds = &config.credentials;
    println!();
    println!(
        "Repository discovery: {}",
        if creds.github_token.is_some() { "enabled" } else { "disabled (needs GH_TOKEN)" }
    );
    println!(
        "Webhooks: {}",
        match (&creds.linear_api_key, &creds.linear_webhook_secret) {
            (None, _) => "unavailable (needs LINEAR_API_KEY)",
            (Some(_), None) => "enabled, signatures not checked (LINEAR_WEBHOOK_SECRET unset)",
            (Some(_), Some(_)) => "enabled",
        }
    );
    Ok(())
}
