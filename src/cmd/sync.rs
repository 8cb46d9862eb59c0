//! On-demand sync and status: `issue-enhancer sync`, `issue-enhancer status`.

use anyhow::{Context, Result};
use issue_enhancer::config::EnhancerConfig;
use issue_enhancer::server::Services;

pub async fn cmd_sync(config: EnhancerConfig, only: Option<&str>) -> Result<()> {
    let services = Services::build(config)?;
    if services.sync.connector_names().is_empty() {
        anyhow::bail!("No connectors are enabled. Run `issue-enhancer connectors` to see what is missing.");
    }

    let names: Vec<String> = only
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let report = if names.is_empty() {
        services.sync.sync_all().await
    } else {
        services.sync.sync_subset(&names).await?
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render sync report")?
    );
    let failed = report.failures().count();
    if failed > 0 {
        anyhow::bail!("{} connector(s) failed to sync", failed);
    }
    Ok(())
}

pub async fn cmd_status(config: EnhancerConfig) -> Result<()> {
    let services = Services::build(config)?;
    let status = services.sync.state().status().await?;
    let needs_sync = services.sync.needs_sync().await;

    let mut out = serde_json::to_value(&status).context("Failed to render sync status")?;
    if let Some(map) = out.as_object_mut() {
        map.insert("connectors".into(), serde_json::json!(services.sync.connector_names()));
        map.insert("needs_sync".into(), serde_json::json!(needs_sync));
        map.insert(
            "database".into(),
            serde_json::json!(services.config.database_path().display().to_string()),
        );
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
