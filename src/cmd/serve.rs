//! Webhook server command: `issue-enhancer serve`.

use anyhow::Result;
use issue_enhancer::config::EnhancerConfig;

pub async fn cmd_serve(mut config: EnhancerConfig, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    issue_enhancer::server::start_server(config).await
}
