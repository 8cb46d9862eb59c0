//! Service wiring and the webhook HTTP server.

pub mod api;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tower_http::trace::TraceLayer;

use crate::config::EnhancerConfig;
use crate::discovery::{CatalogDiscovery, DiscoveryCache, NoCatalog, RepoDiscovery};
use crate::enhance::code::GitCheckout;
use crate::enhance::synthesis::ClaudeCli;
use crate::enhance::{EnhancementPipeline, PipelineSettings};
use crate::store::{DbHandle, EnhancerDb};
use crate::sync::{SyncOrchestrator, SyncStateStore, connectors};
use crate::tracker::LinearClient;
use crate::upstream::{self, github::GithubClient};
use crate::webhook::{EventRouter, RouterSettings};

pub use api::{AppState, SharedState, api_router};

/// How long shutdown waits for in-flight enhancements.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_SYNC_PERIOD: Duration = Duration::from_secs(60);

/// Long-lived components shared by the server and the CLI commands.
pub struct Services {
    pub config: EnhancerConfig,
    pub db: DbHandle,
    pub http: reqwest::Client,
    pub cache: Arc<DiscoveryCache>,
    pub sync: Arc<SyncOrchestrator>,
}

impl Services {
    pub fn build(config: EnhancerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory {}", config.data_dir.display())
        })?;
        let db = EnhancerDb::open_or_recover(&config.database_path())
            .context("Failed to initialize enhancer database")?;
        let db = DbHandle::new(db);
        let http = upstream::http_client()?;

        let creds = &config.credentials;
        let discovery: Arc<dyn RepoDiscovery> = match &creds.github_token {
            Some(token) => Arc::new(CatalogDiscovery::new(GithubClient::new(
                http.clone(),
                token,
                creds.github_org.clone(),
            ))),
            None => {
                tracing::info!("GH_TOKEN not set; repository discovery disabled");
                Arc::new(NoCatalog)
            }
        };
        let cache = Arc::new(DiscoveryCache::new(discovery, config.cache.ttl()));

        let sync = Arc::new(SyncOrchestrator::new(
            connectors::build(&config, &db, &cache, &http),
            SyncStateStore::new(db.clone()),
            Arc::new(db.clone()),
            config.sync.interval(),
        ));
        tracing::info!(connectors = ?sync.connector_names(), "Connectors enabled");

        Ok(Self {
            config,
            db,
            http,
            cache,
            sync,
        })
    }

    /// Build the webhook-serving state. Requires `LINEAR_API_KEY`.
    pub fn app_state(&self) -> Result<SharedState> {
        let creds = &self.config.credentials;
        let api_key = creds
            .linear_api_key
            .as_deref()
            .context("LINEAR_API_KEY must be set to serve webhooks")?;
        if creds.linear_webhook_secret.is_none() {
            tracing::warn!("LINEAR_WEBHOOK_SECRET not set; webhook signatures are not checked");
        }

        let tracker = Arc::new(LinearClient::new(self.http.clone(), api_key));
        let pipeline = Arc::new(EnhancementPipeline::new(
            self.db.clone(),
            self.cache.clone(),
            Arc::new(GitCheckout::new(creds.github_token.clone())),
            Arc::new(ClaudeCli::new(self.config.pipeline.claude_cmd.clone())),
            PipelineSettings::from(&self.config.pipeline),
        ));
        let router = Arc::new(EventRouter::new(
            tracker,
            pipeline,
            Some(self.sync.clone()),
            RouterSettings::from(&self.config.pipeline),
        ));

        Ok(Arc::new(AppState {
            router,
            sync: self.sync.clone(),
            cache: self.cache.clone(),
            webhook_secret: creds.linear_webhook_secret.clone(),
        }))
    }
}

/// Full application router with request tracing.
pub fn build_router(state: SharedState) -> Router {
    api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the webhook server and its background sync and sweep tasks.
pub async fn start_server(config: EnhancerConfig) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let services = Services::build(config)?;
    let state = services.app_state()?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "issue-enhancer listening");

    let background = spawn_background(&services);

    axum::serve(listener, build_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    for task in background {
        task.abort();
    }
    if !state.router.wait_until_idle(DRAIN_TIMEOUT).await {
        tracing::warn!(
            active = state.router.active_runs().len(),
            "Shutting down with enhancements still running"
        );
    }
    tracing::info!("Server shut down gracefully");
    Ok(())
}

fn spawn_background(services: &Services) -> Vec<JoinHandle<()>> {
    let sync = services.sync.clone();
    let on_boot = services.config.sync.sync_on_boot;
    let period = services.config.sync.interval().max(MIN_SYNC_PERIOD);
    let sync_task = tokio::spawn(async move {
        if on_boot {
            run_sync(&sync, "boot").await;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_sync(&sync, "scheduled").await;
        }
    });

    let cache = services.cache.clone();
    let sweep = Duration::from_secs(services.config.cache.sweep_secs.max(1));
    let sweep_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + sweep, sweep);
        loop {
            ticker.tick().await;
            let removed = cache.sweep_expired();
            if removed > 0 {
                tracing::debug!(removed, "Swept expired discovery entries");
            }
        }
    });

    vec![sync_task, sweep_task]
}

async fn run_sync(sync: &SyncOrchestrator, reason: &'static str) {
    if sync.connector_names().is_empty() {
        return;
    }
    let report = sync.sync_all().await;
    let failed: Vec<_> = report.failures().map(|r| r.connector.clone()).collect();
    if failed.is_empty() {
        tracing::info!(reason, written = report.total_written(), "Sync pass complete");
    } else {
        tracing::warn!(
            reason,
            written = report.total_written(),
            ?failed,
            "Sync pass finished with failures"
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
}
