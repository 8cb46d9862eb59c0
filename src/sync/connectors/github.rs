//! Discovery-only connector for the code host.
//!
//! Writes nothing to the corpus. Each run lists the catalog and primes the
//! discovery cache with every repository under its `owner/name`, so explicit
//! repository references resolve without another upstream round trip.

use std::sync::Arc;

use async_trait::async_trait;
use enhancer_common::{
    Connector, ConnectorError, Cursor, FetchOutcome, PartialSync, RecordSink, SyncWatermark,
    WatermarkSet,
};

use super::GITHUB;
use crate::discovery::{DiscoveryCache, RepoCatalog, summarize_readme};

const SUB_SOURCE: &str = "repos";

pub struct GithubConnector<C> {
    catalog: C,
    cache: Arc<DiscoveryCache>,
}

impl<C: RepoCatalog> GithubConnector<C> {
    pub fn new(catalog: C, cache: Arc<DiscoveryCache>) -> Self {
        Self { catalog, cache }
    }
}

#[async_trait]
impl<C: RepoCatalog> Connector for GithubConnector<C> {
    fn name(&self) -> &'static str {
        GITHUB
    }

    async fn fetch_since(
        &self,
        watermarks: &WatermarkSet,
        _sink: &dyn RecordSink,
    ) -> Result<FetchOutcome, PartialSync> {
        let listings = self
            .catalog
            .list_repos()
            .await
            .map_err(ConnectorError::Upstream)?;

        let since = watermarks.cursor(SUB_SOURCE);
        let mut newest: Option<Cursor> = None;
        let mut outcome = FetchOutcome::default();

        for listing in listings {
            let cursor = listing
                .pushed_at
                .map(|at| Cursor::new(at, &listing.full_name));
            let changed = match (&cursor, since) {
                (Some(c), Some(s)) => c > s,
                _ => true,
            };

            let summary = match self.catalog.readme(&listing.full_name).await {
                Ok(Some(text)) => summarize_readme(&text),
                Ok(None) => String::new(),
                Err(e) => {
                    tracing::debug!(repo = %listing.full_name, error = %e, "README unavailable");
                    String::new()
                }
            };
            let key = listing.full_name.clone();
            self.cache.prime(&key, listing.into_metadata(summary));

            if changed {
                outcome.written += 1;
            } else {
                outcome.unchanged += 1;
            }
            if let Some(c) = cursor {
                if newest.as_ref().is_none_or(|n| &c > n) {
                    newest = Some(c);
                }
            }
        }

        if let Some(c) = newest.filter(|c| since.is_none_or(|s| c > s)) {
            outcome
                .advanced
                .push(SyncWatermark::new(GITHUB, SUB_SOURCE, c));
        }
        tracing::debug!(
            connector = GITHUB,
            primed = outcome.written + outcome.unchanged,
            "Discovery cache primed from catalog"
        );
        Ok(outcome)
    }
}
