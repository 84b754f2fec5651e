//! Scrape pipeline: batch reconciliation, staleness re-checks and the run scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serializer_storage::{HttpClientConfig, HttpFetcher, StoryStore};
use tracing::info;

mod config;
mod reconcile;
mod result;
mod scheduler;
mod stale;
#[cfg(test)]
mod testing;

pub use config::{parse_duration, ConfigError, SourceConfig, SourceRegistry, SyncConfig};
pub use reconcile::Reconciler;
pub use result::{RunError, RunErrorKind, RunFailed, RunResult};
pub use scheduler::{
    LastRun, SchedulerConfig, SchedulerError, SchedulerState, ScrapeScheduler, DISABLED_INTERVAL,
    MIN_INTERVAL,
};
pub use stale::{StalenessChecker, StalenessWindow};

pub const CRATE_NAME: &str = "serializer-sync";

impl ScrapeScheduler {
    /// Wires the HTTP client, the source registry and `store` into a scheduler.
    ///
    /// Without `SOURCES_FILE` only the Hacker News adapter is registered.
    pub async fn from_config(config: &SyncConfig, store: Arc<dyn StoryStore>) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let registry = match &config.sources_file {
            Some(path) => SourceRegistry::load(path).await?,
            None => SourceRegistry::default(),
        };
        let adapters = registry
            .build_adapters(http)
            .context("building source adapters")?;
        info!(
            sources = ?adapters.iter().map(|a| a.name()).collect::<Vec<_>>(),
            "registered sources"
        );

        Ok(Self::new(store, adapters, SchedulerConfig::from(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serializer_storage::MemoryStore;

    #[tokio::test]
    async fn fixture_registry_drives_a_full_scrape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("items.json"),
            r#"[{"ref_id": "1", "title": "One", "type": "story", "score": 3,
                 "published_at": "2026-03-01T08:00:00Z"}]"#,
        )
        .unwrap();
        let registry = dir.path().join("sources.yaml");
        std::fs::write(&registry, "sources:\n  - name: local\n    kind: fixture\n    path: items.json\n")
            .unwrap();

        let config = SyncConfig {
            sources_file: Some(registry),
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new());
        let sched = ScrapeScheduler::from_config(&config, store.clone()).await.unwrap();

        let result = sched.run_once().await.unwrap();

        assert_eq!(result.created, 1);
        let stories = store.all_stories().await;
        assert_eq!(stories[0].source, "local");
        assert_eq!(stories[0].score, 3);
    }
}
