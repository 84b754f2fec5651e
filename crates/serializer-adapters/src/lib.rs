//! Source adapter contract + the Hacker News and fixture adapters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serializer_core::{ExternalItem, RunContext, StoryType};
use serializer_storage::{FetchError, HttpFetcher};
use thiserror::Error;

mod hackernews;

pub use hackernews::{parse_item, parse_search_results, HackerNewsAdapter};

pub const CRATE_NAME: &str = "serializer-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport: {0}")]
    Transport(#[from] FetchError),
    #[error("decoding {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A registered content source.
///
/// `fetch_one` answers `Ok(None)` when the source says the item is gone; errors
/// are reserved for transport and protocol failures.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_batch(&self, ctx: &RunContext) -> Result<Vec<ExternalItem>, AdapterError>;

    async fn fetch_one(
        &self,
        ctx: &RunContext,
        ref_id: &str,
    ) -> Result<Option<ExternalItem>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Hackernews,
    Fixture,
}

/// One entry of a fixture file; the fixture adapter's source name fills in `source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureItem {
    pub ref_id: String,
    #[serde(default)]
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, rename = "type")]
    pub story_type: StoryType,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: i64,
    pub published_at: DateTime<Utc>,
}

impl FixtureItem {
    fn into_item(self, source: &str) -> ExternalItem {
        ExternalItem {
            source: source.to_string(),
            ref_id: self.ref_id,
            url: self.url,
            title: self.title,
            author: self.author,
            story_type: self.story_type,
            score: self.score,
            num_comments: self.num_comments,
            published_at: self.published_at,
        }
    }
}

/// Serves items from a JSON file, re-read on every call so the file can be
/// edited between runs. Items missing from the file are reported as gone.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    name: String,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<FixtureItem>, AdapterError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading fixture {}", self.path.display()))?;
        serde_json::from_str(&text).map_err(|source| AdapterError::Decode {
            what: self.path.display().to_string(),
            source,
        })
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_batch(&self, _ctx: &RunContext) -> Result<Vec<ExternalItem>, AdapterError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .map(|item| item.into_item(&self.name))
            .collect())
    }

    async fn fetch_one(
        &self,
        _ctx: &RunContext,
        ref_id: &str,
    ) -> Result<Option<ExternalItem>, AdapterError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .find(|item| item.ref_id == ref_id)
            .map(|item| item.into_item(&self.name)))
    }
}

/// Builds the adapter for a registry entry. Fixture adapters need a path.
pub fn adapter_for_source(
    name: &str,
    kind: AdapterKind,
    path: Option<&Path>,
    http: Arc<HttpFetcher>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match kind {
        AdapterKind::Hackernews => Ok(Box::new(HackerNewsAdapter::with_name(name, http))),
        AdapterKind::Fixture => {
            let path = path.ok_or_else(|| {
                AdapterError::Message(format!("fixture source {name} needs a path"))
            })?;
            Ok(Box::new(FixtureAdapter::new(name, path)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serializer_storage::HttpClientConfig;
    use std::io::Write;

    const FIXTURE: &str = r#"[
      {"ref_id": "101", "url": "https://example.com/a", "title": "A", "author": "x",
       "type": "story", "score": 12, "num_comments": 3, "published_at": "2026-03-01T08:00:00Z"},
      {"ref_id": "102", "title": "Ask HN: B?", "type": "ask_hn",
       "published_at": "2026-03-01T09:00:00Z"}
    ]"#;

    fn fixture_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write fixture");
        file
    }

    #[tokio::test]
    async fn fixture_batch_keeps_file_order_and_source_name() {
        let file = fixture_file(FIXTURE);
        let adapter = FixtureAdapter::new("local", file.path());
        let items = adapter.fetch_batch(&RunContext::new(None)).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].ref_id, "101");
        assert_eq!(items[1].story_type, StoryType::AskHn);
        assert_eq!(items[1].score, 0);
        assert!(items.iter().all(|i| i.source == "local"));
    }

    #[tokio::test]
    async fn fixture_fetch_one_reports_missing_items_as_gone() {
        let file = fixture_file(FIXTURE);
        let adapter = FixtureAdapter::new("local", file.path());
        let ctx = RunContext::new(None);
        assert!(adapter.fetch_one(&ctx, "102").await.unwrap().is_some());
        assert!(adapter.fetch_one(&ctx, "999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_fixture_is_an_error_not_a_gone_item() {
        let adapter = FixtureAdapter::new("local", "/nonexistent/fixture.json");
        let err = adapter
            .fetch_one(&RunContext::new(None), "1")
            .await
            .expect_err("missing file");
        assert!(matches!(err, AdapterError::Anyhow(_)));

        let file = fixture_file("{not json");
        let adapter = FixtureAdapter::new("local", file.path());
        let err = adapter
            .fetch_batch(&RunContext::new(None))
            .await
            .expect_err("bad json");
        assert!(matches!(err, AdapterError::Decode { .. }));
    }

    #[test]
    fn registry_requires_path_for_fixtures() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let hn = adapter_for_source("hackernews", AdapterKind::Hackernews, None, http.clone())
            .unwrap();
        assert_eq!(hn.name(), "hackernews");
        assert!(adapter_for_source("local", AdapterKind::Fixture, None, http).is_err());
    }
}
