//! Record store contract + HTTP fetch utilities for serializer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serializer_core::{ChangeRecord, NewChangeRecord, NewStory, Story, StoryUpdate};
use thiserror::Error;

mod http;
mod memory;
mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::{PgStore, SCHEMA_DDL};

pub const CRATE_NAME: &str = "serializer-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("story {0} not found")]
    NotFound(i64),
    #[error("integrity violation: {0}")]
    Integrity(String),
}

/// Transactional CRUD + point lookups over stories and their change history.
///
/// Each method is its own atomic unit; nothing spans a whole scrape run.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// Zero or more rows; callers must not assume the natural key is unique.
    async fn find_by_source_and_ref(
        &self,
        source: &str,
        ref_id: &str,
    ) -> Result<Vec<Story>, StoreError>;

    async fn insert_story(&self, story: NewStory) -> Result<Story, StoreError>;

    /// Writes the new values and the given change records in one transaction.
    async fn update_story(
        &self,
        id: i64,
        update: StoryUpdate,
        changes: &[NewChangeRecord],
    ) -> Result<Story, StoreError>;

    async fn insert_change_record(
        &self,
        change: NewChangeRecord,
        at: DateTime<Utc>,
    ) -> Result<ChangeRecord, StoreError>;

    /// Live stories of `source` neither seen nor updated since `seen_before`,
    /// created after `created_after`.
    async fn find_recent_for_update(
        &self,
        source: &str,
        seen_before: DateTime<Utc>,
        created_after: DateTime<Utc>,
    ) -> Result<Vec<Story>, StoreError>;

    /// Returns `false` without writing anything when the story is already deleted.
    async fn mark_story_deleted(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn get_story(&self, id: i64) -> Result<Option<Story>, StoreError>;

    async fn list_stories(&self, after_id: i64, limit: i64) -> Result<Vec<Story>, StoreError>;

    async fn list_changes(&self, story_id: i64) -> Result<Vec<ChangeRecord>, StoreError>;
}
