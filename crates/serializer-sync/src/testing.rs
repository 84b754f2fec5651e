//! Doubles shared by the sync tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serializer_adapters::{AdapterError, SourceAdapter};
use serializer_core::{
    ChangeRecord, ExternalItem, NewChangeRecord, NewStory, RunContext, Story, StoryType,
    StoryUpdate,
};
use serializer_storage::{MemoryStore, StoreError, StoryStore};
use tokio::sync::Mutex;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn item(ref_id: &str, score: i64) -> ExternalItem {
    ExternalItem {
        source: "hackernews".into(),
        ref_id: ref_id.into(),
        url: format!("https://example.com/{ref_id}"),
        title: format!("Story {ref_id}"),
        author: "pg".into(),
        story_type: StoryType::Story,
        score,
        num_comments: 0,
        published_at: t0() - chrono::Duration::hours(2),
    }
}

/// A stored story created and last seen at `at`.
pub fn seeded(ref_id: &str, score: i64, at: DateTime<Utc>) -> Story {
    let item = item(ref_id, score);
    Story {
        id: 0,
        source: item.source,
        ref_id: item.ref_id,
        url: item.url,
        title: item.title,
        author: item.author,
        story_type: item.story_type,
        score,
        num_comments: 0,
        deleted: false,
        published_at: item.published_at,
        created_at: at,
        updated_at: at,
        last_seen_at: at,
    }
}

/// Wraps a `MemoryStore` and fails every write touching one ref id.
pub struct FailingStore {
    inner: Arc<MemoryStore>,
    ref_id: String,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryStore>, ref_id: &str) -> Self {
        Self {
            inner,
            ref_id: ref_id.to_string(),
        }
    }

    fn boom(&self) -> StoreError {
        StoreError::Integrity(format!("injected failure for {}", self.ref_id))
    }
}

#[async_trait]
impl StoryStore for FailingStore {
    async fn find_by_source_and_ref(
        &self,
        source: &str,
        ref_id: &str,
    ) -> Result<Vec<Story>, StoreError> {
        self.inner.find_by_source_and_ref(source, ref_id).await
    }

    async fn insert_story(&self, story: NewStory) -> Result<Story, StoreError> {
        if story.ref_id == self.ref_id {
            return Err(self.boom());
        }
        self.inner.insert_story(story).await
    }

    async fn update_story(
        &self,
        id: i64,
        update: StoryUpdate,
        changes: &[NewChangeRecord],
    ) -> Result<Story, StoreError> {
        match self.inner.get_story(id).await? {
            Some(story) if story.ref_id == self.ref_id => Err(self.boom()),
            _ => self.inner.update_story(id, update, changes).await,
        }
    }

    async fn insert_change_record(
        &self,
        change: NewChangeRecord,
        at: DateTime<Utc>,
    ) -> Result<ChangeRecord, StoreError> {
        self.inner.insert_change_record(change, at).await
    }

    async fn find_recent_for_update(
        &self,
        source: &str,
        seen_before: DateTime<Utc>,
        created_after: DateTime<Utc>,
    ) -> Result<Vec<Story>, StoreError> {
        self.inner
            .find_recent_for_update(source, seen_before, created_after)
            .await
    }

    async fn mark_story_deleted(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.mark_story_deleted(id, at).await
    }

    async fn get_story(&self, id: i64) -> Result<Option<Story>, StoreError> {
        self.inner.get_story(id).await
    }

    async fn list_stories(&self, after_id: i64, limit: i64) -> Result<Vec<Story>, StoreError> {
        self.inner.list_stories(after_id, limit).await
    }

    async fn list_changes(&self, story_id: i64) -> Result<Vec<ChangeRecord>, StoreError> {
        self.inner.list_changes(story_id).await
    }
}

/// Adapter answering from canned data. Items not in the map are gone.
#[derive(Default)]
pub struct ScriptedAdapter {
    name: String,
    batch: Vec<ExternalItem>,
    items: HashMap<String, ExternalItem>,
    failing: HashSet<String>,
    fail_batch: bool,
    delay: Option<Duration>,
    fetched: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    batches: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_batch(mut self, batch: Vec<ExternalItem>) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_item(mut self, item: ExternalItem) -> Self {
        self.items.insert(item.ref_id.clone(), item);
        self
    }

    pub fn failing_one(mut self, ref_id: &str) -> Self {
        self.failing.insert(ref_id.to_string());
        self
    }

    pub fn failing_batch(mut self) -> Self {
        self.fail_batch = true;
        self
    }

    /// Every `fetch_batch` sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn fetched(&self) -> Vec<String> {
        self.fetched.lock().await.clone()
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_batch(&self, _ctx: &RunContext) -> Result<Vec<ExternalItem>, AdapterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.batches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_batch {
            return Err(AdapterError::Message("front page unavailable".into()));
        }
        Ok(self.batch.clone())
    }

    async fn fetch_one(
        &self,
        _ctx: &RunContext,
        ref_id: &str,
    ) -> Result<Option<ExternalItem>, AdapterError> {
        self.fetched.lock().await.push(ref_id.to_string());
        if self.failing.contains(ref_id) {
            return Err(AdapterError::Message(format!("connection reset fetching {ref_id}")));
        }
        Ok(self.items.get(ref_id).cloned())
    }
}
