use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serializer_core::{ChangeRecord, NewChangeRecord, NewStory, Story, StoryUpdate};
use tokio::sync::Mutex;

use crate::{StoreError, StoryStore};

/// In-process store with sequential ids. Unlike `PgStore` it does not
/// enforce natural-key uniqueness.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    stories: Vec<Story>,
    changes: Vec<ChangeRecord>,
    next_story_id: i64,
    next_change_id: i64,
}

impl MemoryState {
    fn push_change(&mut self, change: NewChangeRecord, at: DateTime<Utc>) -> ChangeRecord {
        self.next_change_id += 1;
        let record = ChangeRecord {
            id: self.next_change_id,
            story_id: change.story_id,
            field: change.field,
            old_val: change.old_val,
            new_val: change.new_val,
            created_at: at,
        };
        self.changes.push(record.clone());
        record
    }

    fn story_mut(&mut self, id: i64) -> Result<&mut Story, StoreError> {
        self.stories
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every change record ever written, in insertion order.
    pub async fn all_changes(&self) -> Vec<ChangeRecord> {
        self.state.lock().await.changes.clone()
    }

    pub async fn all_stories(&self) -> Vec<Story> {
        self.state.lock().await.stories.clone()
    }

    /// Seeds a fully specified row, bypassing `insert_story` timestamps.
    pub async fn seed(&self, mut story: Story) -> Story {
        let mut state = self.state.lock().await;
        state.next_story_id += 1;
        story.id = state.next_story_id;
        state.stories.push(story.clone());
        story
    }
}

#[async_trait]
impl StoryStore for MemoryStore {
    async fn find_by_source_and_ref(
        &self,
        source: &str,
        ref_id: &str,
    ) -> Result<Vec<Story>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .stories
            .iter()
            .filter(|s| s.source == source && s.ref_id == ref_id)
            .cloned()
            .collect())
    }

    async fn insert_story(&self, story: NewStory) -> Result<Story, StoreError> {
        let mut state = self.state.lock().await;
        state.next_story_id += 1;
        let stored = Story {
            id: state.next_story_id,
            source: story.source,
            ref_id: story.ref_id,
            url: story.url,
            title: story.title,
            author: story.author,
            story_type: story.story_type,
            score: story.score,
            num_comments: story.num_comments,
            deleted: false,
            published_at: story.published_at,
            created_at: story.created_at,
            updated_at: story.created_at,
            last_seen_at: story.created_at,
        };
        state.stories.push(stored.clone());
        Ok(stored)
    }

    async fn update_story(
        &self,
        id: i64,
        update: StoryUpdate,
        changes: &[NewChangeRecord],
    ) -> Result<Story, StoreError> {
        let mut state = self.state.lock().await;
        let story = state.story_mut(id)?;
        let values = update.values;
        story.url = values.url;
        story.title = values.title;
        story.story_type = values.story_type;
        story.score = values.score;
        story.num_comments = values.num_comments;
        story.deleted = values.deleted;
        story.updated_at = update.updated_at.max(story.created_at);
        if let Some(seen) = update.last_seen_at {
            story.last_seen_at = seen;
        }
        let updated = story.clone();
        for change in changes {
            state.push_change(change.clone(), update.updated_at);
        }
        Ok(updated)
    }

    async fn insert_change_record(
        &self,
        change: NewChangeRecord,
        at: DateTime<Utc>,
    ) -> Result<ChangeRecord, StoreError> {
        let mut state = self.state.lock().await;
        state.story_mut(change.story_id)?;
        Ok(state.push_change(change, at))
    }

    async fn find_recent_for_update(
        &self,
        source: &str,
        seen_before: DateTime<Utc>,
        created_after: DateTime<Utc>,
    ) -> Result<Vec<Story>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .stories
            .iter()
            .filter(|s| {
                s.source == source
                    && !s.deleted
                    && s.last_seen_at < seen_before
                    && s.updated_at < seen_before
                    && s.created_at > created_after
            })
            .cloned()
            .collect())
    }

    async fn mark_story_deleted(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let story = state.story_mut(id)?;
        if story.deleted {
            return Ok(false);
        }
        story.deleted = true;
        story.updated_at = at.max(story.created_at);
        state.push_change(
            NewChangeRecord {
                story_id: id,
                field: "deleted".to_string(),
                old_val: false.to_string(),
                new_val: true.to_string(),
            },
            at,
        );
        Ok(true)
    }

    async fn get_story(&self, id: i64) -> Result<Option<Story>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.stories.iter().find(|s| s.id == id).cloned())
    }

    async fn list_stories(&self, after_id: i64, limit: i64) -> Result<Vec<Story>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .stories
            .iter()
            .filter(|s| s.id > after_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_changes(&self, story_id: i64) -> Result<Vec<ChangeRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .changes
            .iter()
            .filter(|c| c.story_id == story_id)
            .cloned()
            .collect())
    }
}
