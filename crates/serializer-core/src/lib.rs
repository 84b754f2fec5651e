//! Core domain model for serializer: stories, change history, tracked-field diffing.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod links;

pub const CRATE_NAME: &str = "serializer-core";

/// Source name of the Hacker News adapter.
pub const SOURCE_HACKERNEWS: &str = "hackernews";

/// Source-defined story categories plus the `Unknown` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryType {
    Story,
    AskHn,
    ShowHn,
    Job,
    Poll,
    #[default]
    Unknown,
}

impl StoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Story => "story",
            Self::AskHn => "ask_hn",
            Self::ShowHn => "show_hn",
            Self::Job => "job",
            Self::Poll => "poll",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient parse; anything unrecognised maps to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "story" => Self::Story,
            "ask_hn" => Self::AskHn,
            "show_hn" => Self::ShowHn,
            "job" => Self::Job,
            "poll" => Self::Poll,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for StoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content item tracked from a source.
///
/// `(source, ref_id)` is the natural key and never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: i64,
    pub source: String,
    pub ref_id: String,
    pub url: String,
    pub title: String,
    pub author: String,
    pub story_type: StoryType,
    pub score: i64,
    pub num_comments: i64,
    pub deleted: bool,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Story {
    pub fn tracked(&self) -> TrackedValues {
        TrackedValues {
            url: self.url.clone(),
            title: self.title.clone(),
            story_type: self.story_type,
            score: self.score,
            num_comments: self.num_comments,
            deleted: self.deleted,
        }
    }
}

/// Item as returned by a source adapter, before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalItem {
    pub source: String,
    pub ref_id: String,
    pub url: String,
    pub title: String,
    pub author: String,
    pub story_type: StoryType,
    pub score: i64,
    pub num_comments: i64,
    pub published_at: DateTime<Utc>,
}

impl ExternalItem {
    /// Items coming from a source are live by definition.
    pub fn tracked(&self) -> TrackedValues {
        TrackedValues {
            url: self.url.clone(),
            title: self.title.clone(),
            story_type: self.story_type,
            score: self.score,
            num_comments: self.num_comments,
            deleted: false,
        }
    }
}

/// Insert payload for a story observed for the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStory {
    pub source: String,
    pub ref_id: String,
    pub url: String,
    pub title: String,
    pub author: String,
    pub story_type: StoryType,
    pub score: i64,
    pub num_comments: i64,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NewStory {
    pub fn from_item(item: &ExternalItem, now: DateTime<Utc>) -> Self {
        Self {
            source: item.source.clone(),
            ref_id: item.ref_id.clone(),
            url: item.url.clone(),
            title: item.title.clone(),
            author: item.author.clone(),
            story_type: item.story_type,
            score: item.score,
            num_comments: item.num_comments,
            published_at: item.published_at,
            created_at: now,
        }
    }
}

/// New values written by an update; also sets `updated_at` (and optionally `last_seen_at`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryUpdate {
    pub values: TrackedValues,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Snapshot of the tracked fields of a story or an external item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedValues {
    pub url: String,
    pub title: String,
    pub story_type: StoryType,
    pub score: i64,
    pub num_comments: i64,
    pub deleted: bool,
}

/// The exhaustive set of fields whose changes are recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackedField {
    Score,
    NumComments,
    Url,
    Title,
    Deleted,
    Type,
}

impl TrackedField {
    /// Field-check order; change records of one pass are emitted in this order.
    pub const ALL: [TrackedField; 6] = [
        TrackedField::Score,
        TrackedField::NumComments,
        TrackedField::Url,
        TrackedField::Title,
        TrackedField::Deleted,
        TrackedField::Type,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Score => "score",
            Self::NumComments => "num_comments",
            Self::Url => "url",
            Self::Title => "title",
            Self::Deleted => "deleted",
            Self::Type => "type",
        }
    }

    pub fn read(&self, values: &TrackedValues) -> String {
        match self {
            Self::Score => values.score.to_string(),
            Self::NumComments => values.num_comments.to_string(),
            Self::Url => values.url.clone(),
            Self::Title => values.title.clone(),
            Self::Deleted => values.deleted.to_string(),
            Self::Type => values.story_type.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: TrackedField,
    pub old_val: String,
    pub new_val: String,
}

impl FieldChange {
    pub fn into_record(self, story_id: i64) -> NewChangeRecord {
        NewChangeRecord {
            story_id,
            field: self.field.name().to_string(),
            old_val: self.old_val,
            new_val: self.new_val,
        }
    }
}

/// Exact string comparison of every tracked field, in field-check order.
pub fn diff(old: &TrackedValues, new: &TrackedValues) -> Vec<FieldChange> {
    TrackedField::ALL
        .iter()
        .filter_map(|field| {
            let old_val = field.read(old);
            let new_val = field.read(new);
            (old_val != new_val).then_some(FieldChange {
                field: *field,
                old_val,
                new_val,
            })
        })
        .collect()
}

/// Immutable audit entry for one changed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub story_id: i64,
    pub field: String,
    pub old_val: String,
    pub new_val: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewChangeRecord {
    pub story_id: i64,
    pub field: String,
    pub old_val: String,
    pub new_val: String,
}

/// Per-run context threaded through every adapter and store call.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    /// Run timestamp used for every write of the run.
    pub now: DateTime<Utc>,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::at(Utc::now(), timeout)
    }

    pub fn at(now: DateTime<Utc>, timeout: Option<Duration>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            now,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline; `None` when the run is unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}
