use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serializer_core::{ChangeRecord, NewChangeRecord, NewStory, Story, StoryType, StoryUpdate};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::info;

use crate::{StoreError, StoryStore};

/// Idempotent schema. `(source, ref_id)` is enforced unique here even though
/// readers still tolerate several matches.
pub const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS stories (
  id BIGSERIAL PRIMARY KEY,
  source TEXT NOT NULL,
  ref_id TEXT NOT NULL,
  url TEXT NOT NULL DEFAULT '',
  title TEXT NOT NULL,
  author TEXT NOT NULL DEFAULT '',
  story_type TEXT NOT NULL DEFAULT 'unknown',
  score BIGINT NOT NULL DEFAULT 0,
  num_comments BIGINT NOT NULL DEFAULT 0,
  deleted BOOLEAN NOT NULL DEFAULT FALSE,
  published_at TIMESTAMPTZ NOT NULL,
  created_at TIMESTAMPTZ NOT NULL,
  updated_at TIMESTAMPTZ NOT NULL,
  last_seen_at TIMESTAMPTZ NOT NULL,
  CONSTRAINT stories_source_ref_key UNIQUE (source, ref_id),
  CONSTRAINT stories_updated_after_created CHECK (updated_at >= created_at)
);

CREATE INDEX IF NOT EXISTS stories_recent_idx
  ON stories (source, last_seen_at, updated_at)
  WHERE NOT deleted;

CREATE TABLE IF NOT EXISTS story_history (
  id BIGSERIAL PRIMARY KEY,
  story_id BIGINT NOT NULL REFERENCES stories (id),
  field TEXT NOT NULL,
  old_val TEXT NOT NULL,
  new_val TEXT NOT NULL,
  created_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS story_history_story_idx
  ON story_history (story_id, id);
"#;

const STORY_COLUMNS: &str = "id, source, ref_id, url, title, author, story_type, score, \
     num_comments, deleted, published_at, created_at, updated_at, last_seen_at";

#[derive(Debug, FromRow)]
struct StoryRow {
    id: i64,
    source: String,
    ref_id: String,
    url: String,
    title: String,
    author: String,
    story_type: String,
    score: i64,
    num_comments: i64,
    deleted: bool,
    published_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl From<StoryRow> for Story {
    fn from(row: StoryRow) -> Self {
        Story {
            id: row.id,
            source: row.source,
            ref_id: row.ref_id,
            url: row.url,
            title: row.title,
            author: row.author,
            story_type: StoryType::parse(&row.story_type),
            score: row.score,
            num_comments: row.num_comments,
            deleted: row.deleted,
            published_at: row.published_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ChangeRow {
    id: i64,
    story_id: i64,
    field: String,
    old_val: String,
    new_val: String,
    created_at: DateTime<Utc>,
}

impl From<ChangeRow> for ChangeRecord {
    fn from(row: ChangeRow) -> Self {
        ChangeRecord {
            id: row.id,
            story_id: row.story_id,
            field: row.field,
            old_val: row.old_val,
            new_val: row.new_val,
            created_at: row.created_at,
        }
    }
}

fn map_db_err(err: sqlx::Error) -> StoreError {
    let integrity = err
        .as_database_error()
        .map(|db| db.is_unique_violation() || db.is_foreign_key_violation() || db.is_check_violation())
        .unwrap_or(false);
    if integrity {
        StoreError::Integrity(err.to_string())
    } else {
        StoreError::Database(err)
    }
}

/// Postgres-backed store over a shared pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_DDL).execute(&self.pool).await?;
        info!("schema applied");
        Ok(())
    }

    async fn insert_change_tx(
        tx: &mut Transaction<'_, Postgres>,
        change: &NewChangeRecord,
        at: DateTime<Utc>,
    ) -> Result<ChangeRecord, StoreError> {
        let row = sqlx::query_as::<_, ChangeRow>(
            r#"
            INSERT INTO story_history (story_id, field, old_val, new_val, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, story_id, field, old_val, new_val, created_at
            "#,
        )
        .bind(change.story_id)
        .bind(&change.field)
        .bind(&change.old_val)
        .bind(&change.new_val)
        .bind(at)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_db_err)?;
        Ok(row.into())
    }
}

#[async_trait]
impl StoryStore for PgStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn find_by_source_and_ref(
        &self,
        source: &str,
        ref_id: &str,
    ) -> Result<Vec<Story>, StoreError> {
        let rows = sqlx::query_as::<_, StoryRow>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE source = $1 AND ref_id = $2 ORDER BY id"
        ))
        .bind(source)
        .bind(ref_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Story::from).collect())
    }

    #[tracing::instrument(level = "debug", skip(self, story), fields(source = %story.source, ref_id = %story.ref_id))]
    async fn insert_story(&self, story: NewStory) -> Result<Story, StoreError> {
        let row = sqlx::query_as::<_, StoryRow>(&format!(
            r#"
            INSERT INTO stories
                (source, ref_id, url, title, author, story_type, score, num_comments,
                 deleted, published_at, created_at, updated_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, $9, $10, $10, $10)
            RETURNING {STORY_COLUMNS}
            "#
        ))
        .bind(&story.source)
        .bind(&story.ref_id)
        .bind(&story.url)
        .bind(&story.title)
        .bind(&story.author)
        .bind(story.story_type.as_str())
        .bind(story.score)
        .bind(story.num_comments)
        .bind(story.published_at)
        .bind(story.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(row.into())
    }

    #[tracing::instrument(level = "debug", skip(self, update, changes), fields(changes = changes.len()))]
    async fn update_story(
        &self,
        id: i64,
        update: StoryUpdate,
        changes: &[NewChangeRecord],
    ) -> Result<Story, StoreError> {
        let mut tx = self.pool.begin().await?;
        let values = &update.values;
        let row = sqlx::query_as::<_, StoryRow>(&format!(
            r#"
            UPDATE stories
               SET url = $2,
                   title = $3,
                   story_type = $4,
                   score = $5,
                   num_comments = $6,
                   deleted = $7,
                   updated_at = GREATEST($8, created_at),
                   last_seen_at = COALESCE($9, last_seen_at)
             WHERE id = $1
            RETURNING {STORY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&values.url)
        .bind(&values.title)
        .bind(values.story_type.as_str())
        .bind(values.score)
        .bind(values.num_comments)
        .bind(values.deleted)
        .bind(update.updated_at)
        .bind(update.last_seen_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?
        .ok_or(StoreError::NotFound(id))?;

        for change in changes {
            Self::insert_change_tx(&mut tx, change, update.updated_at).await?;
        }
        tx.commit().await?;
        Ok(row.into())
    }

    async fn insert_change_record(
        &self,
        change: NewChangeRecord,
        at: DateTime<Utc>,
    ) -> Result<ChangeRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let record = Self::insert_change_tx(&mut tx, &change, at).await?;
        tx.commit().await?;
        Ok(record)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn find_recent_for_update(
        &self,
        source: &str,
        seen_before: DateTime<Utc>,
        created_after: DateTime<Utc>,
    ) -> Result<Vec<Story>, StoreError> {
        let rows = sqlx::query_as::<_, StoryRow>(&format!(
            r#"
            SELECT {STORY_COLUMNS}
              FROM stories
             WHERE source = $1
               AND NOT deleted
               AND last_seen_at < $2
               AND updated_at < $2
               AND created_at > $3
             ORDER BY id
            "#
        ))
        .bind(source)
        .bind(seen_before)
        .bind(created_after)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Story::from).collect())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn mark_story_deleted(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let flipped: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE stories
               SET deleted = TRUE,
                   updated_at = GREATEST($2, created_at)
             WHERE id = $1 AND NOT deleted
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        if flipped.is_none() {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM stories WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            return match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::NotFound(id)),
            };
        }

        let change = NewChangeRecord {
            story_id: id,
            field: "deleted".to_string(),
            old_val: false.to_string(),
            new_val: true.to_string(),
        };
        Self::insert_change_tx(&mut tx, &change, at).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_story(&self, id: i64) -> Result<Option<Story>, StoreError> {
        let row = sqlx::query_as::<_, StoryRow>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Story::from))
    }

    async fn list_stories(&self, after_id: i64, limit: i64) -> Result<Vec<Story>, StoreError> {
        let rows = sqlx::query_as::<_, StoryRow>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE id > $1 ORDER BY id LIMIT $2"
        ))
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Story::from).collect())
    }

    async fn list_changes(&self, story_id: i64) -> Result<Vec<ChangeRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT id, story_id, field, old_val, new_val, created_at
              FROM story_history
             WHERE story_id = $1
             ORDER BY created_at, id
            "#,
        )
        .bind(story_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ChangeRecord::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_enforces_natural_key_and_history_fk() {
        assert!(SCHEMA_DDL.contains("UNIQUE (source, ref_id)"));
        assert!(SCHEMA_DDL.contains("REFERENCES stories (id)"));
        assert!(SCHEMA_DDL.contains("CREATE TABLE IF NOT EXISTS story_history"));
    }

    #[test]
    fn story_row_maps_unknown_types_to_sentinel() {
        let at = chrono::Utc::now();
        let row = StoryRow {
            id: 7,
            source: "hackernews".into(),
            ref_id: "7".into(),
            url: String::new(),
            title: "t".into(),
            author: "a".into(),
            story_type: "launch_hn".into(),
            score: 0,
            num_comments: 0,
            deleted: false,
            published_at: at,
            created_at: at,
            updated_at: at,
            last_seen_at: at,
        };
        assert_eq!(Story::from(row).story_type, StoryType::Unknown);
    }
}
