use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serializer_adapters::SourceAdapter;
use serializer_core::{diff, ExternalItem, RunContext, Story, StoryType, StoryUpdate};
use serializer_storage::StoryStore;
use tracing::{debug, info, warn};

use crate::result::{within_deadline, RunError, RunResult};

/// Which stored stories get re-fetched: not seen for `refresh_after`, but
/// created within `lookback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessWindow {
    pub refresh_after: Duration,
    pub lookback: Duration,
}

impl Default for StalenessWindow {
    fn default() -> Self {
        Self {
            refresh_after: Duration::from_secs(15 * 60),
            lookback: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl StalenessWindow {
    pub fn seen_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        ago(now, self.refresh_after)
    }

    pub fn created_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        ago(now, self.lookback)
    }
}

fn ago(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Re-fetches stories that dropped out of the batch and flags the ones the
/// source no longer has.
#[derive(Clone)]
pub struct StalenessChecker {
    store: Arc<dyn StoryStore>,
}

impl StalenessChecker {
    pub fn new(store: Arc<dyn StoryStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile_stale(
        &self,
        ctx: &RunContext,
        adapter: &dyn SourceAdapter,
        window: StalenessWindow,
    ) -> RunResult {
        let source = adapter.name();
        let mut result = RunResult::default();

        let candidates = self.store.find_recent_for_update(
            source,
            window.seen_before(ctx.now),
            window.created_after(ctx.now),
        );
        let candidates = match within_deadline(ctx, candidates).await {
            None => {
                result.record_timeout(source);
                return result;
            }
            Some(Err(err)) => {
                warn!(source, error = %err, "stale lookup failed");
                result.record(RunError::store(source, None, &err));
                return result;
            }
            Some(Ok(stories)) => stories,
        };

        for story in &candidates {
            if ctx.expired() {
                result.record_timeout(source);
                break;
            }

            let fetched = match within_deadline(ctx, adapter.fetch_one(ctx, &story.ref_id)).await {
                None => {
                    result.record_timeout(source);
                    break;
                }
                Some(Err(err)) => {
                    warn!(source, ref_id = %story.ref_id, error = %err, "recheck fetch failed");
                    result.record(RunError::transport(source, Some(&story.ref_id), &err));
                    continue;
                }
                Some(Ok(fetched)) => fetched,
            };

            match fetched {
                Some(item) => {
                    if !self.refresh(ctx, source, story, &item, &mut result).await {
                        break;
                    }
                }
                None => {
                    let mark = self.store.mark_story_deleted(story.id, ctx.now);
                    match within_deadline(ctx, mark).await {
                        None => {
                            result.record_timeout(source);
                            break;
                        }
                        Some(Ok(true)) => {
                            info!(source, ref_id = %story.ref_id, id = story.id, "story gone from source");
                            result.marked_gone += 1;
                        }
                        Some(Ok(false)) => {
                            debug!(id = story.id, "story already marked deleted");
                        }
                        Some(Err(err)) => {
                            warn!(id = story.id, error = %err, "marking story deleted failed");
                            result.record(RunError::store(source, Some(&story.ref_id), &err));
                        }
                    }
                }
            }
        }

        info!(
            run_id = %ctx.run_id,
            source,
            candidates = candidates.len(),
            rechecked = result.rechecked,
            marked_gone = result.marked_gone,
            failed = result.failed,
            "staleness pass finished"
        );
        result
    }

    /// Returns `false` when the deadline cut the write short.
    async fn refresh(
        &self,
        ctx: &RunContext,
        source: &str,
        story: &Story,
        item: &ExternalItem,
        result: &mut RunResult,
    ) -> bool {
        let mut values = item.tracked();
        values.story_type = settle_type(story.story_type, values.story_type);
        let changes: Vec<_> = diff(&story.tracked(), &values)
            .into_iter()
            .map(|change| change.into_record(story.id))
            .collect();
        let update = StoryUpdate {
            values,
            updated_at: ctx.now,
            last_seen_at: None,
        };

        match within_deadline(ctx, self.store.update_story(story.id, update, &changes)).await {
            None => {
                result.record_timeout(source);
                false
            }
            Some(Ok(_)) => {
                result.rechecked += 1;
                true
            }
            Some(Err(err)) => {
                warn!(id = story.id, error = %err, "recheck update failed");
                result.record(RunError::store(source, Some(&story.ref_id), &err));
                true
            }
        }
    }
}

/// Single-item lookups only know the coarse type, so they never demote a
/// stored ask/show classification.
fn settle_type(stored: StoryType, fetched: StoryType) -> StoryType {
    match (stored, fetched) {
        (_, StoryType::Unknown) => stored,
        (StoryType::AskHn | StoryType::ShowHn, StoryType::Story) => stored,
        _ => fetched,
    }
}
