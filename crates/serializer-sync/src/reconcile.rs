use std::sync::Arc;

use serializer_core::{diff, ExternalItem, NewChangeRecord, NewStory, RunContext, Story, StoryUpdate};
use serializer_storage::StoryStore;
use tracing::{debug, info, warn};

use crate::result::{within_deadline, RunError, RunResult};

/// Applies a fetched batch to the store, one item at a time.
///
/// Rows are keyed on the adapter's `source` name, whatever the items carry.
/// New natural keys are inserted; known ones get their tracked fields
/// overwritten and one change record per differing field. A failing item is
/// recorded and skipped. The run deadline stops the loop and keeps what was
/// already written.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn StoryStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn StoryStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile(
        &self,
        ctx: &RunContext,
        source: &str,
        batch: &[ExternalItem],
    ) -> RunResult {
        let mut result = RunResult::default();

        for item in batch {
            if ctx.expired() {
                result.record_timeout(source);
                break;
            }

            let lookup = self.store.find_by_source_and_ref(source, &item.ref_id);
            let matches = match within_deadline(ctx, lookup).await {
                None => {
                    result.record_timeout(source);
                    break;
                }
                Some(Err(err)) => {
                    warn!(source, ref_id = %item.ref_id, error = %err, "lookup failed");
                    result.record(RunError::store(source, Some(&item.ref_id), &err));
                    continue;
                }
                Some(Ok(matches)) => matches,
            };

            if matches.is_empty() {
                let insert = self.store.insert_story(NewStory {
                    source: source.to_string(),
                    ..NewStory::from_item(item, ctx.now)
                });
                match within_deadline(ctx, insert).await {
                    None => {
                        result.record_timeout(source);
                        break;
                    }
                    Some(Ok(story)) => {
                        debug!(source, ref_id = %item.ref_id, id = story.id, "created story");
                        result.created += 1;
                    }
                    Some(Err(err)) => {
                        warn!(source, ref_id = %item.ref_id, error = %err, "insert failed");
                        result.record(RunError::store(source, Some(&item.ref_id), &err));
                    }
                }
                continue;
            }

            if matches.len() > 1 {
                warn!(
                    source,
                    ref_id = %item.ref_id,
                    rows = matches.len(),
                    "natural key matches several rows; updating all of them"
                );
            }

            for story in &matches {
                let (update, changes) = plan_update(story, item, ctx);
                let write = self.store.update_story(story.id, update, &changes);
                match within_deadline(ctx, write).await {
                    None => {
                        result.record_timeout(source);
                        break;
                    }
                    Some(Ok(_)) => {
                        if !changes.is_empty() {
                            debug!(id = story.id, changes = changes.len(), "recorded changes");
                        }
                        result.updated += 1;
                    }
                    Some(Err(err)) => {
                        warn!(id = story.id, error = %err, "update failed");
                        result.record(RunError::store(source, Some(&item.ref_id), &err));
                    }
                }
            }
            if result.timed_out() {
                break;
            }
        }

        info!(
            run_id = %ctx.run_id,
            source,
            items = batch.len(),
            created = result.created,
            updated = result.updated,
            failed = result.failed,
            "reconciled batch"
        );
        result
    }
}

/// The item is authoritative for every tracked field, `deleted` included.
fn plan_update(
    story: &Story,
    item: &ExternalItem,
    ctx: &RunContext,
) -> (StoryUpdate, Vec<NewChangeRecord>) {
    let values = item.tracked();
    let changes = diff(&story.tracked(), &values)
        .into_iter()
        .map(|change| change.into_record(story.id))
        .collect();
    let update = StoryUpdate {
        values,
        updated_at: ctx.now,
        last_seen_at: Some(ctx.now),
    };
    (update, changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stale::{StalenessChecker, StalenessWindow};
    use crate::testing::{item, t0, FailingStore, ScriptedAdapter};
    use serializer_core::StoryType;
    use serializer_storage::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn new_items_are_created_without_history() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let batch = vec![item("1", 10), item("2", 20), item("3", 30)];

        let result = reconciler
            .reconcile(&RunContext::at(t0(), None), "hackernews", &batch)
            .await;

        assert_eq!(result.created, 3);
        assert_eq!(result.updated, 0);
        assert!(result.is_ok());
        assert_eq!(store.all_stories().await.len(), 3);
        assert!(store.all_changes().await.is_empty());
    }

    #[tokio::test]
    async fn score_change_produces_exactly_one_record() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&RunContext::at(t0(), None), "hackernews", &[item("7", 100)])
            .await;

        let later = t0() + chrono::Duration::minutes(1);
        let result = reconciler
            .reconcile(&RunContext::at(later, None), "hackernews", &[item("7", 150)])
            .await;

        assert_eq!(result.updated, 1);
        let changes = store.all_changes().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "score");
        assert_eq!(changes[0].old_val, "100");
        assert_eq!(changes[0].new_val, "150");
        assert_eq!(changes[0].created_at, later);

        let story = &store.all_stories().await[0];
        assert_eq!(story.score, 150);
        assert_eq!(story.last_seen_at, later);
    }

    #[tokio::test]
    async fn several_changed_fields_are_recorded_in_field_order() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&RunContext::at(t0(), None), "hackernews", &[item("7", 100)])
            .await;

        let mut edited = item("7", 120);
        edited.title = "Story 7 (2026)".into();
        edited.num_comments = 4;
        edited.story_type = StoryType::ShowHn;
        let later = t0() + chrono::Duration::minutes(1);
        let result = reconciler
            .reconcile(&RunContext::at(later, None), "hackernews", &[edited])
            .await;

        assert_eq!(result.updated, 1);
        let story = &store.all_stories().await[0];
        let recorded: Vec<_> = store
            .list_changes(story.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| (c.field, c.old_val, c.new_val))
            .collect();
        let expected: Vec<(String, String, String)> = [
            ("score", "100", "120"),
            ("num_comments", "0", "4"),
            ("title", "Story 7", "Story 7 (2026)"),
            ("type", "story", "show_hn"),
        ]
        .into_iter()
        .map(|(f, old, new)| (f.into(), old.into(), new.into()))
        .collect();
        assert_eq!(recorded, expected);
        assert_eq!(story.title, "Story 7 (2026)");
        assert_eq!(story.num_comments, 4);
    }

    #[tokio::test]
    async fn rows_are_filed_under_the_adapter_name() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let tagged = item("7", 100);
        assert_eq!(tagged.source, "hackernews");

        let result = reconciler
            .reconcile(&RunContext::at(t0(), None), "lobsters", &[tagged.clone()])
            .await;
        assert_eq!(result.created, 1);
        assert_eq!(store.all_stories().await[0].source, "lobsters");

        let again = reconciler
            .reconcile(&RunContext::at(t0(), None), "lobsters", &[tagged])
            .await;
        assert_eq!((again.created, again.updated), (0, 1));
        assert_eq!(store.all_stories().await.len(), 1);

        let adapter = ScriptedAdapter::new("lobsters");
        let later = RunContext::at(t0() + chrono::Duration::hours(1), None);
        let stale = StalenessChecker::new(store.clone())
            .reconcile_stale(&later, &adapter, StalenessWindow::default())
            .await;
        assert_eq!(adapter.fetched().await, vec!["7".to_string()]);
        assert_eq!(stale.marked_gone, 1);
    }

    #[tokio::test]
    async fn unchanged_item_is_touched_but_not_recorded() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&RunContext::at(t0(), None), "hackernews", &[item("7", 100)])
            .await;

        let later = t0() + chrono::Duration::minutes(1);
        for _ in 0..2 {
            let result = reconciler
                .reconcile(&RunContext::at(later, None), "hackernews", &[item("7", 100)])
                .await;
            assert_eq!(result.updated, 1);
            assert_eq!(result.created, 0);
        }

        assert!(store.all_changes().await.is_empty());
        assert_eq!(store.all_stories().await[0].updated_at, later);
    }

    #[tokio::test]
    async fn deleted_story_seen_again_is_revived_with_history() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&RunContext::at(t0(), None), "hackernews", &[item("7", 100)])
            .await;
        store.mark_story_deleted(1, t0()).await.unwrap();

        reconciler
            .reconcile(&RunContext::at(t0(), None), "hackernews", &[item("7", 100)])
            .await;

        let changes = store.all_changes().await;
        let last = changes.last().unwrap();
        assert_eq!((last.field.as_str(), last.new_val.as_str()), ("deleted", "false"));
        assert!(!store.all_stories().await[0].deleted);
    }

    #[tokio::test]
    async fn duplicate_rows_are_all_updated() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let ctx = RunContext::at(t0(), None);
        for _ in 0..2 {
            store
                .insert_story(NewStory::from_item(&item("7", 1), t0()))
                .await
                .unwrap();
        }

        let result = reconciler.reconcile(&ctx, "hackernews", &[item("7", 5)]).await;

        assert_eq!(result.updated, 2);
        assert_eq!(store.all_changes().await.len(), 2);
    }

    #[tokio::test]
    async fn store_failure_on_one_item_does_not_abort_the_batch() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(FailingStore::new(inner.clone(), "2"));
        let reconciler = Reconciler::new(store);
        let batch = vec![item("1", 10), item("2", 20), item("3", 30)];

        let result = reconciler
            .reconcile(&RunContext::at(t0(), None), "hackernews", &batch)
            .await;

        assert_eq!(result.created, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors[0].ref_id.as_deref(), Some("2"));
        assert_eq!(inner.all_stories().await.len(), 2);
    }

    #[tokio::test]
    async fn expired_deadline_stops_with_timeout_error() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let ctx = RunContext::at(t0(), Some(Duration::ZERO));

        let result = reconciler
            .reconcile(&ctx, "hackernews", &[item("1", 10), item("2", 20)])
            .await;

        assert!(result.timed_out());
        assert_eq!(result.failed, 1);
        assert_eq!(result.created, 0);
        assert!(store.all_stories().await.is_empty());
    }
}
