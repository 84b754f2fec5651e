use std::fmt;
use std::future::Future;

use serde::Serialize;
use serializer_adapters::AdapterError;
use serializer_core::RunContext;
use serializer_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// Network or protocol failure talking to a source.
    Transport,
    /// Read or write against the record store failed.
    Store,
    /// The run deadline passed; remaining work was skipped.
    Timeout,
    /// The run task itself died.
    Aborted,
}

/// One failed item-operation, or the timeout that ended a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunError {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    pub kind: RunErrorKind,
    pub message: String,
}

impl RunError {
    pub fn transport(source: &str, ref_id: Option<&str>, err: &AdapterError) -> Self {
        Self::new(source, ref_id, RunErrorKind::Transport, err.to_string())
    }

    pub fn store(source: &str, ref_id: Option<&str>, err: &StoreError) -> Self {
        Self::new(source, ref_id, RunErrorKind::Store, err.to_string())
    }

    pub fn timeout(source: &str) -> Self {
        Self::new(
            source,
            None,
            RunErrorKind::Timeout,
            "scrape timeout reached".to_string(),
        )
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new("*", None, RunErrorKind::Aborted, message.into())
    }

    fn new(source: &str, ref_id: Option<&str>, kind: RunErrorKind, message: String) -> Self {
        Self {
            source: source.to_string(),
            ref_id: ref_id.map(str::to_string),
            kind,
            message,
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ref_id {
            Some(ref_id) => write!(f, "{} {}: {}", self.source, ref_id, self.message),
            None => write!(f, "{}: {}", self.source, self.message),
        }
    }
}

/// Summary of one scheduler invocation. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub created: usize,
    pub updated: usize,
    /// Stale stories re-fetched and still present at the source.
    pub rechecked: usize,
    /// Stale stories newly flagged deleted.
    pub marked_gone: usize,
    pub failed: usize,
    pub errors: Vec<RunError>,
}

impl RunResult {
    pub fn record(&mut self, error: RunError) {
        self.errors.push(error);
        self.failed = self.errors.len();
    }

    pub fn merge(&mut self, other: RunResult) {
        self.created += other.created;
        self.updated += other.updated;
        self.rechecked += other.rechecked;
        self.marked_gone += other.marked_gone;
        self.errors.extend(other.errors);
        self.failed = self.errors.len();
    }

    pub fn timed_out(&self) -> bool {
        self.errors.iter().any(|e| e.kind == RunErrorKind::Timeout)
    }

    /// Records a timeout unless one is already on the list.
    pub fn record_timeout(&mut self, source: &str) {
        if !self.timed_out() {
            self.record(RunError::timeout(source));
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Err` whenever anything failed; the partial counts travel with the error.
    pub fn into_outcome(self) -> Result<RunResult, RunFailed> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(RunFailed { result: self })
        }
    }
}

/// Combined error of a run that recorded at least one failure.
#[derive(Debug, Clone, Error)]
#[error("scrape finished with {} error(s): {}", .result.failed, join_errors(&.result.errors))]
pub struct RunFailed {
    pub result: RunResult,
}

fn join_errors(errors: &[RunError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Awaits `fut` unless the run deadline passes first; `None` means it did.
pub(crate) async fn within_deadline<F: Future>(ctx: &RunContext, fut: F) -> Option<F::Output> {
    match ctx.deadline() {
        Some(deadline) => {
            tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut)
                .await
                .ok()
        }
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_counts_and_keeps_failed_in_step_with_errors() {
        let mut total = RunResult {
            created: 2,
            ..Default::default()
        };
        let mut other = RunResult {
            updated: 3,
            marked_gone: 1,
            ..Default::default()
        };
        other.record(RunError::timeout("hackernews"));
        total.merge(other);
        assert_eq!(total.created, 2);
        assert_eq!(total.updated, 3);
        assert_eq!(total.marked_gone, 1);
        assert_eq!(total.failed, 1);
    }

    #[test]
    fn failed_outcome_keeps_partial_counts() {
        let mut result = RunResult {
            created: 3,
            ..Default::default()
        };
        result.record(RunError::new(
            "hackernews",
            Some("42"),
            RunErrorKind::Store,
            "connection reset".into(),
        ));
        let err = result.into_outcome().expect_err("one error recorded");
        assert_eq!(err.result.created, 3);
        assert_eq!(
            err.to_string(),
            "scrape finished with 1 error(s): hackernews 42: connection reset"
        );
    }

    #[test]
    fn timeout_is_recorded_once() {
        let mut result = RunResult::default();
        result.record_timeout("a");
        result.record_timeout("b");
        assert_eq!(result.failed, 1);
        assert!(result.timed_out());
    }
}
