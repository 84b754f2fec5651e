use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serializer_adapters::SourceAdapter;
use serializer_core::RunContext;
use serializer_storage::StoryStore;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::reconcile::Reconciler;
use crate::result::{within_deadline, RunError, RunFailed, RunResult};
use crate::stale::{StalenessChecker, StalenessWindow};

/// Shortest accepted timer period.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of the inert timer kept alive while scheduled scraping is off.
pub const DISABLED_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("timer: {0}")]
    Timer(#[from] JobSchedulerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Zero turns the timer-driven scrape off.
    pub interval: Duration,
    /// Zero leaves runs unbounded.
    pub timeout: Duration,
    pub window: StalenessWindow,
    /// Fire one run as soon as the timer starts.
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            window: StalenessWindow::default(),
            run_on_start: true,
        }
    }
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            interval: config.scrape_interval,
            timeout: config.scrape_timeout,
            window: config.staleness,
            ..Default::default()
        }
    }
}

impl SchedulerConfig {
    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn effective_interval(&self) -> Duration {
        if self.enabled() {
            self.interval.max(MIN_INTERVAL)
        } else {
            DISABLED_INTERVAL
        }
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: RunResult,
}

/// Runs scrapes on a timer and on demand, one at a time.
///
/// A timer tick that finds a run in progress is dropped. An on-demand trigger
/// waits for the lock instead, so back-to-back triggers run sequentially.
#[derive(Clone)]
pub struct ScrapeScheduler {
    inner: Arc<Inner>,
    timer: Arc<Mutex<Option<JobScheduler>>>,
}

struct Inner {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    reconciler: Reconciler,
    checker: StalenessChecker,
    config: SchedulerConfig,
    run_lock: Mutex<()>,
    running: AtomicBool,
    closed: AtomicBool,
    last_run: Mutex<Option<LastRun>>,
}

impl ScrapeScheduler {
    pub fn new(
        store: Arc<dyn StoryStore>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapters,
                reconciler: Reconciler::new(store.clone()),
                checker: StalenessChecker::new(store),
                config,
                run_lock: Mutex::new(()),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                last_run: Mutex::new(None),
            }),
            timer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SchedulerState {
        if self.inner.running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    pub async fn last_run(&self) -> Option<LastRun> {
        self.inner.last_run.lock().await.clone()
    }

    /// Runs a scrape on the caller's task, waiting for any in-flight run first.
    pub async fn run_once(&self) -> Result<RunResult, RunFailed> {
        let guard = self.inner.run_lock.lock().await;
        self.inner.run_with_guard(guard).await.into_outcome()
    }

    /// On-demand scrape. The run is detached from the caller, so dropping the
    /// returned future does not cancel it.
    pub async fn trigger(&self) -> Result<RunResult, RunFailed> {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let guard = inner.run_lock.lock().await;
            inner.run_with_guard(guard).await
        });
        match handle.await {
            Ok(result) => result.into_outcome(),
            Err(err) => {
                error!(error = %err, "scrape task failed");
                let mut result = RunResult::default();
                result.record(RunError::aborted(err.to_string()));
                result.into_outcome()
            }
        }
    }

    /// Starts the timer. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return Ok(());
        }

        let config = self.inner.config;
        let period = config.effective_interval();
        if config.enabled() {
            if config.interval < MIN_INTERVAL {
                warn!(requested = ?config.interval, used = ?period, "scrape interval raised to minimum");
            }
            info!(interval = ?period, timeout = ?config.run_timeout(), "scrape timer starting");
        } else {
            info!("scheduled scraping disabled; only on-demand runs will scrape");
        }

        let sched = JobScheduler::new().await?;
        let inner = self.inner.clone();
        let job = Job::new_repeated_async(period, move |_uuid, _l| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.on_tick().await;
            })
        })?;
        sched.add(job).await?;
        sched.start().await?;
        *timer = Some(sched);

        if config.enabled() && config.run_on_start {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.on_tick().await;
            });
        }
        Ok(())
    }

    /// Stops the timer and waits for an in-flight run to finish.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let timer = self.timer.lock().await.take();
        if let Some(mut sched) = timer {
            sched.shutdown().await?;
        }
        let _drain = self.inner.run_lock.lock().await;
        info!("scrape scheduler stopped");
        Ok(())
    }
}

impl Inner {
    /// Timer entry point. Returns `None` when the tick was skipped.
    async fn on_tick(&self) -> Option<RunResult> {
        if !self.config.enabled() {
            debug!("scheduled scraping disabled; tick ignored");
            return None;
        }
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let Ok(guard) = self.run_lock.try_lock() else {
            info!("scrape already in progress; skipping tick");
            return None;
        };

        let result = self.run_with_guard(guard).await;
        if let Err(err) = result.clone().into_outcome() {
            error!(error = %err, "scheduled scrape failed");
        }
        Some(result)
    }

    async fn run_with_guard(&self, _guard: MutexGuard<'_, ()>) -> RunResult {
        let _running = RunningFlag::raise(&self.running);
        let ctx = RunContext::new(self.config.run_timeout());
        let started_at = ctx.now;
        let span = info_span!("scrape_run", run_id = %ctx.run_id);

        let result = self.scrape(&ctx).instrument(span).await;

        *self.last_run.lock().await = Some(LastRun {
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            result: result.clone(),
        });
        result
    }

    async fn scrape(&self, ctx: &RunContext) -> RunResult {
        let mut result = RunResult::default();

        for adapter in &self.adapters {
            let span = info_span!("source", source = adapter.name());
            let keep_going = self
                .scrape_source(ctx, adapter.as_ref(), &mut result)
                .instrument(span)
                .await;
            if !keep_going {
                break;
            }
        }

        info!(
            created = result.created,
            updated = result.updated,
            rechecked = result.rechecked,
            marked_gone = result.marked_gone,
            failed = result.failed,
            "scrape finished"
        );
        result
    }

    /// Batch reconcile, then the staleness pass. `false` once the deadline hit.
    async fn scrape_source(
        &self,
        ctx: &RunContext,
        adapter: &dyn SourceAdapter,
        result: &mut RunResult,
    ) -> bool {
        let source = adapter.name();
        if ctx.expired() {
            result.record_timeout(source);
            return false;
        }

        let batch = match within_deadline(ctx, adapter.fetch_batch(ctx)).await {
            None => {
                result.record_timeout(source);
                return false;
            }
            Some(Err(err)) => {
                warn!(source, error = %err, "fetching batch failed; skipping source");
                result.record(RunError::transport(source, None, &err));
                return true;
            }
            Some(Ok(batch)) => batch,
        };

        result.merge(self.reconciler.reconcile(ctx, source, &batch).await);
        if result.timed_out() {
            return false;
        }
        result.merge(
            self.checker
                .reconcile_stale(ctx, adapter, self.config.window)
                .await,
        );
        !result.timed_out()
    }
}

struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
