//! Job Scheduler: the driver loop that fires pending jobs at their due time.
//!
//! A single tokio task sleeps until the earliest due job (or until woken by
//! an `add`), then spawns every due job as its own task. Firing never blocks
//! the loop, and a failing or panicking job never stops it.
//!
//! The job table is the only shared mutable state. It sits behind a
//! `std::sync::Mutex` that is never held across an `.await`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::cron::CronSpec;
use crate::jobs::{retry_id, Job, JobCallback, JobInfo, JobKind};

/// Upper bound on a single sleep, so wall-clock jumps are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Counters since start.
#[derive(Debug, Default)]
struct Counters {
    fired: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    skipped_overlap: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending: usize,
    pub fired: u64,
    pub failed: u64,
    pub retried: u64,
    pub skipped_overlap: u64,
}

struct Entry {
    job: Job,
    next_run: DateTime<Utc>,
    generation: u64,
    running: Arc<AtomicUsize>,
}

/// Jobs by id plus a min-heap of (due, generation, id). Heap entries whose
/// generation no longer matches the table are stale and dropped on pop.
#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, Entry>,
    queue: BinaryHeap<Reverse<(DateTime<Utc>, u64, String)>>,
    next_generation: u64,
}

impl JobTable {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct Firing {
    id: String,
    kind: JobKind,
    callback: JobCallback,
    retry_after: Option<Duration>,
    running: Arc<AtomicUsize>,
}

struct Inner {
    table: Mutex<JobTable>,
    wake: Notify,
    clock: Arc<dyn Clock>,
    max_instances: usize,
    shutdown: AtomicBool,
    counters: Counters,
}

/// Cloneable handle to the shared job table and driver.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(clock: Arc<dyn Clock>, max_instances: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(JobTable::default()),
                wake: Notify::new(),
                clock,
                max_instances: max_instances.max(1),
                shutdown: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.inner.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    /// Register a job, replacing any job with the same id.
    /// Returns the first run instant, or None if the trigger never fires.
    pub fn schedule(&self, job: Job) -> Option<DateTime<Utc>> {
        let now = self.now();
        let Some(next_run) = job.first_run(now) else {
            tracing::warn!("⚠️ Job '{}' has no future run, not scheduled", job.id);
            self.remove(&job.id);
            return None;
        };

        {
            let mut table = self.table();
            let generation = table.bump();
            let id = job.id.clone();
            tracing::debug!("📅 Job scheduled: '{}' ({}) at {}", id, job.kind, next_run);
            table.jobs.insert(
                id.clone(),
                Entry {
                    job,
                    next_run,
                    generation,
                    running: Arc::new(AtomicUsize::new(0)),
                },
            );
            table.queue.push(Reverse((next_run, generation, id)));
        }
        self.inner.wake.notify_one();
        Some(next_run)
    }

    /// One-shot job at `run_at`.
    pub fn add(&self, job_id: impl Into<String>, kind: JobKind, run_at: DateTime<Utc>, callback: JobCallback) -> Option<DateTime<Utc>> {
        self.schedule(Job::once(job_id, kind, run_at, callback))
    }

    /// Recurring job on a cron spec.
    pub fn add_recurring(&self, job_id: impl Into<String>, kind: JobKind, spec: CronSpec, callback: JobCallback) -> Option<DateTime<Utc>> {
        self.schedule(Job::recurring(job_id, kind, spec, callback))
    }

    /// Cancel a job. Missing ids are fine: cancellation races are normal.
    pub fn remove(&self, job_id: &str) -> bool {
        let removed = self.table().jobs.remove(job_id).is_some();
        if removed {
            tracing::debug!("🗑️ Job removed: '{}'", job_id);
        }
        removed
    }

    /// Cancel every job whose id matches. Returns how many were removed.
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut table = self.table();
        let before = table.jobs.len();
        table.jobs.retain(|id, _| !predicate(id));
        before - table.jobs.len()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.table().jobs.contains_key(job_id)
    }

    pub fn next_run_time(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.table().jobs.get(job_id).map(|e| e.next_run)
    }

    pub fn len(&self) -> usize {
        self.table().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending jobs ordered by next run.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .table()
            .jobs
            .iter()
            .map(|(id, e)| JobInfo {
                id: id.clone(),
                kind: e.job.kind,
                next_run: e.next_run,
                recurring: e.job.is_recurring(),
            })
            .collect();
        jobs.sort_by(|a, b| a.next_run.cmp(&b.next_run).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            pending: self.len(),
            fired: c.fired.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            skipped_overlap: c.skipped_overlap.load(Ordering::Relaxed),
        }
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut table = self.table();
        // Drop stale heads so the driver doesn't wake for cancelled jobs.
        while let Some(Reverse((_, generation, id))) = table.queue.peek() {
            let live = table.jobs.get(id).is_some_and(|e| e.generation == *generation);
            if live {
                break;
            }
            table.queue.pop();
        }
        table.queue.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Fire every job due at `now`. Each firing runs as its own task; the
    /// handles are returned so callers (tests) can await completion.
    pub fn run_pending(&self, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let mut firings = Vec::new();
        {
            let mut guard = self.table();
            let table = &mut *guard;
            loop {
                let due = match table.queue.peek() {
                    Some(Reverse((at, _, _))) => *at <= now,
                    None => false,
                };
                if !due {
                    break;
                }
                let Some(Reverse((_, generation, id))) = table.queue.pop() else {
                    break;
                };
                let live = table.jobs.get(&id).is_some_and(|e| e.generation == generation);
                if !live {
                    continue;
                }

                let recurring = table.jobs.get(&id).is_some_and(|e| e.job.is_recurring());
                if !recurring {
                    if let Some(entry) = table.jobs.remove(&id) {
                        firings.push(Firing {
                            id,
                            kind: entry.job.kind,
                            callback: entry.job.callback,
                            retry_after: entry.job.retry_after,
                            running: entry.running,
                        });
                    }
                    continue;
                }

                // Recurring: reschedule from `now` first, so missed occurrences coalesce.
                let next_generation = table.bump();
                let Some(entry) = table.jobs.get_mut(&id) else {
                    continue;
                };
                let next = entry.job.first_run(now);
                let firing = if entry.running.load(Ordering::SeqCst) >= self.inner.max_instances {
                    tracing::warn!(
                        "⏳ Job '{}' still has {} running instances, skipping this run",
                        id,
                        self.inner.max_instances
                    );
                    self.inner.counters.skipped_overlap.fetch_add(1, Ordering::Relaxed);
                    None
                } else {
                    Some(Firing {
                        id: id.clone(),
                        kind: entry.job.kind,
                        callback: entry.job.callback.clone(),
                        retry_after: entry.job.retry_after,
                        running: entry.running.clone(),
                    })
                };
                match next {
                    Some(next_run) => {
                        entry.next_run = next_run;
                        entry.generation = next_generation;
                        table.queue.push(Reverse((next_run, next_generation, id)));
                    }
                    None => {
                        tracing::warn!("⚠️ Recurring job '{}' has no next run, dropping it", id);
                        table.jobs.remove(&id);
                    }
                }
                firings.extend(firing);
            }
        }

        firings
            .into_iter()
            .map(|firing| {
                firing.running.fetch_add(1, Ordering::SeqCst);
                self.inner.counters.fired.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("🔔 Job fired: '{}' ({})", firing.id, firing.kind);
                tokio::spawn(execute(self.clone(), firing))
            })
            .collect()
    }

    /// Spawn the driver loop as a background tokio task.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.drive().await })
    }

    /// Ask the driver loop to exit. Already-spawned jobs run to completion.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    async fn drive(&self) {
        tracing::info!("⏰ Job scheduler started ({} pending jobs)", self.len());
        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let _ = self.run_pending(self.now());

            match self.next_due() {
                Some(at) => {
                    let wait = (at - self.now()).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.inner.wake.notified() => {}
                    }
                }
                None => self.inner.wake.notified().await,
            }
        }
        tracing::info!("🛑 Job scheduler stopped");
    }
}

async fn execute(scheduler: JobScheduler, firing: Firing) {
    let callback = firing.callback.clone();
    let result = AssertUnwindSafe(async move { callback().await })
        .catch_unwind()
        .await;
    firing.running.fetch_sub(1, Ordering::SeqCst);

    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("job panicked".to_string()),
    };
    let Some(reason) = failure else {
        return;
    };

    scheduler.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
    tracing::error!("❌ Job '{}' ({}) failed: {}", firing.id, firing.kind, reason);

    if let Some(delay) = firing.retry_after {
        let at = scheduler.now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        // The retry carries no retry policy of its own: one attempt, then dropped.
        let retry = Job::once(retry_id(&firing.id), firing.kind, at, firing.callback);
        if scheduler.schedule(retry).is_some() {
            scheduler.inner.counters.retried.fetch_add(1, Ordering::Relaxed);
            tracing::info!("🔁 Retrying '{}' at {}", firing.id, at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::jobs::job_callback;
    use chrono::TimeZone;
    use emojournal_core::error::EmoJournalError;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 7, 0, 0).unwrap()
    }

    fn counting(counter: Arc<AtomicUsize>) -> JobCallback {
        job_callback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn failing(counter: Arc<AtomicUsize>) -> JobCallback {
        job_callback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EmoJournalError::Scheduler("boom".into()))
            }
        })
    }

    async fn join_all(handles: Vec<JoinHandle<()>>) -> usize {
        let n = handles.len();
        for h in handles {
            h.await.unwrap();
        }
        n
    }

    fn scheduler() -> JobScheduler {
        JobScheduler::new(Arc::new(ManualClock::new(t0())), 3)
    }

    #[tokio::test]
    async fn test_replace_fires_once_at_new_time() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let first = t0() + chrono::Duration::minutes(10);
        let second = t0() + chrono::Duration::minutes(20);

        sched.add("job", JobKind::Ping, first, counting(hits.clone()));
        sched.add("job", JobKind::Ping, second, counting(hits.clone()));
        assert_eq!(sched.len(), 1);

        assert_eq!(join_all(sched.run_pending(first)).await, 0);
        assert_eq!(join_all(sched.run_pending(second)).await, 1);
        assert_eq!(join_all(sched.run_pending(second + chrono::Duration::hours(1))).await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(sched.is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let at = t0() + chrono::Duration::minutes(5);
        sched.add("keep", JobKind::Ping, at, counting(hits.clone()));

        assert!(!sched.remove("never-existed"));
        assert!(sched.contains("keep"));
        join_all(sched.run_pending(at)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_removed_job_does_not_fire() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let at = t0() + chrono::Duration::minutes(5);
        sched.add("gone", JobKind::Ping, at, counting(hits.clone()));
        assert!(sched.remove("gone"));
        assert_eq!(join_all(sched.run_pending(at)).await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_where_matches_prefix() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let at = t0() + chrono::Duration::minutes(5);
        sched.add("ping_1_a", JobKind::Ping, at, counting(hits.clone()));
        sched.add("ping_1_b", JobKind::Ping, at, counting(hits.clone()));
        sched.add("ping_2_a", JobKind::Ping, at, counting(hits.clone()));
        assert_eq!(sched.remove_where(|id| id.starts_with("ping_1_")), 2);
        assert_eq!(sched.len(), 1);
    }

    #[tokio::test]
    async fn test_recurring_reschedules() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let first = sched
            .add_recurring("hourly", JobKind::HourlySweep, CronSpec::hourly(), counting(hits.clone()))
            .unwrap();
        assert_eq!(first, t0() + chrono::Duration::hours(1));

        join_all(sched.run_pending(first)).await;
        assert_eq!(sched.next_run_time("hourly"), Some(first + chrono::Duration::hours(1)));

        // Three hours late: one firing, not three.
        join_all(sched.run_pending(first + chrono::Duration::hours(4))).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(sched.next_run_time("hourly"), Some(first + chrono::Duration::hours(5)));
    }

    #[tokio::test]
    async fn test_recurring_overlap_is_bounded() {
        let sched = JobScheduler::new(Arc::new(ManualClock::new(t0())), 1);
        let gate = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));
        let callback = {
            let gate = gate.clone();
            let started = started.clone();
            job_callback(move || {
                let gate = gate.clone();
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(())
                }
            })
        };
        let first = sched
            .add_recurring("slow", JobKind::HourlySweep, CronSpec::hourly(), callback)
            .unwrap();

        let blocked = sched.run_pending(first);
        assert_eq!(blocked.len(), 1);
        let skipped = sched.run_pending(first + chrono::Duration::hours(1));
        assert!(skipped.is_empty());
        assert_eq!(sched.stats().skipped_overlap, 1);

        gate.notify_one();
        join_all(blocked).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        // Slot freed: the next occurrence runs again.
        let next = sched.next_run_time("slow").unwrap();
        let again = sched.run_pending(next);
        assert_eq!(again.len(), 1);
        gate.notify_one();
        join_all(again).await;
    }

    #[tokio::test]
    async fn test_failed_job_retries_once() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sched = JobScheduler::new(clock.clone(), 3);
        let attempts = Arc::new(AtomicUsize::new(0));
        let at = t0() + chrono::Duration::minutes(1);
        sched.schedule(
            Job::once("ping_1_20261014_1300", JobKind::Ping, at, failing(attempts.clone()))
                .with_retry(Duration::from_secs(60)),
        );

        clock.set(at);
        join_all(sched.run_pending(at)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let retry_at = sched.next_run_time("ping_1_20261014_1300_retry").unwrap();
        assert_eq!(retry_at, at + chrono::Duration::seconds(60));

        clock.set(retry_at);
        join_all(sched.run_pending(retry_at)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // Bounded: no retry of the retry.
        assert!(sched.is_empty());
        let stats = sched.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.retried, 1);
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let sched = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let at = t0() + chrono::Duration::minutes(1);
        let panicking = job_callback(|| async {
            let exploded = true;
            if exploded {
                panic!("callback exploded");
            }
            Ok(())
        });
        sched.add("bad", JobKind::Maintenance, at, panicking);
        sched.add("good", JobKind::Ping, at, counting(hits.clone()));

        join_all(sched.run_pending(at)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sched.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_driver_fires_on_time() {
        let sched = JobScheduler::new(Arc::new(SystemClock), 3);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let callback = job_callback(move || {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Ok(())
            }
        });

        let driver = sched.start();
        sched.add("soon", JobKind::Snooze, Utc::now() + chrono::Duration::milliseconds(50), callback);
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("job did not fire")
            .unwrap();
        sched.shutdown();
        tokio::time::timeout(Duration::from_secs(5), driver).await.unwrap().unwrap();
    }
}
