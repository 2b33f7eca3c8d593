//! The install session's scheduler: a phase-aware task graph over an
//! adaptive worker pool, with fail-fast semantics and coroutine-style
//! follow-up chaining.
//!
//! Grounded in the flume-channel, concurrency-bounded worker pattern this
//! workspace already uses elsewhere for bounded concurrent filesystem work
//! (`fs::copy_dir_with_concurrency`'s `try_buffer_unordered`), generalized
//! here into a long-lived pool that outlives any single batch and supports
//! dynamically enqueued follow-up jobs chained from within a running job.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use color_eyre::Result;
use dashmap::DashMap;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{instrument, trace, warn};

use crate::{
    error::{ArtifactFailure, InstallErrorKind},
    observer::{JobLabel, SchedulerObserver},
};

/// The hard cap on worker count, regardless of how high `scale_workers` is
/// asked to go: `min(2 * cpu, 50)`.
pub fn hard_cap() -> usize {
    (2 * num_cpus::get()).min(50)
}

type Payload = Pin<Box<dyn Future<Output = Result<(), ArtifactFailure>> + Send>>;
type FollowUp = Box<dyn FnOnce(&Scheduler) + Send>;

struct Job {
    label: JobLabel,
    payload: Payload,
    follow_up: Option<FollowUp>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

struct Inner {
    tx: flume::Sender<Job>,
    rx: flume::Receiver<Job>,
    observer: Arc<dyn SchedulerObserver>,
    states: DashMap<JobLabel, JobState>,
    errors: DashMap<JobLabel, ArtifactFailure>,
    phase_totals: DashMap<String, (AtomicUsize, AtomicUsize)>,
    worker_count: AtomicUsize,
    aborted: AtomicBool,
    interrupted: AtomicBool,
    fail_fast: bool,
    idle: Notify,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// The install session's scheduler: owns the ready queue, the worker pool,
/// and per-phase counters. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Scheduler(Arc<Inner>);

impl Scheduler {
    pub fn new(observer: Arc<dyn SchedulerObserver>, fail_fast: bool) -> Self {
        let (tx, rx) = flume::unbounded();
        Self(Arc::new(Inner {
            tx,
            rx,
            observer,
            states: DashMap::new(),
            errors: DashMap::new(),
            phase_totals: DashMap::new(),
            worker_count: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            fail_fast,
            idle: Notify::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        }))
    }

    /// Start the worker pool with `max_workers` workers (clamped to
    /// [`hard_cap`]).
    pub fn start(&self, max_workers: usize) {
        self.scale_workers(max_workers);
    }

    /// Grow the pool to `target` workers. Monotonic: never shrinks an
    /// already-larger pool. Safe to call from any thread.
    #[instrument(skip(self))]
    pub fn scale_workers(&self, target: usize) {
        let target = target.min(hard_cap()).max(1);
        let mut workers = self.0.workers.lock().expect("workers lock poisoned");
        while workers.len() < target {
            workers.push(self.spawn_worker());
        }
        self.0.worker_count.store(workers.len(), Ordering::SeqCst);
        trace!(workers = workers.len(), "scaled worker pool");
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let scheduler = self.clone();

        tokio::spawn(async move {
            loop {
                let job = {
                    let rx = scheduler.0.rx.clone();
                    match rx.recv_async().await {
                        Ok(job) => job,
                        Err(_) => return,
                    }
                };

                let should_drain = scheduler.0.interrupted.load(Ordering::SeqCst)
                    || (scheduler.0.fail_fast && scheduler.0.aborted.load(Ordering::SeqCst));
                if should_drain {
                    scheduler.0.states.insert(job.label.clone(), JobState::Failed);
                    scheduler.0.idle.notify_waiters();
                    continue;
                }

                scheduler.0.states.insert(job.label.clone(), JobState::Running);
                scheduler.0.observer.on_start(&job.label);

                let result = job.payload.await;
                match result {
                    Ok(()) => {
                        scheduler.0.states.insert(job.label.clone(), JobState::Completed);
                        scheduler.0.observer.on_complete(&job.label);
                        scheduler.bump_completed(&job.label.phase);
                    }
                    Err(failure) => {
                        scheduler.0.states.insert(job.label.clone(), JobState::Failed);
                        scheduler.0.observer.on_fail(&job.label, &failure.message);
                        warn!(job = %job.label, kind = %failure.kind, "job failed");
                        scheduler.0.errors.insert(job.label.clone(), failure);
                        if scheduler.0.fail_fast {
                            scheduler.0.aborted.store(true, Ordering::SeqCst);
                        }
                        scheduler.bump_completed(&job.label.phase);
                    }
                }

                if let Some(follow_up) = job.follow_up {
                    follow_up(&scheduler);
                }
                scheduler.0.idle.notify_waiters();
            }
        })
    }

    fn bump_completed(&self, phase: &str) {
        if let Some(totals) = self.0.phase_totals.get(phase) {
            totals.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn register(&self, label: &JobLabel) {
        self.0.states.insert(label.clone(), JobState::Pending);
        self.0
            .phase_totals
            .entry(label.phase.clone())
            .or_insert_with(|| (AtomicUsize::new(0), AtomicUsize::new(0)))
            .0
            .fetch_add(1, Ordering::SeqCst);
        self.0.observer.on_enqueue(label);
    }

    /// Enqueue a job under `phase` with the given `name` and async payload.
    /// Returns the job's label, usable with [`Self::wait_for`].
    #[instrument(skip(self, payload))]
    pub fn enqueue<F>(&self, phase: &str, name: &str, payload: F) -> JobLabel
    where
        F: Future<Output = Result<(), ArtifactFailure>> + Send + 'static,
    {
        self.enqueue_with_follow_up(phase, name, payload, None)
    }

    /// Enqueue a job with a follow-up invoked, inside the worker, once the
    /// job reaches its terminal state. The follow-up may itself call
    /// [`Self::enqueue`] — this is how a `download` job chains its `link`
    /// or `build_ext` successor without involving the main thread.
    pub fn enqueue_with_follow_up<F>(
        &self,
        phase: &str,
        name: &str,
        payload: F,
        follow_up: Option<FollowUp>,
    ) -> JobLabel
    where
        F: Future<Output = Result<(), ArtifactFailure>> + Send + 'static,
    {
        let label = JobLabel {
            phase: phase.to_string(),
            name: name.to_string(),
        };
        self.register(&label);

        let job = Job {
            label: label.clone(),
            payload: Box::pin(payload),
            follow_up,
        };
        let _ = self.0.tx.send(job);
        label
    }

    /// Block until every job in `phase` has reached a terminal state.
    #[instrument(skip(self))]
    pub async fn wait_for(&self, phase: &str) {
        loop {
            let Some(totals) = self.0.phase_totals.get(phase) else {
                return;
            };
            let total = totals.0.load(Ordering::SeqCst);
            let done = totals.1.load(Ordering::SeqCst);
            drop(totals);
            if done >= total {
                return;
            }
            if self.0.interrupted.load(Ordering::SeqCst) || (self.0.fail_fast && self.0.aborted.load(Ordering::SeqCst)) {
                return;
            }
            self.0.idle.notified().await;
        }
    }

    /// Block until every enqueued job, across every phase, has reached a
    /// terminal state.
    pub async fn wait_all(&self) {
        loop {
            let all_done = self
                .0
                .phase_totals
                .iter()
                .all(|entry| entry.1.load(Ordering::SeqCst) >= entry.0.load(Ordering::SeqCst));
            if all_done {
                return;
            }
            if self.0.interrupted.load(Ordering::SeqCst) || (self.0.fail_fast && self.0.aborted.load(Ordering::SeqCst)) {
                return;
            }
            self.0.idle.notified().await;
        }
    }

    /// Per-phase `(total, completed)` counters.
    pub fn stats(&self) -> Vec<(String, usize, usize)> {
        self.0
            .phase_totals
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().0.load(Ordering::SeqCst),
                    entry.value().1.load(Ordering::SeqCst),
                )
            })
            .collect()
    }

    /// Every failure recorded so far, across all phases.
    pub fn errors(&self) -> Vec<ArtifactFailure> {
        self.0.errors.iter().map(|e| e.value().clone()).collect()
    }

    pub fn aborted(&self) -> bool {
        self.0.aborted.load(Ordering::SeqCst)
    }

    /// Signal an operator interrupt: in-flight jobs are left to finish, but
    /// every still-pending job drains as a failure and `wait_for`/`wait_all`
    /// return immediately, regardless of `fail_fast`.
    pub fn interrupt(&self) {
        self.0.interrupted.store(true, Ordering::SeqCst);
        self.0.idle.notify_waiters();
    }

    pub fn interrupted(&self) -> bool {
        self.0.interrupted.load(Ordering::SeqCst)
    }

    /// Drain the ready queue and join every worker. Idempotent.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        while self.0.rx.try_recv().is_ok() {}
        let workers = {
            let mut workers = self.0.workers.lock().expect("workers lock poisoned");
            std::mem::take(&mut *workers)
        };
        for worker in workers {
            worker.abort();
        }
    }
}

/// Build an [`ArtifactFailure`] for a job, attaching its kind and message.
pub fn failure(identifier: impl Into<String>, kind: InstallErrorKind, err: &color_eyre::Report) -> ArtifactFailure {
    ArtifactFailure {
        identifier: identifier.into(),
        kind,
        message: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;

    #[tokio::test]
    async fn runs_jobs_and_reports_stats() {
        let scheduler = Scheduler::new(Arc::new(NullObserver), false);
        scheduler.start(2);

        for i in 0..5 {
            scheduler.enqueue("fetch", &format!("job-{i}"), async { Ok(()) });
        }
        scheduler.wait_for("fetch").await;

        let stats = scheduler.stats();
        let (_, total, completed) = stats.iter().find(|(p, _, _)| p == "fetch").unwrap();
        assert_eq!(*total, 5);
        assert_eq!(*completed, 5);
        assert!(scheduler.errors().is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn fail_fast_sets_aborted() {
        let scheduler = Scheduler::new(Arc::new(NullObserver), true);
        scheduler.start(1);
        scheduler.enqueue("download", "bad", async {
            Err(ArtifactFailure {
                identifier: "bad".into(),
                kind: InstallErrorKind::Network,
                message: "boom".into(),
            })
        });
        scheduler.wait_for("download").await;
        assert!(scheduler.aborted());
        assert_eq!(scheduler.errors().len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn interrupt_drains_pending_work_regardless_of_fail_fast() {
        let scheduler = Scheduler::new(Arc::new(NullObserver), false);
        scheduler.start(1);
        scheduler.interrupt();
        scheduler.enqueue("install", "never-runs", async { Ok(()) });
        scheduler.wait_for("install").await;
        assert!(scheduler.interrupted());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn follow_up_chains_a_successor_job() {
        let scheduler = Scheduler::new(Arc::new(NullObserver), false);
        scheduler.start(1);
        scheduler.enqueue_with_follow_up(
            "download",
            "a",
            async { Ok(()) },
            Some(Box::new(|scheduler: &Scheduler| {
                scheduler.enqueue("link", "a", async { Ok(()) });
            })),
        );
        scheduler.wait_for("download").await;
        scheduler.wait_for("link").await;
        let stats = scheduler.stats();
        assert!(stats.iter().any(|(p, total, completed)| p == "link" && *total == 1 && *completed == 1));
        scheduler.shutdown().await;
    }
}
