use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_core::Node;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    executor::ScriptExecutor,
    job::{Job, JobSummary},
    store::JobStore,
};

/// Lifecycle and execution notifications, for monitoring and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Started,
    Stopped,
    /// `next_due` is `None` when the job was removed while it ran.
    JobCompleted {
        name: String,
        next_due: Option<DateTime<Utc>>,
    },
    JobFailed {
        name: String,
        error: String,
        next_due: Option<DateTime<Utc>>,
    },
}

struct Entry {
    job: Job,
    /// Distinguishes a job from a later one admitted under the same name.
    ticket: u64,
}

#[derive(Default)]
struct JobTable {
    /// Ordered by name, which makes tie-breaking between equal due dates stable.
    entries: BTreeMap<String, Entry>,
    next_ticket: u64,
    /// Set when the last write to the store failed.
    dirty: bool,
}

impl JobTable {
    fn admit(&mut self, job: Job) {
        self.next_ticket += 1;
        let entry = Entry {
            job,
            ticket: self.next_ticket,
        };
        self.entries.insert(entry.job.name().to_string(), entry);
    }

    /// Job with the earliest due date; the first name wins a tie.
    fn soonest(&self) -> Option<(&str, DateTime<Utc>)> {
        self.entries
            .iter()
            .filter_map(|(name, entry)| entry.job.due().map(|due| (name.as_str(), due)))
            .min_by_key(|(_, due)| *due)
    }

    fn nodes(&self) -> Vec<Node> {
        self.entries.values().map(|e| e.job.to_node()).collect()
    }
}

struct Shared {
    jobs: Mutex<JobTable>,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn ScriptExecutor>,
    /// Pinged on every change to the job set so the loop re-evaluates its wait.
    wake: Notify,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<SchedulerEvent>,
}

/// Owns the job set, drives the due-date loop and persists every change.
///
/// One background task executes jobs, one at a time, in due-date order.
/// `add`, `remove` and `list` may be called from any task while it runs; the
/// job table is never locked while a script executes.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn JobStore>, executor: Arc<dyn ScriptExecutor>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(JobTable::default()),
                store,
                executor,
                wake: Notify::new(),
                shutdown,
                events,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Replace the in-memory job set with the persisted one, arming every
    /// job from the same current instant. Returns the number of jobs loaded.
    ///
    /// Fails without touching the current set if the store cannot be read
    /// or any persisted job is malformed.
    pub async fn load(&self) -> Result<usize> {
        let nodes = self.shared.store.read_all().await?;

        // one instant for the whole batch, so jobs sharing a policy share a due date
        let now = Utc::now();
        let mut jobs: BTreeMap<String, Job> = BTreeMap::new();
        for node in &nodes {
            let mut job = Job::from_node(node)?;
            if jobs.contains_key(job.name()) {
                return Err(SchedulerError::malformed(job.name(), "duplicate job name"));
            }
            job.calculate_next_due_from(now);
            jobs.insert(job.name().to_string(), job);
        }
        let count = jobs.len();

        {
            let mut table = self.shared.jobs.lock().await;
            table.entries.clear();
            table.dirty = false;
            // tickets keep increasing, so a job executing right now is not
            // mistaken for its reloaded counterpart
            for job in jobs.into_values() {
                table.admit(job);
            }
        }
        self.shared.wake.notify_one();

        info!(count, "jobs loaded");
        Ok(count)
    }

    /// Load persisted jobs and launch the background loop. A no-op when the
    /// loop is already running.
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("task scheduler already running");
            return Ok(());
        }

        self.load().await?;

        self.shared.shutdown.send_replace(false);
        let shutdown = self.shared.shutdown.subscribe();
        let shared = Arc::clone(&self.shared);
        *worker = Some(tokio::spawn(async move { shared.run(shutdown).await }));

        let _ = self.shared.events.send(SchedulerEvent::Started);
        info!("task scheduler started");
        Ok(())
    }

    /// Signal the loop to stop and wait for it to exit. A script that is
    /// executing is allowed to finish; no further job starts. Idempotent.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        let Some(handle) = worker.take() else {
            return;
        };

        self.shared.shutdown.send_replace(true);
        if let Err(e) = handle.await {
            error!("scheduler loop terminated abnormally: {e}");
        }

        let _ = self.shared.events.send(SchedulerEvent::Stopped);
        info!("task scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Arm `job` and admit it. Names are unique; a duplicate is rejected.
    ///
    /// If persisting fails the job stays scheduled and the write is retried
    /// by the loop; the storage error is still returned to the caller.
    pub async fn add(&self, mut job: Job) -> Result<JobSummary> {
        let mut table = self.shared.jobs.lock().await;
        if table.entries.contains_key(job.name()) {
            return Err(SchedulerError::JobExists {
                name: job.name().to_string(),
            });
        }

        job.calculate_next_due();
        let summary = job.summary();
        table.admit(job);
        let persisted = self.shared.persist(&mut table).await;
        drop(table);
        self.shared.wake.notify_one();

        info!(job = %summary.name, repetition = %summary.repetition, due = ?summary.due, "job added");
        persisted.map(|()| summary)
    }

    /// Remove the job called `name`. Same persistence semantics as [`add`].
    ///
    /// [`add`]: TaskScheduler::add
    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut table = self.shared.jobs.lock().await;
        if table.entries.remove(name).is_none() {
            return Err(SchedulerError::JobNotFound {
                name: name.to_string(),
            });
        }
        let persisted = self.shared.persist(&mut table).await;
        drop(table);
        self.shared.wake.notify_one();

        info!(job = %name, "job removed");
        persisted
    }

    /// Snapshot of every job, ordered by name.
    pub async fn list(&self) -> Vec<JobSummary> {
        let table = self.shared.jobs.lock().await;
        table.entries.values().map(|e| e.job.summary()).collect()
    }

    /// The persisted representation of a single job.
    pub async fn get(&self, name: &str) -> Option<Node> {
        let table = self.shared.jobs.lock().await;
        table.entries.get(name).map(|e| e.job.to_node())
    }

    /// The job the loop will run next, and when.
    pub async fn next_due(&self) -> Option<(String, DateTime<Utc>)> {
        let table = self.shared.jobs.lock().await;
        table.soonest().map(|(name, due)| (name.to_string(), due))
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Shared {
    async fn persist(&self, table: &mut JobTable) -> Result<()> {
        match self.store.write_all(&table.nodes()).await {
            Ok(()) => {
                if table.dirty {
                    info!("job set persisted after earlier failure");
                }
                table.dirty = false;
                Ok(())
            }
            Err(e) => {
                table.dirty = true;
                error!(error = %e, "failed to persist job set; in-memory set remains authoritative");
                Err(e)
            }
        }
    }

    /// Main loop. Sleeps until the soonest job is due, waking early on any
    /// change to the job set, until `shutdown` broadcasts `true`.
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = {
                let mut table = self.jobs.lock().await;
                if table.dirty {
                    let _ = self.persist(&mut table).await;
                }
                table.soonest().map(|(name, due)| (name.to_string(), due))
            };

            let wait = match &next {
                Some((name, due)) => {
                    let wait = (*due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    debug!(job = %name, due = %due, wait_ms = wait.as_millis() as u64, "waiting for next job");
                    Some(wait)
                }
                None => {
                    debug!("no jobs scheduled; idling until the job set changes");
                    None
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.changed() => continue,
                _ = self.wake.notified() => {
                    debug!("woken by job set change");
                    continue;
                }
                _ = sleep_for(wait) => {}
            }

            if *shutdown.borrow() {
                break;
            }
            if let Some((name, _)) = next {
                self.run_due(&name).await;
            }
        }

        info!("scheduler loop stopped");
    }

    /// Execute `name` if it is still present and due, then rearm and persist.
    async fn run_due(&self, name: &str) {
        let (script, ticket) = {
            let table = self.jobs.lock().await;
            match table.entries.get(name) {
                Some(entry) if entry.job.is_due(Utc::now()) => {
                    (entry.job.script().clone(), entry.ticket)
                }
                Some(_) => {
                    debug!(job = %name, "job not yet due; rescanning");
                    return;
                }
                None => {
                    debug!(job = %name, "job removed while waiting");
                    return;
                }
            }
        };

        info!(job = %name, "executing job");
        let started = Instant::now();
        let outcome = self.executor.execute(name, &script).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let next_due = {
            let mut table = self.jobs.lock().await;
            let next_due = match table.entries.get_mut(name) {
                Some(entry) if entry.ticket == ticket => {
                    entry.job.calculate_next_due();
                    entry.job.due()
                }
                _ => {
                    warn!(job = %name, "job removed during execution; not rearming");
                    None
                }
            };
            if next_due.is_some() {
                let _ = self.persist(&mut table).await;
            }
            next_due
        };

        let event = match outcome {
            Ok(()) => {
                info!(job = %name, duration_ms, next_due = ?next_due, "job completed");
                SchedulerEvent::JobCompleted {
                    name: name.to_string(),
                    next_due,
                }
            }
            Err(error) => {
                error!(job = %name, duration_ms, next_due = ?next_due, %error, "job failed");
                SchedulerEvent::JobFailed {
                    name: name.to_string(),
                    error,
                    next_due,
                }
            }
        };
        let _ = self.events.send(event);
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::IntervalUnit;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use chrono::TimeDelta;

    struct NoopExecutor;

    #[async_trait]
    impl ScriptExecutor for NoopExecutor {
        async fn execute(&self, _job: &str, _script: &Node) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    fn job(name: &str, unit: IntervalUnit, count: i64) -> Job {
        let script = Node::new(".lambda").with_children([Node::new("sh").with_value("true")]);
        Job::every(name, None, script, unit, count).unwrap()
    }

    fn scheduler(store: Arc<MemoryJobStore>) -> TaskScheduler {
        TaskScheduler::new(store, Arc::new(NoopExecutor))
    }

    #[test]
    fn soonest_breaks_ties_by_name() {
        let due = Utc::now();
        let mut table = JobTable::default();
        for name in ["charlie", "alpha", "bravo"] {
            let mut j = job(name, IntervalUnit::Hours, 1);
            j.calculate_next_due_from(due - TimeDelta::hours(1));
            table.admit(j);
        }
        assert_eq!(table.soonest(), Some(("alpha", due)));
    }

    #[test]
    fn soonest_prefers_earliest() {
        let now = Utc::now();
        let mut table = JobTable::default();
        let mut late = job("a-late", IntervalUnit::Hours, 2);
        late.calculate_next_due_from(now);
        let mut early = job("z-early", IntervalUnit::Minutes, 1);
        early.calculate_next_due_from(now);
        table.admit(late);
        table.admit(early);

        assert_eq!(table.soonest().unwrap().0, "z-early");
        assert!(JobTable::default().soonest().is_none());
    }

    #[tokio::test]
    async fn add_arms_and_persists() {
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = scheduler(store.clone());

        let before = Utc::now();
        let summary = scheduler
            .add(job("daily", IntervalUnit::Days, 1))
            .await
            .unwrap();

        let due = summary.due.unwrap();
        assert!((due - (before + TimeDelta::days(1))).abs() < TimeDelta::milliseconds(50));
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.snapshot()[0].name, "daily");
    }

    #[tokio::test]
    async fn add_rejects_duplicate_names() {
        let scheduler = scheduler(Arc::new(MemoryJobStore::new()));
        scheduler.add(job("a", IntervalUnit::Hours, 1)).await.unwrap();

        let err = scheduler.add(job("a", IntervalUnit::Hours, 2)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobExists { ref name } if name == "a"));
        assert_eq!(scheduler.list().await[0].repetition, "every 1 hour");
    }

    #[tokio::test]
    async fn remove_unknown_job() {
        let scheduler = scheduler(Arc::new(MemoryJobStore::new()));
        let err = scheduler.remove("ghost").await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn remove_persists() {
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = scheduler(store.clone());
        scheduler.add(job("a", IntervalUnit::Hours, 1)).await.unwrap();
        scheduler.add(job("b", IntervalUnit::Hours, 1)).await.unwrap();

        scheduler.remove("a").await.unwrap();

        let names: Vec<_> = store.snapshot().into_iter().map(|n| n.name).collect();
        assert_eq!(names, ["b"]);
        assert!(scheduler.get("a").await.is_none());
    }

    #[tokio::test]
    async fn failed_write_keeps_job_and_retries() {
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = scheduler(store.clone());

        store.set_fail_writes(true);
        let err = scheduler.add(job("a", IntervalUnit::Hours, 1)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Io(_)));
        assert_eq!(scheduler.list().await.len(), 1);
        assert!(store.snapshot().is_empty());

        // next successful write carries the whole in-memory set
        store.set_fail_writes(false);
        scheduler.add(job("b", IntervalUnit::Hours, 1)).await.unwrap();
        let names: Vec<_> = store.snapshot().into_iter().map(|n| n.name).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[tokio::test]
    async fn loop_flushes_dirty_set() {
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = scheduler(store.clone());
        scheduler.start().await.unwrap();

        store.set_fail_writes(true);
        assert!(scheduler.add(job("a", IntervalUnit::Hours, 1)).await.is_err());
        store.set_fail_writes(false);

        // the add woke the loop, which retries the write on its next scan
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.snapshot().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dirty job set was not flushed");

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn load_replaces_set_and_arms_jobs() {
        let persisted = vec![
            job("x", IntervalUnit::Minutes, 1).to_node(),
            job("y", IntervalUnit::Minutes, 2).to_node(),
        ];
        let store = Arc::new(MemoryJobStore::with_jobs(persisted));
        let scheduler = scheduler(store);
        scheduler.add(job("transient", IntervalUnit::Hours, 1)).await.unwrap();

        let count = scheduler.load().await.unwrap();
        assert_eq!(count, 3);
        let jobs = scheduler.list().await;
        assert!(jobs.iter().all(|j| j.due.is_some()));
    }

    #[tokio::test]
    async fn load_arms_batch_from_one_instant() {
        let persisted = vec![
            job("bravo", IntervalUnit::Seconds, 5).to_node(),
            job("alpha", IntervalUnit::Seconds, 5).to_node(),
        ];
        let scheduler = scheduler(Arc::new(MemoryJobStore::with_jobs(persisted)));
        scheduler.load().await.unwrap();

        let jobs = scheduler.list().await;
        assert_eq!(jobs[0].due, jobs[1].due);
        assert_eq!(scheduler.next_due().await.unwrap().0, "alpha");
    }

    #[tokio::test]
    async fn load_rejects_duplicate_names() {
        let node = job("x", IntervalUnit::Minutes, 1).to_node();
        let store = Arc::new(MemoryJobStore::with_jobs(vec![node.clone(), node]));
        let err = scheduler(store).load().await.unwrap_err();
        assert!(matches!(err, SchedulerError::MalformedJob { .. }));
    }

    #[tokio::test]
    async fn start_fails_on_corrupt_store() {
        let store = Arc::new(MemoryJobStore::with_jobs(vec![Node::new("broken")]));
        let scheduler = scheduler(store);

        assert!(scheduler.start().await.is_err());
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let scheduler = scheduler(Arc::new(MemoryJobStore::new()));
        let mut events = scheduler.subscribe();

        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);

        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);

        assert_eq!(events.recv().await.unwrap(), SchedulerEvent::Started);
        assert_eq!(events.recv().await.unwrap(), SchedulerEvent::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let scheduler = scheduler(Arc::new(MemoryJobStore::new()));
        scheduler.start().await.unwrap();
        scheduler.stop().await;
        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn next_due_reports_soonest() {
        let scheduler = scheduler(Arc::new(MemoryJobStore::new()));
        assert!(scheduler.next_due().await.is_none());

        scheduler.add(job("slow", IntervalUnit::Days, 1)).await.unwrap();
        scheduler.add(job("fast", IntervalUnit::Minutes, 1)).await.unwrap();

        assert_eq!(scheduler.next_due().await.unwrap().0, "fast");
    }
}
