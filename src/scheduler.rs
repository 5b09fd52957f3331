// src/scheduler.rs
use crate::cell::TonAddress;
use crate::db::Store;
use crate::models::ProjectionJob;
use chrono::Utc;
use eyre::{eyre, Result};
use futures_util::future::{select_all, BoxFuture};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

pub type Job = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn job<F, Fut>(f: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Held for the duration of one run; dropping it (even on panic) frees the task.
pub struct InProgress {
    flag: Arc<AtomicBool>,
}

impl InProgress {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct RecurringTask {
    name: &'static str,
    every: Duration,
    job: Job,
    in_progress: Arc<AtomicBool>,
}

impl RecurringTask {
    pub fn new(name: &'static str, every: Duration, job: Job) -> Self {
        Self {
            name,
            every,
            job,
            in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Starts one run unless the previous one is still going.
    pub fn fire(&self) -> bool {
        let Some(token) = InProgress::acquire(&self.in_progress) else {
            debug!("[{}] previous run still in progress, skipping tick", self.name);
            return false;
        };

        let job = Arc::clone(&self.job);
        let name = self.name;
        tokio::spawn(async move {
            let _token = token;
            if let Err(e) = job().await {
                error!("[{}] run failed: {:#}", name, e);
            }
        });
        true
    }

    async fn run(self) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.fire();
        }
    }
}

#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<RecurringTask>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &'static str, every: Duration, job: Job) {
        info!("Scheduled {} every {:?}", name, every);
        self.tasks.push(RecurringTask::new(name, every, job));
    }

    /// Drives every task; only returns if a ticker dies.
    pub async fn run(self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(eyre!("no tasks scheduled"));
        }
        let names: Vec<&'static str> = self.tasks.iter().map(|t| t.name).collect();
        let handles = self
            .tasks
            .into_iter()
            .map(|task| tokio::spawn(task.run()));
        let (result, index, _rest) = select_all(handles).await;
        result?;
        Err(eyre!("task {} stopped", names[index]))
    }
}

/// One async mutex per key, created on demand and dropped once unused.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Settle-delayed contract reads, persisted so they survive restarts.
pub struct ProjectionQueue {
    store: Arc<dyn Store>,
    settle_delay: Duration,
}

impl ProjectionQueue {
    pub fn new(store: Arc<dyn Store>, settle_delay: Duration) -> Self {
        Self { store, settle_delay }
    }

    pub async fn schedule(&self, contract: &TonAddress, event_time: u64) -> Result<()> {
        let job = ProjectionJob {
            contract_address: *contract,
            due_at: Utc::now().timestamp_millis() + self.settle_delay.as_millis() as i64,
            first_event: event_time,
            last_event: event_time,
        };
        debug!("Projection of {} due at {}", contract, job.due_at);
        self.store.enqueue_projection(&job).await
    }

    pub async fn due(&self) -> Result<Vec<ProjectionJob>> {
        self.store.due_projections(Utc::now().timestamp_millis()).await
    }

    pub async fn complete(&self, job: &ProjectionJob) -> Result<()> {
        self.store.complete_projection(job).await
    }
}
