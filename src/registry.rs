//! Process-wide job registry.
//!
//! Every task's status lives here, behind a single `RwLock`. Workers mutate
//! their own entry through the methods below; observers only ever receive
//! owned [`TaskView`] copies taken under the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::types::{
    JobId, JobStatus, MonitorSample, ScanHit, ScanTarget, TaskKind, TaskResults, TaskState,
    TaskView,
};

#[derive(Debug)]
struct JobEntry {
    kind: TaskKind,
    target: Option<ScanTarget>,
    state: TaskState,
    progress: u8,
    created_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
    error: Option<String>,
    hits: Vec<ScanHit>,
    samples: VecDeque<MonitorSample>,
    samples_total: u64,
    cancel: CancellationToken,
}

impl JobEntry {
    fn view(&self, id: JobId) -> TaskView {
        let results = match self.kind {
            TaskKind::PortScan => TaskResults::Scan {
                hits: self.hits.clone(),
            },
            TaskKind::SystemMonitor | TaskKind::ProcessMonitor => TaskResults::Monitor {
                recent: self.samples.iter().cloned().collect(),
                samples_total: self.samples_total,
            },
        };
        TaskView {
            id,
            kind: self.kind,
            target: self.target.clone(),
            state: self.state,
            progress: self.progress,
            created_at: self.created_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
            results,
        }
    }

    fn finish(&mut self, state: TaskState, error: Option<String>) {
        if state == TaskState::Completed {
            self.progress = 100;
        }
        self.state = state;
        self.error = error;
        self.completed_at = Some(OffsetDateTime::now_utc());
    }
}

#[derive(Debug)]
pub struct JobRegistry {
    next_id: AtomicU64,
    history_limit: usize,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobRegistry {
    /// `history_limit` bounds how many monitor samples each job keeps.
    pub fn new(history_limit: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            history_limit: history_limit.max(1),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a new job in `pending` state together with its cancellation token.
    pub async fn create(
        &self,
        kind: TaskKind,
        target: Option<ScanTarget>,
    ) -> (JobId, CancellationToken) {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let entry = JobEntry {
            kind,
            target,
            state: TaskState::Pending,
            progress: 0,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
            error: None,
            hits: Vec::new(),
            samples: VecDeque::new(),
            samples_total: 0,
            cancel: cancel.clone(),
        };
        self.jobs.write().await.insert(id, entry);
        (id, cancel)
    }

    pub async fn mark_running(&self, id: JobId) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(e) if e.state == TaskState::Pending => {
                e.state = TaskState::Running;
                true
            }
            _ => false,
        }
    }

    /// Raise progress of a running job. Lower values and updates to
    /// non-running jobs are ignored.
    pub async fn set_progress(&self, id: JobId, value: u8) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(e) if e.state == TaskState::Running && value > e.progress => {
                e.progress = value.min(100);
                true
            }
            _ => false,
        }
    }

    /// Append a hit and update progress in one critical section.
    pub async fn append_hit(&self, id: JobId, hit: ScanHit, progress: u8) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(e) if e.state == TaskState::Running => {
                e.hits.push(hit);
                if progress > e.progress {
                    e.progress = progress.min(100);
                }
                true
            }
            _ => false,
        }
    }

    /// Record a monitor sample, evicting the oldest one once the window is full.
    pub async fn push_sample(&self, id: JobId, sample: MonitorSample) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(e) if e.state == TaskState::Running => {
                if e.samples.len() == self.history_limit {
                    e.samples.pop_front();
                }
                e.samples.push_back(sample);
                e.samples_total += 1;
                true
            }
            _ => false,
        }
    }

    /// Move a job into a terminal state. Returns `true` only for the call that
    /// performed the transition.
    pub async fn complete(&self, id: JobId, state: TaskState, error: Option<String>) -> bool {
        debug_assert!(state.is_terminal());
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(e) if !e.state.is_terminal() => {
                e.finish(state, error);
                true
            }
            _ => false,
        }
    }

    /// Request cancellation. The job becomes `cancelled` immediately and its
    /// worker observes the token at its next iteration. Cancelling a job that
    /// already finished is a no-op and returns `Ok(false)`.
    pub async fn cancel(&self, id: JobId) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        if entry.state.is_terminal() {
            return Ok(false);
        }
        entry.finish(TaskState::Cancelled, None);
        entry.cancel.cancel();
        Ok(true)
    }

    /// Cancel every job that is still live. Used on shutdown.
    pub async fn cancel_all(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let mut n = 0;
        for entry in jobs.values_mut().filter(|e| !e.state.is_terminal()) {
            entry.finish(TaskState::Cancelled, None);
            entry.cancel.cancel();
            n += 1;
        }
        n
    }

    pub async fn snapshot(&self, id: JobId) -> Option<TaskView> {
        self.jobs.read().await.get(&id).map(|e| e.view(id))
    }

    pub async fn status(&self, id: JobId) -> Option<JobStatus> {
        self.snapshot(id).await.map(|v| JobStatus::from(&v))
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<TaskView> {
        let jobs = self.jobs.read().await;
        let mut views: Vec<TaskView> = jobs.iter().map(|(id, e)| e.view(*id)).collect();
        views.sort_by_key(|v| v.id);
        views
    }

    /// Forget terminal jobs that finished more than `ttl` ago. A ttl reaching
    /// past the representable date range expires nothing.
    pub async fn purge_expired(&self, ttl: Duration) -> usize {
        let cutoff = time::Duration::try_from(ttl)
            .ok()
            .and_then(|ttl| OffsetDateTime::now_utc().checked_sub(ttl));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, e| match e.completed_at {
            Some(done) if e.state.is_terminal() => done > cutoff,
            _ => true,
        });
        before - jobs.len()
    }
}
