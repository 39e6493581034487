//! Background task queue
//!
//! Long operations (downloads, folder provisioning, ISO uploads) run as tokio
//! tasks. Each reports progress and its final outcome on one event channel
//! drained by the reconciler loop, and can be cancelled through its token.

use forensicvm_common::{ArtifactKind, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ProgressFn;

pub type TaskId = u64;

/// What a background task does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    ProvisionFolders,
    RecreateFolders,
    Download(ArtifactKind),
    UploadIso,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::ProvisionFolders => write!(f, "provision folders"),
            TaskKind::RecreateFolders => write!(f, "recreate folders"),
            TaskKind::Download(kind) => write!(f, "download {}", kind),
            TaskKind::UploadIso => write!(f, "upload iso"),
        }
    }
}

#[derive(Debug)]
pub enum TaskEvent {
    Progress {
        id: TaskId,
        done: u64,
        total: Option<u64>,
    },
    Finished {
        id: TaskId,
        kind: TaskKind,
        outcome: Result<String>,
    },
}

/// Handle given to a running job
#[derive(Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub cancel: CancellationToken,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl TaskContext {
    pub fn progress(&self, done: u64, total: Option<u64>) {
        let _ = self.events.send(TaskEvent::Progress { id: self.id, done, total });
    }

    /// Progress callback suitable for client transfers
    pub fn progress_fn(&self) -> ProgressFn {
        let ctx = self.clone();
        Arc::new(move |done, total| ctx.progress(done, total))
    }
}

struct RunningTask {
    kind: TaskKind,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Spawns and tracks background jobs
pub struct TaskQueue {
    next_id: TaskId,
    events: mpsc::UnboundedSender<TaskEvent>,
    running: HashMap<TaskId, RunningTask>,
}

impl TaskQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                next_id: 1,
                events,
                running: HashMap::new(),
            },
            rx,
        )
    }

    /// Start a job. Its result is delivered as [`TaskEvent::Finished`].
    pub fn spawn<F, Fut>(&mut self, kind: TaskKind, job: F) -> TaskId
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        let cancel = CancellationToken::new();
        let ctx = TaskContext {
            id,
            cancel: cancel.clone(),
            events: self.events.clone(),
        };
        let events = self.events.clone();
        let job = job(ctx);

        let handle = tokio::spawn(async move {
            let outcome = job.await;
            let _ = events.send(TaskEvent::Finished { id, kind, outcome });
        });

        debug!("Task {} started: {}", id, kind);
        self.running.insert(id, RunningTask { kind, cancel, handle });
        id
    }

    /// Request cancellation; the job still reports `Finished`
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.running.get(&id) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a task after its `Finished` event was handled
    pub fn complete(&mut self, id: TaskId) -> Option<TaskKind> {
        self.running.remove(&id).map(|task| task.kind)
    }

    pub fn is_running(&self, kind: TaskKind) -> bool {
        self.running.values().any(|task| task.kind == kind)
    }

    pub fn active(&self) -> Vec<(TaskId, TaskKind)> {
        let mut active: Vec<_> = self.running.iter().map(|(id, task)| (*id, task.kind)).collect();
        active.sort_by_key(|(id, _)| *id);
        active
    }

    /// Cancel everything and stop waiting for results
    pub fn shutdown(&mut self) {
        for (_, task) in self.running.drain() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }
}
