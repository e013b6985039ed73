//! Background jobs with progress reporting and cooperative cancellation.
//!
//! A job runs on its own thread, reports through a channel of
//! [`TaskUpdate`]s and polls a shared cancel flag between work items.

pub mod faces;
pub mod manager;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use faces::{run_faces_background, run_maintenance, MaintenanceOptions, MaintenanceResult};
pub use manager::BackgroundTaskManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Index,
    Cluster,
    Match,
    Optimize,
    Audit,
    Reset,
    /// Cluster, match, optimize and audit in sequence.
    Maintenance,
}

impl TaskType {
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskType::Index => "Face Indexing",
            TaskType::Cluster => "Face Clustering",
            TaskType::Match => "Face Matching",
            TaskType::Optimize => "Cluster Optimization",
            TaskType::Audit => "Face Audit",
            TaskType::Reset => "Face Reset",
            TaskType::Maintenance => "Face Maintenance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<String>,
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self {
            current,
            total,
            current_item: None,
            message: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// 0 to 100.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

/// Messages a job sends while it runs. The last one is always
/// `Completed`, `Cancelled` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdate {
    Started { total: usize },
    Progress(TaskProgress),
    Completed { message: String },
    Cancelled,
    Failed { error: String },
}

/// A job tracked by the [`BackgroundTaskManager`].
pub struct BackgroundTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub progress: Option<TaskProgress>,
    pub cancel_flag: Arc<AtomicBool>,
    pub receiver: mpsc::Receiver<TaskUpdate>,
    pub started_at: Instant,
}

impl BackgroundTask {
    pub fn new(task_type: TaskType, cancel_flag: Arc<AtomicBool>, receiver: mpsc::Receiver<TaskUpdate>) -> Self {
        Self {
            id: TaskId::next(),
            task_type,
            state: TaskState::Running,
            progress: None,
            cancel_flag,
            receiver,
            started_at: Instant::now(),
        }
    }

    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }
}

/// A finished job as reported by [`BackgroundTaskManager::poll_updates`].
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
    pub id: TaskId,
    pub task_type: TaskType,
    pub message: String,
    pub success: bool,
}
