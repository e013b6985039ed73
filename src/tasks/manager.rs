//! Tracks running jobs and collects their results.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use super::{BackgroundTask, TaskCompletionInfo, TaskId, TaskProgress, TaskState, TaskType, TaskUpdate};

pub struct BackgroundTaskManager {
    tasks: HashMap<TaskId, BackgroundTask>,
    /// Registration order, oldest first.
    order: Vec<TaskId>,
}

impl BackgroundTaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Track a new job. The caller hands the sender and cancel flag to the
    /// thread doing the work.
    pub fn register_task(&mut self, task_type: TaskType) -> (TaskId, Sender<TaskUpdate>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let task = BackgroundTask::new(task_type, cancel_flag.clone(), rx);
        let id = task.id;

        self.tasks.insert(id, task);
        self.order.push(id);

        (id, tx, cancel_flag)
    }

    /// Run `job` on a new thread unless a job of the same type is running.
    pub fn spawn<F>(&mut self, task_type: TaskType, job: F) -> Option<TaskId>
    where
        F: FnOnce(Sender<TaskUpdate>, Arc<AtomicBool>) + Send + 'static,
    {
        if self.is_running(task_type) {
            tracing::debug!(task = task_type.display_name(), "Task already running");
            return None;
        }

        let (id, tx, cancel) = self.register_task(task_type);
        let spawned = thread::Builder::new()
            .name(format!("facekit-{:?}", task_type).to_lowercase())
            .spawn(move || job(tx, cancel));

        if let Err(e) = spawned {
            tracing::error!(task = task_type.display_name(), error = %e, "Failed to start task");
            if let Some(task) = self.tasks.get_mut(&id) {
                task.state = TaskState::Failed(e.to_string());
            }
        }

        Some(id)
    }

    pub fn is_running(&self, task_type: TaskType) -> bool {
        self.tasks.values().any(|t| t.task_type == task_type && t.is_running())
    }

    pub fn cancel_task(&mut self, id: TaskId) -> bool {
        match self.tasks.get(&id) {
            Some(task) if task.is_running() => {
                task.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for task in self.tasks.values().filter(|t| t.is_running()) {
            task.cancel();
        }
    }

    /// Drain pending updates. Finished jobs are returned and forgotten.
    pub fn poll_updates(&mut self) -> Vec<TaskCompletionInfo> {
        let mut finished = Vec::new();

        for (&id, task) in self.tasks.iter_mut() {
            while let Ok(update) = task.receiver.try_recv() {
                let outcome = match update {
                    TaskUpdate::Started { total } => {
                        task.progress = Some(TaskProgress::new(0, total));
                        None
                    }
                    TaskUpdate::Progress(progress) => {
                        task.progress = Some(progress);
                        None
                    }
                    TaskUpdate::Completed { message } => Some((TaskState::Completed, message, true)),
                    TaskUpdate::Cancelled => Some((TaskState::Cancelled, "Cancelled".to_string(), false)),
                    TaskUpdate::Failed { error } => Some((TaskState::Failed(error.clone()), error, false)),
                };

                if let Some((state, message, success)) = outcome {
                    task.state = state;
                    finished.push(TaskCompletionInfo {
                        id,
                        task_type: task.task_type,
                        message,
                        success,
                    });
                    break;
                }
            }
        }

        for info in &finished {
            self.tasks.remove(&info.id);
            self.order.retain(|id| *id != info.id);
        }

        finished
    }

    /// Running jobs, oldest first.
    pub fn running_tasks(&self) -> Vec<&BackgroundTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.is_running())
            .collect()
    }

    pub fn has_running_tasks(&self) -> bool {
        self.tasks.values().any(|t| t.is_running())
    }
}

impl Default for BackgroundTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    fn wait_for(manager: &mut BackgroundTaskManager) -> Vec<TaskCompletionInfo> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let done = manager.poll_updates();
            if !done.is_empty() || Instant::now() > deadline {
                return done;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_spawn_reports_completion() {
        let mut manager = BackgroundTaskManager::new();
        let id = manager
            .spawn(TaskType::Audit, |tx, _| {
                let _ = tx.send(TaskUpdate::Started { total: 1 });
                let _ = tx.send(TaskUpdate::Completed { message: "done".to_string() });
            })
            .unwrap();

        let done = wait_for(&mut manager);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
        assert!(done[0].success);
        assert_eq!(done[0].message, "done");
        assert!(!manager.has_running_tasks());
    }

    #[test]
    fn test_spawn_rejects_duplicate_type() {
        let mut manager = BackgroundTaskManager::new();
        let (_, _tx, _) = manager.register_task(TaskType::Match);
        assert!(manager.spawn(TaskType::Match, |_, _| {}).is_none());
        assert_eq!(manager.running_tasks().len(), 1);
    }

    #[test]
    fn test_cancel_sets_flag() {
        let mut manager = BackgroundTaskManager::new();
        let (id, tx, cancel) = manager.register_task(TaskType::Cluster);

        assert!(manager.cancel_task(id));
        assert!(cancel.load(Ordering::SeqCst));

        tx.send(TaskUpdate::Cancelled).unwrap();
        let done = manager.poll_updates();
        assert_eq!(done.len(), 1);
        assert!(!done[0].success);
        assert!(!manager.cancel_task(id));
    }

    #[test]
    fn test_failed_task() {
        let mut manager = BackgroundTaskManager::new();
        let (_, tx, _) = manager.register_task(TaskType::Reset);
        tx.send(TaskUpdate::Progress(TaskProgress::new(1, 2))).unwrap();
        tx.send(TaskUpdate::Failed { error: "boom".to_string() }).unwrap();

        let done = manager.poll_updates();
        assert_eq!(done[0].message, "boom");
        assert!(!done[0].success);
    }
}
