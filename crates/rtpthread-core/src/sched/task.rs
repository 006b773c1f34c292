//! Preemptible tasks and task identity.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TASK_ID: Cell<u64> = const { Cell::new(0) };
}

/// Identity of a native task. Unique for the life of the process and never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Reserve a fresh id for a task that is about to be spawned.
    #[must_use]
    pub fn allocate() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Id of the calling task.
///
/// Tasks not started through [`spawn`] (the host main thread, test runner
/// threads) receive an id on first call.
#[must_use]
pub fn current_task() -> TaskId {
    TASK_ID.with(|slot| {
        if slot.get() == 0 {
            slot.set(TaskId::allocate().0);
        }
        TaskId(slot.get())
    })
}

/// Creation parameters for a native task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: String,
    pub stack_size: usize,
    /// Recorded only; the hosted scheduler has no priorities.
    pub priority: u8,
    /// Recorded only; the hosted scheduler does not pin tasks.
    pub core: Option<usize>,
}

/// A spawned native task.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    config: TaskConfig,
    handle: JoinHandle<()>,
}

impl Task {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Wait for the task body to return and reclaim the task.
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

/// Start `body` on a new task that reports `id` from [`current_task`].
pub fn spawn<F>(id: TaskId, config: TaskConfig, body: F) -> std::io::Result<Task>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(config.name.clone())
        .stack_size(config.stack_size)
        .spawn(move || {
            TASK_ID.with(|slot| slot.set(id.0));
            body();
        })?;
    Ok(Task { id, config, handle })
}

/// Suspend the calling task for `duration`.
pub fn sleep(duration: Duration) {
    thread::sleep(duration);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn config(name: &str) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            stack_size: 64 * 1024,
            priority: 5,
            core: None,
        }
    }

    #[test]
    fn current_task_is_stable_per_thread() {
        assert_eq!(current_task(), current_task());
    }

    #[test]
    fn spawned_task_reports_preallocated_id() {
        let id = TaskId::allocate();
        let (tx, rx) = mpsc::channel();
        let task = spawn(id, config("probe"), move || {
            tx.send(current_task()).unwrap();
        })
        .unwrap();
        assert_eq!(task.id(), id);
        assert_eq!(task.config().name, "probe");
        task.join().unwrap();
        assert_eq!(rx.recv().unwrap(), id);
    }

    #[test]
    fn distinct_tasks_get_distinct_ids() {
        let other = thread::spawn(current_task).join().unwrap();
        assert_ne!(other, current_task());
    }
}
