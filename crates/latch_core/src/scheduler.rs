//! Cooperative repeating-task scheduler
//!
//! Tasks are plain callbacks registered with an interval. Nothing runs on its
//! own: the frame loop calls [`FrameScheduler::update`] and every task whose
//! deadline has passed runs once, on the calling thread.

use crate::time::Clock;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Handle returned by [`Scheduler::repeat`], used to cancel the task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// Return the raw id backing this handle.
    #[inline]
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Register-with-interval / cancel-by-handle timer primitive.
pub trait Scheduler {
    /// Run `task` roughly every `interval_ms` until cancelled.
    fn repeat(&self, interval_ms: u64, task: Box<dyn FnMut()>) -> TaskHandle;

    /// Stop a task. Unknown or already cancelled handles are ignored.
    fn cancel(&self, handle: TaskHandle);
}

struct ScheduledTask {
    handle: TaskHandle,
    interval_ms: u64,
    next_due_ms: u64,
    // `None` while the callback is executing.
    callback: Option<Box<dyn FnMut()>>,
}

/// Timer list polled once per frame.
///
/// Callbacks may register or cancel tasks (including themselves) while they
/// run; no internal borrow is held across a callback.
pub struct FrameScheduler {
    clock: Rc<dyn Clock>,
    tasks: RefCell<Vec<ScheduledTask>>,
    next_id: Cell<u64>,
}

impl FrameScheduler {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.tasks.borrow().iter().any(|task| task.handle == handle)
    }

    /// Run every task whose deadline has passed. Returns how many ran.
    pub fn update(&self) -> usize {
        let now = self.clock.now_ms();
        let due: Vec<TaskHandle> = self
            .tasks
            .borrow()
            .iter()
            .filter(|task| task.next_due_ms <= now)
            .map(|task| task.handle)
            .collect();

        let mut ran = 0;
        for handle in due {
            let callback = {
                let mut tasks = self.tasks.borrow_mut();
                match tasks.iter_mut().find(|task| task.handle == handle) {
                    Some(task) => {
                        task.next_due_ms = now.saturating_add(task.interval_ms);
                        task.callback.take()
                    }
                    None => None,
                }
            };

            // Cancelled by an earlier callback this update, or re-entered.
            let Some(mut callback) = callback else {
                continue;
            };

            tracing::trace!(%handle, now, "running scheduled task");
            callback();
            ran += 1;

            if let Some(task) = self
                .tasks
                .borrow_mut()
                .iter_mut()
                .find(|task| task.handle == handle)
            {
                task.callback = Some(callback);
            }
        }
        ran
    }
}

impl Scheduler for FrameScheduler {
    fn repeat(&self, interval_ms: u64, task: Box<dyn FnMut()>) -> TaskHandle {
        let handle = TaskHandle(self.next_id.get());
        self.next_id.set(handle.0 + 1);

        let now = self.clock.now_ms();
        self.tasks.borrow_mut().push(ScheduledTask {
            handle,
            interval_ms,
            next_due_ms: now.saturating_add(interval_ms),
            callback: Some(task),
        });
        tracing::debug!(%handle, interval_ms, "scheduled repeating task");
        handle
    }

    fn cancel(&self, handle: TaskHandle) {
        let mut tasks = self.tasks.borrow_mut();
        let before = tasks.len();
        tasks.retain(|task| task.handle != handle);
        if tasks.len() != before {
            tracing::debug!(%handle, "cancelled repeating task");
        }
    }
}
