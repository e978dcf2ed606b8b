use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::Notify;

/// A unit of queued work. The callback owns its payload; `immediate` tasks
/// jump the backlog (live add/remove events preempt a pending enumeration).
pub struct Task {
    pub label: String,
    pub immediate: bool,
    callback: BoxFuture<'static, anyhow::Result<()>>,
}

impl Task {
    pub fn new<F>(label: impl Into<String>, immediate: bool, callback: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            immediate,
            callback: callback.boxed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Idle,
    Active,
    Cooling,
}

struct QueueState {
    tasks: VecDeque<Task>,
    phase: QueuePhase,
    closed: bool,
}

struct QueueInner {
    delay: Duration,
    state: Mutex<QueueState>,
    wake: Notify,
}

/// Serial, throttled task executor. At most one task runs at a time; after
/// each task the worker sleeps `delay` before touching the queue again,
/// which is the engine's only backpressure against bursty remote writes.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                delay,
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    phase: QueuePhase::Idle,
                    closed: false,
                }),
                wake: Notify::new(),
            }),
        }
    }

    /// Appends a task, or inserts it at the front when `task.immediate` is
    /// set. Returns false once the queue has been shut down.
    pub fn enqueue(&self, task: Task) -> bool {
        {
            let mut state = self.lock_state();
            if state.closed {
                return false;
            }
            if task.immediate {
                state.tasks.push_front(task);
            } else {
                state.tasks.push_back(task);
            }
        }
        self.inner.wake.notify_one();
        true
    }

    /// Number of tasks waiting behind the one currently running.
    pub fn size(&self) -> usize {
        self.lock_state().tasks.len()
    }

    pub fn phase(&self) -> QueuePhase {
        self.lock_state().phase
    }

    /// Stops accepting tasks and drops the backlog. An in-flight task is
    /// allowed to finish.
    pub fn shutdown(&self) {
        self.lock_state().closed = true;
        self.inner.wake.notify_one();
    }

    /// The worker loop: pop one task, run it, cool down, repeat. A failing
    /// or panicking callback is caught here and never aborts the loop.
    pub async fn run(&self) {
        loop {
            let next = {
                let mut state = self.lock_state();
                if state.closed {
                    state.tasks.clear();
                    state.phase = QueuePhase::Idle;
                    break;
                }
                let task = state.tasks.pop_front();
                if task.is_some() {
                    state.phase = QueuePhase::Active;
                }
                task
            };
            let Some(task) = next else {
                self.inner.wake.notified().await;
                continue;
            };
            let label = task.label;
            match AssertUnwindSafe(task.callback).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => eprintln!("[pimsyncd] task failed: {label}: {err:#}"),
                Err(_) => eprintln!("[pimsyncd] task panicked: {label}"),
            }
            self.set_phase(QueuePhase::Cooling);
            tokio::time::sleep(self.inner.delay).await;
            self.set_phase(QueuePhase::Idle);
        }
    }

    fn set_phase(&self, phase: QueuePhase) {
        self.lock_state().phase = phase;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
