use std::{
    any::Any,
    cell::RefCell,
    fmt,
    panic::{ self, AssertUnwindSafe },
    sync::{ atomic::{ AtomicBool, AtomicU8, Ordering }, Arc },
    time::{ Duration, Instant },
};

use parking_lot::{ Condvar, Mutex };

use crate::error::TaskError;

/// Where a submitted task is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Completed, cancelled or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// What [`TaskHandle::cancel`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task had not started and never will.
    Cancelled,
    /// The task is running; it was asked to stop and may observe that through
    /// [`interrupted`](crate::interrupted).
    InterruptRequested,
    /// The task had already finished.
    AlreadyFinished,
}

/// State shared between a task, its handle and the pool running it.
pub(crate) struct TaskSignal {
    state: AtomicU8,
    interrupted: AtomicBool,
    lock: Mutex<()>,
    done: Condvar,
}

impl TaskSignal {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(TaskStatus::Pending as u8),
            interrupted: AtomicBool::new(false),
            lock: Mutex::new(()),
            done: Condvar::new(),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskStatus> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskStatus::from_u8)
    }

    fn try_start(&self) -> bool {
        self.transition(TaskStatus::Pending, TaskStatus::Running).is_ok()
    }

    pub(crate) fn cancel(&self) -> CancelOutcome {
        match self.transition(TaskStatus::Pending, TaskStatus::Cancelled) {
            Ok(()) => {
                self.wake_waiters();
                CancelOutcome::Cancelled
            }
            Err(TaskStatus::Running) => {
                self.interrupt();
                CancelOutcome::InterruptRequested
            }
            Err(_) => CancelOutcome::AlreadyFinished,
        }
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn settle(&self, status: TaskStatus) {
        let _guard = self.lock.lock();
        self.state.store(status as u8, Ordering::Release);
        self.done.notify_all();
    }

    fn wake_waiters(&self) {
        let _guard = self.lock.lock();
        self.done.notify_all();
    }

    /// Puts a periodic task back to pending after a run. Returns whether it should run again.
    fn rearm(&self) -> bool {
        if self.is_interrupted() {
            self.settle(TaskStatus::Cancelled);
            return false;
        }
        if self.transition(TaskStatus::Running, TaskStatus::Pending).is_err() {
            return false;
        }
        // A cancel that raced with the transition above only left the interrupt flag behind.
        if self.is_interrupted() {
            return self.cancel() != CancelOutcome::Cancelled;
        }
        true
    }

    fn wait(&self) {
        let mut guard = self.lock.lock();
        while !self.status().is_terminal() {
            self.done.wait(&mut guard);
        }
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.lock.lock();
        while !self.status().is_terminal() {
            if self.done.wait_until(&mut guard, deadline).timed_out() {
                return self.status().is_terminal();
            }
        }
        true
    }
}

/// Stands in for a delay whose deadline does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(u32::MAX as u64);

/// `from + delay`, clamped to a far-future deadline when the sum overflows.
pub(crate) fn deadline(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

thread_local! {
    static RUNNING: RefCell<Option<Arc<TaskSignal>>> = const { RefCell::new(None) };
}

/// Whether the task running on the calling thread has been asked to stop.
///
/// Running tasks are never stopped forcibly: cancelling one, or aborting its pool, only raises
/// this flag. Long-running tasks should check it and return early.
pub fn interrupted() -> bool {
    RUNNING.with(|running| {
        running
            .borrow()
            .as_ref()
            .map_or(false, |signal| signal.is_interrupted())
    })
}

/// Makes a signal the current one for [`interrupted`], restoring the previous one on drop.
struct RunningGuard(Option<Arc<TaskSignal>>);

impl RunningGuard {
    fn enter(signal: &Arc<TaskSignal>) -> Self {
        let previous = RUNNING.with(|running| running.borrow_mut().replace(Arc::clone(signal)));
        Self(previous)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let previous = self.0.take();
        RUNNING.with(|running| {
            *running.borrow_mut() = previous;
        });
    }
}

struct TaskCell<T> {
    signal: Arc<TaskSignal>,
    result: Mutex<Option<Result<T, TaskError>>>,
}

impl<T> TaskCell<T> {
    fn new() -> Self {
        Self {
            signal: Arc::new(TaskSignal::new()),
            result: Mutex::new(None),
        }
    }

    fn complete(&self, outcome: std::thread::Result<T>) {
        let status = match outcome {
            Ok(value) => {
                *self.result.lock() = Some(Ok(value));
                TaskStatus::Completed
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::warn!("Task panicked: {}", message);
                *self.result.lock() = Some(Err(TaskError::Panicked(message)));
                TaskStatus::Failed
            }
        };
        self.signal.settle(status);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// A handle to a submitted task.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> TaskHandle<T> {
    pub fn status(&self) -> TaskStatus {
        self.cell.signal.status()
    }

    /// Whether the task reached a terminal state: completed, cancelled or failed.
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    /// Cancels the task if it has not started yet, otherwise asks it to stop.
    pub fn cancel(&self) -> CancelOutcome {
        self.cell.signal.cancel()
    }

    /// Blocks until the task is done.
    pub fn wait(&self) {
        self.cell.signal.wait();
    }

    /// Blocks until the task is done or `timeout` passes. Returns whether the task is done.
    ///
    /// A timeout too large to express as a deadline waits without one.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.cell.signal.wait_until(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    /// Blocks until the task is done and returns its value.
    pub fn join(self) -> Result<T, TaskError> {
        self.wait();
        let result = self.cell.result.lock().take();
        result.unwrap_or(Err(TaskError::Cancelled))
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("status", &self.status()).finish()
    }
}

/// A queued one-shot task, run with a context of type `C` provided by the pool.
pub(crate) struct Job<C: ?Sized + 'static> {
    signal: Arc<TaskSignal>,
    body: Box<dyn FnOnce(&C) + Send>,
}

pub(crate) fn job<C, F, T>(f: F) -> (TaskHandle<T>, Job<C>)
    where C: ?Sized + 'static, F: FnOnce(&C) -> T + Send + 'static, T: Send + 'static
{
    let cell = Arc::new(TaskCell::new());
    let signal = Arc::clone(&cell.signal);
    let runner = Arc::clone(&cell);
    let body = Box::new(move |ctx: &C| {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)));
        runner.complete(outcome);
    });
    (TaskHandle { cell }, Job { signal, body })
}

impl<C: ?Sized + 'static> Job<C> {
    /// Runs the task unless it was cancelled while queued.
    pub(crate) fn run(self, ctx: &C) {
        if !self.signal.try_start() {
            return;
        }
        let _running = RunningGuard::enter(&self.signal);
        (self.body)(ctx);
    }

    /// Cancels the task without running it.
    pub(crate) fn abandon(self) -> bool {
        self.signal.cancel() == CancelOutcome::Cancelled
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.signal.status() == TaskStatus::Cancelled
    }

    pub(crate) fn signal(&self) -> &Arc<TaskSignal> {
        &self.signal
    }
}

/// A task that runs repeatedly until cancelled, fails, or its pool stops.
pub(crate) struct Periodic {
    cell: Arc<TaskCell<()>>,
    body: Box<dyn FnMut() + Send>,
}

pub(crate) fn periodic<F>(f: F) -> (TaskHandle<()>, Periodic) where F: FnMut() + Send + 'static {
    let cell = Arc::new(TaskCell::new());
    let handle = TaskHandle { cell: Arc::clone(&cell) };
    (handle, Periodic { cell, body: Box::new(f) })
}

impl Periodic {
    /// Runs one occurrence. Returns whether the task should be scheduled again.
    pub(crate) fn run(&mut self) -> bool {
        let signal = Arc::clone(&self.cell.signal);
        if !signal.try_start() {
            return false;
        }
        let _running = RunningGuard::enter(&signal);
        let body = &mut self.body;
        match panic::catch_unwind(AssertUnwindSafe(|| body())) {
            Ok(()) => signal.rearm(),
            Err(payload) => {
                self.cell.complete(Err(payload));
                false
            }
        }
    }

    pub(crate) fn abandon(&self) -> bool {
        self.cell.signal.cancel() == CancelOutcome::Cancelled
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cell.signal.status() == TaskStatus::Cancelled
    }

    pub(crate) fn signal(&self) -> &Arc<TaskSignal> {
        &self.cell.signal
    }
}
