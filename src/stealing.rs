use std::{
    fmt,
    iter,
    num::NonZeroUsize,
    sync::{ atomic::{ AtomicBool, AtomicUsize, Ordering }, Arc },
    time::Duration,
};

use crossbeam_deque::{ Injector, Steal, Stealer, Worker };
use crossbeam_utils::Backoff;
use parking_lot::{ Condvar, Mutex };
use rand::Rng;

use crate::{
    core_mask::CoreMask,
    error::{ PinningError, PoolStateError, TaskError },
    executor::{ ShutdownMode, WorkerSet },
    factory::{ Assignment, PinnedWorkerFactory, WorkerBody, WorkerFactory },
    task::{ job, Job, TaskHandle, TaskSignal },
};

type StealJob = Job<StealContext>;

/// How long an idle worker sleeps before looking for work again without being woken.
const IDLE_TIMEOUT: Duration = Duration::from_millis(10);

struct Shared {
    /// Tasks submitted from outside the pool.
    injector: Injector<StealJob>,
    /// The other ends of every worker's local deque.
    stealers: Vec<Stealer<StealJob>>,
    open: AtomicBool,
    aborted: AtomicBool,
    /// Tasks queued or running anywhere in the pool.
    pending: AtomicUsize,
    sleepers: Mutex<usize>,
    wake: Condvar,
    /// Tasks each worker is running. Helping joins nest, hence a stack.
    running: Vec<Mutex<Vec<Arc<TaskSignal>>>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        !self.open.load(Ordering::SeqCst)
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn has_visible_work(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|stealer| !stealer.is_empty())
    }

    fn is_drained(&self) -> bool {
        self.is_closed() && (self.pending.load(Ordering::SeqCst) == 0 || self.is_aborted())
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 && self.is_closed() {
            self.wake_all();
        }
    }

    fn idle(&self) {
        let mut sleepers = self.sleepers.lock();
        if self.has_visible_work() || self.is_drained() {
            return;
        }

        *sleepers += 1;
        // We don't handle spurious wakeups here: waking too early costs one more search for
        // work, and the timeout covers work that shows up in a deque without a notification.
        self.wake.wait_for(&mut sleepers, IDLE_TIMEOUT);
        *sleepers -= 1;
    }

    fn notify_one(&self) {
        let sleepers = self.sleepers.lock();
        if *sleepers > 0 {
            self.wake.notify_one();
        }
    }

    fn wake_all(&self) {
        let _sleepers = self.sleepers.lock();
        self.wake.notify_all();
    }
}

/// What a task running on a [`PinnedWorkStealingPool`] gets to split its work.
///
/// Subtasks spawned here go to the current worker's own deque. The worker pops its newest
/// subtask first, while idle workers steal the oldest ones from the other end.
pub struct StealContext {
    index: usize,
    local: Worker<StealJob>,
    shared: Arc<Shared>,
}

impl StealContext {
    /// Index of the worker running the current task.
    pub fn worker_index(&self) -> usize {
        self.index
    }

    /// Queues a subtask on this worker's deque.
    pub fn spawn<F, T>(&self, f: F) -> TaskHandle<T>
        where F: FnOnce(&StealContext) -> T + Send + 'static, T: Send + 'static
    {
        let (handle, job) = job(f);
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.local.push(job);
        self.shared.notify_one();
        handle
    }

    /// Waits for `handle`, running other queued tasks on this worker in the meantime.
    pub fn join<T>(&self, handle: TaskHandle<T>) -> Result<T, TaskError> {
        let backoff = Backoff::new();
        while !handle.is_done() {
            if let Some(job) = self.find_work() {
                self.execute(job);
                backoff.reset();
            } else if backoff.is_completed() {
                handle.wait_timeout(IDLE_TIMEOUT);
            } else {
                backoff.snooze();
            }
        }
        handle.join()
    }

    /// Runs `left` here while `right` is offered to other workers, then returns both results.
    pub fn fork_join<A, B, RA, RB>(&self, left: A, right: B) -> (RA, Result<RB, TaskError>)
        where
            A: FnOnce(&StealContext) -> RA,
            B: FnOnce(&StealContext) -> RB + Send + 'static,
            RB: Send + 'static
    {
        let right = self.spawn(right);
        let left = left(self);
        (left, self.join(right))
    }

    fn find_work(&self) -> Option<StealJob> {
        self.local.pop().or_else(|| {
            iter::repeat_with(|| {
                self.shared.injector
                    .steal_batch_and_pop(&self.local)
                    .or_else(|| self.steal_from_peers())
            })
                .find(|steal| !steal.is_retry())
                .and_then(Steal::success)
        })
    }

    fn steal_from_peers(&self) -> Steal<StealJob> {
        let count = self.shared.stealers.len();
        if count < 2 {
            return Steal::Empty;
        }
        // Start at a random victim so thieves spread out.
        let start = rand::thread_rng().gen_range(0..count);
        (0..count)
            .map(|offset| (start + offset) % count)
            .filter(|&victim| victim != self.index)
            .map(|victim| self.shared.stealers[victim].steal())
            .collect()
    }

    fn execute(&self, job: StealJob) {
        if self.shared.is_aborted() {
            job.abandon();
        } else {
            self.shared.running[self.index].lock().push(Arc::clone(job.signal()));
            job.run(self);
            self.shared.running[self.index].lock().pop();
        }
        self.shared.finish_one();
    }

    fn run(self) {
        log::trace!("Stealing worker #{} instantiated", self.index);
        loop {
            if let Some(job) = self.find_work() {
                self.execute(job);
                continue;
            }
            if self.shared.is_drained() {
                break;
            }
            self.shared.idle();
        }
        log::trace!("Stealing worker #{} exiting", self.index);
        self.shared.wake_all();
    }
}

/// A work-stealing pool with one pinned worker per core.
///
/// Every worker is bound to its core before the pool accepts any task. Tasks receive a
/// [`StealContext`] and may split themselves into subtasks, which idle workers steal.
/// Dropping the pool without calling [`shutdown`](Self::shutdown) drains it.
pub struct PinnedWorkStealingPool {
    shared: Arc<Shared>,
    workers: WorkerSet,
    factory: Arc<dyn WorkerFactory>,
    parallelism: usize,
}

impl PinnedWorkStealingPool {
    /// Starts a pool of `parallelism` workers, by default one per core the factory covers.
    pub fn new(
        parallelism: Option<NonZeroUsize>,
        factory: Arc<dyn WorkerFactory>
    ) -> Result<Self, PinningError> {
        let parallelism = parallelism.map_or_else(|| factory.cores().max(1), NonZeroUsize::get);
        let locals: Vec<Worker<StealJob>> = (0..parallelism).map(|_| Worker::new_lifo()).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers: locals.iter().map(Worker::stealer).collect(),
            open: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            sleepers: Mutex::new(0),
            wake: Condvar::new(),
            running: (0..parallelism).map(|_| Mutex::new(Vec::new())).collect(),
        });

        let bodies = locals
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let context = StealContext { index, local, shared: Arc::clone(&shared) };
                Box::new(move || context.run()) as WorkerBody
            })
            .collect();
        let workers = WorkerSet::start(factory.as_ref(), bodies, || {
            shared.open.store(false, Ordering::SeqCst);
            shared.wake_all();
        })?;

        log::debug!("Pinned work-stealing pool running with parallelism {}", parallelism);
        Ok(Self { shared, workers, factory, parallelism })
    }

    /// A pool with one worker pinned to each core of `mask`.
    pub fn for_cores(mask: CoreMask) -> Result<Self, PinningError> {
        Self::new(None, Arc::new(PinnedWorkerFactory::new(mask)))
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Queues `f` for any worker to pick up.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PoolStateError>
        where F: FnOnce(&StealContext) -> T + Send + 'static, T: Send + 'static
    {
        // Counted before the check so a concurrent drain cannot miss this task.
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.shared.is_closed() {
            self.shared.finish_one();
            return Err(PoolStateError::Shutdown);
        }

        let (handle, job) = job(f);
        self.shared.injector.push(job);
        self.shared.notify_one();
        Ok(handle)
    }

    /// Queues `f` without keeping a handle.
    pub fn execute<F>(&self, f: F) -> Result<(), PoolStateError>
        where F: FnOnce(&StealContext) + Send + 'static
    {
        self.submit(f).map(drop)
    }

    /// Stops accepting tasks and releases the workers.
    ///
    /// [`ShutdownMode::Drain`] waits for every task, including subtasks spawned while draining.
    /// [`ShutdownMode::Abort`] cancels tasks that have not started. Returns how many tasks
    /// submitted from outside the pool were cancelled.
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<usize, PoolStateError> {
        if !self.shared.open.swap(false, Ordering::SeqCst) {
            return Err(PoolStateError::AlreadyShutdown);
        }

        let mut cancelled = 0;
        if mode == ShutdownMode::Abort {
            self.shared.aborted.store(true, Ordering::SeqCst);
            loop {
                match self.shared.injector.steal() {
                    Steal::Success(job) => {
                        if job.abandon() {
                            cancelled += 1;
                        }
                        self.shared.finish_one();
                    }
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
            for slot in &self.shared.running {
                for signal in slot.lock().iter() {
                    signal.interrupt();
                }
            }
        }
        self.shared.wake_all();

        if mode == ShutdownMode::Drain {
            self.workers.join_all();
        }
        log::debug!(
            "Pinned work-stealing pool shut down ({:?}, {} tasks cancelled)",
            mode,
            cancelled
        );
        Ok(cancelled)
    }

    /// Waits up to `timeout` for every worker to exit after a shutdown.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.workers.await_termination(timeout)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.workers.is_terminated()
    }

    /// Tasks queued or running anywhere in the pool.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> Vec<Assignment> {
        self.workers.assignments()
    }

    pub fn factory(&self) -> &Arc<dyn WorkerFactory> {
        &self.factory
    }
}

impl fmt::Debug for PinnedWorkStealingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedWorkStealingPool")
            .field("parallelism", &self.parallelism)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Drop for PinnedWorkStealingPool {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            let _ = self.shutdown(ShutdownMode::Drain);
        }
    }
}
