use std::{
    collections::VecDeque,
    fmt,
    num::NonZeroUsize,
    sync::{ atomic::{ AtomicBool, Ordering }, Arc },
    thread,
    time::{ Duration, Instant },
};

use parking_lot::{ Condvar, Mutex };

use crate::{
    core_mask::CoreMask,
    error::{ PinningError, PoolStateError },
    factory::{ Assignment, PinnedThread, PinnedWorkerFactory, WorkerBody, WorkerFactory },
    task::{ job, Job, TaskHandle, TaskSignal },
};

/// How [`shutdown`](PinnedThreadPool::shutdown) treats work that is already in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Run everything already queued, wait for it and for the workers to exit.
    Drain,
    /// Cancel queued work, interrupt running work and return without waiting.
    Abort,
}

/// The threads of a pool.
pub(crate) struct WorkerSet {
    threads: Mutex<Vec<PinnedThread>>,
    assignments: Vec<Assignment>,
}

impl WorkerSet {
    /// Starts one worker per body through `factory`.
    ///
    /// If any worker fails to start, `abort` is called so the ones already running can exit,
    /// they are joined, and the error is returned.
    pub(crate) fn start(
        factory: &dyn WorkerFactory,
        bodies: Vec<WorkerBody>,
        abort: impl FnOnce()
    ) -> Result<Self, PinningError> {
        let count = bodies.len();
        let mut threads = Vec::with_capacity(count);
        for (index, body) in bodies.into_iter().enumerate() {
            match factory.new_thread(body) {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    log::warn!("Could not start worker #{} of {}: {}", index, count, err);
                    abort();
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(err);
                }
            }
        }
        let assignments = threads
            .iter()
            .map(|thread| thread.assignment().clone())
            .collect();
        Ok(Self { threads: Mutex::new(threads), assignments })
    }

    pub(crate) fn assignments(&self) -> Vec<Assignment> {
        self.assignments.clone()
    }

    /// Joins every worker except the calling thread, which cannot wait for itself.
    pub(crate) fn join_all(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        let me = thread::current().id();
        for thread in threads {
            if thread.thread().id() == me {
                continue;
            }
            if thread.join().is_err() {
                log::warn!("A worker thread panicked");
            }
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.threads
            .lock()
            .iter()
            .all(PinnedThread::is_finished)
    }

    /// Polls until every worker exits. A timeout too large for a deadline waits indefinitely.
    pub(crate) fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.is_terminated() {
                self.join_all();
                return true;
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

struct Queue {
    jobs: VecDeque<Job<()>>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    open: AtomicBool,
    /// The task each worker is running, so an abort can interrupt it.
    running: Vec<Mutex<Option<Arc<TaskSignal>>>>,
}

impl Shared {
    fn work(&self, index: usize) {
        log::trace!("Worker #{} instantiated", index);
        loop {
            let job = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        *self.running[index].lock() = Some(Arc::clone(job.signal()));
                        break job;
                    }
                    if queue.closed {
                        log::trace!("Worker #{} exiting", index);
                        return;
                    }
                    self.available.wait(&mut queue);
                }
            };

            job.run(&());
            *self.running[index].lock() = None;
        }
    }

    fn close(&self) {
        self.queue.lock().closed = true;
        self.open.store(false, Ordering::Release);
        self.available.notify_all();
    }
}

/// A pool of pinned worker threads pulling from one FIFO queue.
///
/// With one worker this is a single-thread executor: tasks run one after another in submission
/// order. With more, each task goes to the next free worker.
///
/// Dropping the pool without calling [`shutdown`](Self::shutdown) drains it.
pub struct PinnedThreadPool {
    shared: Arc<Shared>,
    workers: WorkerSet,
    factory: Arc<dyn WorkerFactory>,
    size: usize,
}

impl PinnedThreadPool {
    /// Starts a pool whose threads come from `factory`.
    ///
    /// `concurrency` defaults to the number of cores the factory covers. Asking for more workers
    /// than cores makes the factory hand out its cores again, round-robin.
    pub fn new(
        concurrency: Option<NonZeroUsize>,
        factory: Arc<dyn WorkerFactory>
    ) -> Result<Self, PinningError> {
        let size = concurrency.map_or_else(|| factory.cores().max(1), NonZeroUsize::get);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue { jobs: VecDeque::new(), closed: false }),
            available: Condvar::new(),
            open: AtomicBool::new(true),
            running: (0..size).map(|_| Mutex::new(None)).collect(),
        });

        let bodies = (0..size)
            .map(|index| {
                let shared = Arc::clone(&shared);
                Box::new(move || shared.work(index)) as WorkerBody
            })
            .collect();
        let workers = WorkerSet::start(factory.as_ref(), bodies, || shared.close())?;

        log::debug!("Pinned thread pool running with {} workers", size);
        Ok(Self { shared, workers, factory, size })
    }

    /// A pool with exactly one worker.
    pub fn single(factory: Arc<dyn WorkerFactory>) -> Result<Self, PinningError> {
        Self::new(NonZeroUsize::new(1), factory)
    }

    /// A pool with one worker pinned to each core of `mask`.
    pub fn for_cores(mask: CoreMask) -> Result<Self, PinningError> {
        Self::new(None, Arc::new(PinnedWorkerFactory::new(mask)))
    }

    /// Queues `f` and returns a handle to its result.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PoolStateError>
        where F: FnOnce() -> T + Send + 'static, T: Send + 'static
    {
        let (handle, job) = job(move |_: &()| f());
        self.enqueue(std::iter::once(job))?;
        Ok(handle)
    }

    /// Queues `f` without keeping a handle.
    pub fn execute<F>(&self, f: F) -> Result<(), PoolStateError> where F: FnOnce() + Send + 'static {
        self.submit(f).map(drop)
    }

    /// Queues every task at once; either all of them are accepted or none is.
    pub fn invoke_all<I, F, T>(&self, tasks: I) -> Result<Vec<TaskHandle<T>>, PoolStateError>
        where I: IntoIterator<Item = F>, F: FnOnce() -> T + Send + 'static, T: Send + 'static
    {
        let (handles, jobs): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .map(|f| job(move |_: &()| f()))
            .unzip();
        self.enqueue(jobs)?;
        Ok(handles)
    }

    fn enqueue(&self, jobs: impl IntoIterator<Item = Job<()>>) -> Result<(), PoolStateError> {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return Err(PoolStateError::Shutdown);
        }
        let before = queue.jobs.len();
        queue.jobs.extend(jobs);
        let added = queue.jobs.len() - before;
        drop(queue);

        if added == 1 {
            self.shared.available.notify_one();
        } else if added > 1 {
            self.shared.available.notify_all();
        }
        Ok(())
    }

    /// Stops accepting tasks and releases the workers.
    ///
    /// Returns how many queued tasks were cancelled, which is always 0 for
    /// [`ShutdownMode::Drain`]. Fails if the pool was already shut down.
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<usize, PoolStateError> {
        let cancelled = {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return Err(PoolStateError::AlreadyShutdown);
            }
            queue.closed = true;
            self.shared.open.store(false, Ordering::Release);

            match mode {
                ShutdownMode::Drain => 0,
                ShutdownMode::Abort => {
                    let cancelled = queue.jobs
                        .drain(..)
                        .map(Job::abandon)
                        .filter(|&cancelled| cancelled)
                        .count();
                    for slot in &self.shared.running {
                        if let Some(signal) = slot.lock().as_ref() {
                            signal.interrupt();
                        }
                    }
                    cancelled
                }
            }
        };
        self.shared.available.notify_all();

        if mode == ShutdownMode::Drain {
            self.workers.join_all();
        }
        log::debug!("Pinned thread pool shut down ({:?}, {} tasks cancelled)", mode, cancelled);
        Ok(cancelled)
    }

    /// Waits up to `timeout` for every worker to exit after a shutdown.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.workers.await_termination(timeout)
    }

    pub fn is_shutdown(&self) -> bool {
        !self.shared.open.load(Ordering::Acquire)
    }

    /// Shut down and every worker has exited.
    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.workers.is_terminated()
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Where each worker is pinned.
    pub fn workers(&self) -> Vec<Assignment> {
        self.workers.assignments()
    }

    pub fn factory(&self) -> &Arc<dyn WorkerFactory> {
        &self.factory
    }
}

impl fmt::Debug for PinnedThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedThreadPool")
            .field("size", &self.size)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Drop for PinnedThreadPool {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            let _ = self.shutdown(ShutdownMode::Drain);
        }
    }
}
