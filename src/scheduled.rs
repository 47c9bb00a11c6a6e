use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    fmt,
    num::NonZeroUsize,
    sync::{ atomic::{ AtomicBool, Ordering }, Arc },
    time::{ Duration, Instant },
};

use parking_lot::{ Condvar, Mutex };

use crate::{
    core_mask::CoreMask,
    error::{ PinningError, PoolStateError },
    executor::{ ShutdownMode, WorkerSet },
    factory::{ Assignment, PinnedWorkerFactory, WorkerBody, WorkerFactory },
    task::{ deadline, job, periodic, Job, Periodic, TaskHandle, TaskSignal },
};

#[derive(Debug, Clone, Copy)]
enum Repeat {
    /// Next run is due one period after the previous one was due.
    FixedRate(Duration),
    /// Next run is due this long after the previous one finished.
    FixedDelay(Duration),
}

enum Payload {
    Once(Job<()>),
    Periodic(Periodic, Repeat),
}

/// A task waiting in the delay queue.
struct Entry {
    at: Instant,
    seq: u64,
    payload: Payload,
}

impl Entry {
    fn is_cancelled(&self) -> bool {
        match &self.payload {
            Payload::Once(job) => job.is_cancelled(),
            Payload::Periodic(task, _) => task.is_cancelled(),
        }
    }

    fn signal(&self) -> &Arc<TaskSignal> {
        match &self.payload {
            Payload::Once(job) => job.signal(),
            Payload::Periodic(task, _) => task.signal(),
        }
    }

    fn abandon(self) -> bool {
        match self.payload {
            Payload::Once(job) => job.abandon(),
            Payload::Periodic(task, _) => task.abandon(),
        }
    }
}

// Reversed so that `BinaryHeap` pops the earliest entry; ties go to the earlier submission.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

struct Queue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

impl Queue {
    fn push(&mut self, at: Instant, payload: Payload) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { at, seq, payload });
    }
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    open: AtomicBool,
    running: Vec<Mutex<Option<Arc<TaskSignal>>>>,
}

impl Shared {
    fn work(&self, index: usize) {
        log::trace!("Scheduled worker #{} instantiated", index);
        while let Some(entry) = self.take(index) {
            let at = entry.at;
            match entry.payload {
                Payload::Once(job) => job.run(&()),
                Payload::Periodic(mut task, repeat) => {
                    if task.run() {
                        let next = match repeat {
                            Repeat::FixedRate(period) => deadline(at, period),
                            Repeat::FixedDelay(delay) => deadline(Instant::now(), delay),
                        };
                        self.requeue(next, Payload::Periodic(task, repeat));
                    }
                }
            }
            *self.running[index].lock() = None;
        }
        log::trace!("Scheduled worker #{} exiting", index);
    }

    /// Waits for the earliest entry to become due. Returns `None` once the pool is closed and
    /// nothing is left to run.
    fn take(&self, index: usize) -> Option<Entry> {
        let mut queue = self.queue.lock();
        loop {
            while queue.heap.peek().map_or(false, Entry::is_cancelled) {
                queue.heap.pop();
            }

            match queue.heap.peek().map(|entry| entry.at) {
                Some(at) if at <= Instant::now() => {
                    let entry = queue.heap.pop()?;
                    *self.running[index].lock() = Some(Arc::clone(entry.signal()));
                    if !queue.heap.is_empty() {
                        // Someone else has to watch the new head.
                        self.available.notify_one();
                    }
                    return Some(entry);
                }
                Some(at) => {
                    self.available.wait_until(&mut queue, at);
                }
                None if queue.closed => {
                    return None;
                }
                None => {
                    self.available.wait(&mut queue);
                }
            }
        }
    }

    fn requeue(&self, at: Instant, payload: Payload) {
        let mut queue = self.queue.lock();
        if queue.closed {
            drop(queue);
            if let Payload::Periodic(task, _) = payload {
                task.abandon();
            }
            return;
        }
        queue.push(at, payload);
        drop(queue);
        self.available.notify_one();
    }

    fn close(&self) {
        self.queue.lock().closed = true;
        self.open.store(false, Ordering::Release);
        self.available.notify_all();
    }
}

/// A pool of pinned workers running tasks after a delay or periodically.
///
/// Due tasks run earliest-due first; tasks due at the same instant run in submission order.
/// Dropping the pool without calling [`shutdown`](Self::shutdown) drains it.
pub struct ScheduledPinnedPool {
    shared: Arc<Shared>,
    workers: WorkerSet,
    factory: Arc<dyn WorkerFactory>,
    size: usize,
}

impl ScheduledPinnedPool {
    /// Starts a scheduled pool whose threads come from `factory`.
    ///
    /// `concurrency` defaults to the number of cores the factory covers.
    pub fn new(
        concurrency: Option<NonZeroUsize>,
        factory: Arc<dyn WorkerFactory>
    ) -> Result<Self, PinningError> {
        let size = concurrency.map_or_else(|| factory.cores().max(1), NonZeroUsize::get);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
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

        log::debug!("Scheduled pinned pool running with {} workers", size);
        Ok(Self { shared, workers, factory, size })
    }

    /// A scheduled pool with exactly one worker.
    pub fn single(factory: Arc<dyn WorkerFactory>) -> Result<Self, PinningError> {
        Self::new(NonZeroUsize::new(1), factory)
    }

    /// A scheduled pool with one worker pinned to each core of `mask`.
    pub fn for_cores(mask: CoreMask) -> Result<Self, PinningError> {
        Self::new(None, Arc::new(PinnedWorkerFactory::new(mask)))
    }

    fn enqueue(&self, at: Instant, payload: Payload) -> Result<(), PoolStateError> {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return Err(PoolStateError::Shutdown);
        }
        queue.push(at, payload);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Runs `f` once, no earlier than `delay` from now.
    pub fn schedule<F, T>(&self, delay: Duration, f: F) -> Result<TaskHandle<T>, PoolStateError>
        where F: FnOnce() -> T + Send + 'static, T: Send + 'static
    {
        let at = deadline(Instant::now(), delay);
        let (handle, job) = job(move |_: &()| f());
        self.enqueue(at, Payload::Once(job))?;
        Ok(handle)
    }

    /// Runs `f` as soon as a worker is free.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PoolStateError>
        where F: FnOnce() -> T + Send + 'static, T: Send + 'static
    {
        self.schedule(Duration::ZERO, f)
    }

    /// Runs `f` after `initial_delay` and then every `period`, measured between due times.
    ///
    /// The task stops recurring when cancelled, when it panics, or when the pool shuts down.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: F
    ) -> Result<TaskHandle<()>, PoolStateError>
        where F: FnMut() + Send + 'static
    {
        assert!(!period.is_zero(), "period must be positive");
        self.schedule_repeating(initial_delay, Repeat::FixedRate(period), f)
    }

    /// Runs `f` after `initial_delay` and then again `delay` after each run finishes.
    ///
    /// # Panics
    ///
    /// Panics if `delay` is zero.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: F
    ) -> Result<TaskHandle<()>, PoolStateError>
        where F: FnMut() + Send + 'static
    {
        assert!(!delay.is_zero(), "delay must be positive");
        self.schedule_repeating(initial_delay, Repeat::FixedDelay(delay), f)
    }

    fn schedule_repeating<F>(
        &self,
        initial_delay: Duration,
        repeat: Repeat,
        f: F
    ) -> Result<TaskHandle<()>, PoolStateError>
        where F: FnMut() + Send + 'static
    {
        let at = deadline(Instant::now(), initial_delay);
        let (handle, task) = periodic(f);
        self.enqueue(at, Payload::Periodic(task, repeat))?;
        Ok(handle)
    }

    /// Stops accepting tasks and releases the workers.
    ///
    /// [`ShutdownMode::Drain`] still runs every delayed one-shot task when it becomes due, but
    /// cancels periodic tasks. [`ShutdownMode::Abort`] cancels everything queued. Returns how
    /// many queued tasks were cancelled.
    pub fn shutdown(&self, mode: ShutdownMode) -> Result<usize, PoolStateError> {
        let cancelled = {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return Err(PoolStateError::AlreadyShutdown);
            }
            queue.closed = true;
            self.shared.open.store(false, Ordering::Release);

            match mode {
                ShutdownMode::Drain => {
                    let mut cancelled = 0;
                    queue.heap.retain(|entry| match &entry.payload {
                        Payload::Periodic(task, _) => {
                            if task.abandon() {
                                cancelled += 1;
                            }
                            false
                        }
                        Payload::Once(_) => true,
                    });
                    cancelled
                }
                ShutdownMode::Abort => {
                    let cancelled = std::mem::take(&mut queue.heap)
                        .into_iter()
                        .map(Entry::abandon)
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
        log::debug!("Scheduled pinned pool shut down ({:?}, {} tasks cancelled)", mode, cancelled);
        Ok(cancelled)
    }

    /// Waits up to `timeout` for every worker to exit after a shutdown.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.workers.await_termination(timeout)
    }

    pub fn is_shutdown(&self) -> bool {
        !self.shared.open.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.workers.is_terminated()
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tasks waiting in the delay queue, including ones not yet due.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    pub fn workers(&self) -> Vec<Assignment> {
        self.workers.assignments()
    }

    pub fn factory(&self) -> &Arc<dyn WorkerFactory> {
        &self.factory
    }
}

impl fmt::Debug for ScheduledPinnedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledPinnedPool")
            .field("size", &self.size)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Drop for ScheduledPinnedPool {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            let _ = self.shutdown(ShutdownMode::Drain);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{ atomic::AtomicUsize, Barrier },
        thread,
    };

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::{ error::TaskError, factory::testing::*, task::{ CancelOutcome, TaskStatus } };

    const SCHEDULING_DELAY: Duration = Duration::from_millis(20);

    fn visit_all(pool: &ScheduledPinnedPool, concurrency: usize) {
        let barrier = Arc::new(Barrier::new(concurrency));
        let visited = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..concurrency)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let visited = Arc::clone(&visited);
                pool.schedule(SCHEDULING_DELAY, move || {
                    visited.lock().insert(thread::current().id());
                    barrier.wait();
                }).unwrap()
            })
            .collect();

        for handle in &handles {
            handle.wait();
        }
        assert!(handles.iter().all(TaskHandle::is_done));
        assert_eq!(visited.lock().len(), concurrency);
    }

    #[test]
    fn single_pinned_thread_scheduled_executor() {
        let pool = ScheduledPinnedPool::single(recording_factory(2)).unwrap();
        assert_eq!(pool.size(), 1);
        visit_all(&pool, 1);
    }

    #[test]
    fn pooled_pinned_thread_scheduled_executor() {
        let pool = ScheduledPinnedPool::new(None, recording_factory(4)).unwrap();
        assert_eq!(pool.size(), 4);
        visit_all(&pool, 4);
    }

    #[test]
    fn delay_is_honored() {
        let pool = ScheduledPinnedPool::new(None, recording_factory(2)).unwrap();
        let scheduled = Instant::now();
        let handle = pool.schedule(Duration::from_millis(30), move || scheduled.elapsed()).unwrap();
        assert!(handle.join().unwrap() >= Duration::from_millis(30));
    }

    #[test]
    fn due_tasks_run_in_due_order() {
        let pool = ScheduledPinnedPool::single(recording_factory(1)).unwrap();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (tx, rx) = unbounded();

        pool.submit(move || {
            let _ = release_rx.recv();
        }).unwrap();
        for (name, delay) in [("late", 40), ("first", 0), ("second", 0), ("middle", 10)] {
            let tx = tx.clone();
            pool.schedule(Duration::from_millis(delay), move || tx.send(name).unwrap()).unwrap();
        }

        thread::sleep(Duration::from_millis(60));
        release_tx.send(()).unwrap();
        pool.shutdown(ShutdownMode::Drain).unwrap();
        drop(tx);
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec!["first", "second", "middle", "late"]);
    }

    #[test]
    fn cancelled_delayed_task_never_runs() {
        let pool = ScheduledPinnedPool::single(recording_factory(1)).unwrap();
        let handle = pool.schedule(Duration::from_secs(60), || panic!("ran")).unwrap();
        assert_eq!(handle.cancel(), CancelOutcome::Cancelled);

        let started = Instant::now();
        pool.shutdown(ShutdownMode::Drain).unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(handle.join(), Err(TaskError::Cancelled));
    }

    #[test]
    fn fixed_rate_task_repeats_until_cancelled() {
        let pool = ScheduledPinnedPool::single(recording_factory(1)).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = pool
            .schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        while runs.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();
        handle.wait();
        assert!(handle.is_cancelled());

        let settled = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert!(runs.load(Ordering::SeqCst) <= settled + 1);
    }

    #[test]
    fn fixed_delay_task_spaces_runs() {
        let pool = ScheduledPinnedPool::single(recording_factory(1)).unwrap();
        let (tx, rx) = unbounded();
        let handle = pool
            .schedule_with_fixed_delay(Duration::ZERO, Duration::from_millis(10), move || {
                let _ = tx.send(Instant::now());
            })
            .unwrap();

        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        assert!(second.duration_since(first) >= Duration::from_millis(10));
        handle.cancel();
    }

    #[test]
    fn drain_runs_delayed_and_cancels_periodic() {
        let pool = ScheduledPinnedPool::new(None, recording_factory(2)).unwrap();
        let delayed = pool.schedule(SCHEDULING_DELAY, || "ran").unwrap();
        let periodic = pool
            .schedule_at_fixed_rate(Duration::from_secs(60), Duration::from_secs(60), || ())
            .unwrap();

        assert_eq!(pool.shutdown(ShutdownMode::Drain), Ok(1));
        assert_eq!(delayed.join(), Ok("ran"));
        assert!(periodic.is_cancelled());
        assert!(pool.is_terminated());
    }

    #[test]
    fn abort_cancels_delayed_tasks() {
        let pool = ScheduledPinnedPool::new(None, recording_factory(2)).unwrap();
        let handles: Vec<_> = (0..3)
            .map(|_| pool.schedule(Duration::from_secs(60), || ()).unwrap())
            .collect();

        assert_eq!(pool.shutdown(ShutdownMode::Abort), Ok(3));
        assert!(handles.iter().all(TaskHandle::is_cancelled));
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(
            pool.schedule(Duration::ZERO, || ()).err(),
            Some(PoolStateError::Shutdown)
        );
        assert_eq!(pool.shutdown(ShutdownMode::Abort), Err(PoolStateError::AlreadyShutdown));
    }

    #[test]
    fn unbounded_periods_keep_the_worker_alive() {
        let pool = ScheduledPinnedPool::single(recording_factory(1)).unwrap();
        let (tx, rx) = unbounded();
        let rate_tx = tx.clone();
        let by_rate = pool
            .schedule_at_fixed_rate(Duration::ZERO, Duration::MAX, move || rate_tx.send(()).unwrap())
            .unwrap();
        let by_delay = pool
            .schedule_with_fixed_delay(Duration::ZERO, Duration::MAX, move || tx.send(()).unwrap())
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Both runs have been rearmed by the time the single worker gets to this one.
        assert_eq!(pool.submit(|| 42).unwrap().join(), Ok(42));
        assert_eq!(by_rate.status(), TaskStatus::Pending);
        assert_eq!(by_delay.status(), TaskStatus::Pending);
        assert!(!pool.is_shutdown());

        assert_eq!(pool.shutdown(ShutdownMode::Drain), Ok(2));
        assert!(by_rate.is_cancelled());
        assert!(by_delay.is_cancelled());
    }

    #[test]
    fn unbounded_delay_is_accepted() {
        let pool = ScheduledPinnedPool::single(recording_factory(1)).unwrap();
        let never = pool.schedule(Duration::MAX, || ()).unwrap();
        assert_eq!(pool.queued(), 1);
        assert_eq!(pool.submit(|| 1).unwrap().join(), Ok(1));
        assert!(!never.wait_timeout(Duration::from_millis(10)));

        assert_eq!(pool.shutdown(ShutdownMode::Abort), Ok(1));
        assert!(never.is_cancelled());
        assert!(pool.await_termination(Duration::MAX));
    }
}
