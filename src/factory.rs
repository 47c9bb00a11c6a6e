use std::{
    cell::RefCell,
    fmt,
    io,
    sync::{ atomic::{ AtomicU8, AtomicUsize, Ordering }, Arc },
    thread::{ self, JoinHandle, ThreadId },
};

use parking_lot::Mutex;

use crate::{ core_mask::CoreMask, error::PinningError, roster::CoreRoster, sys };

/// Binds the calling thread to a set of cores.
///
/// [`OsBinder`] is the real implementation. Other implementations let pools run on machines
/// whose core layout does not match the requested mask.
pub trait Binder: Send + Sync + 'static {
    fn bind(&self, affinity: &CoreMask) -> io::Result<()>;
}

/// Binds through the operating system's thread affinity call.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsBinder;

impl Binder for OsBinder {
    fn bind(&self, affinity: &CoreMask) -> io::Result<()> {
        sys::bind_current_thread(affinity)
    }
}

/// Lifecycle of a pinned worker thread.
///
/// `Created → Binding → Bound → Running → Terminated`, or `Binding → BindFailed` when the
/// platform rejects the affinity, in which case the worker never runs its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created,
    Binding,
    Bound,
    Running,
    BindFailed,
    Terminated,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Binding,
            2 => Self::Bound,
            3 => Self::Running,
            4 => Self::BindFailed,
            _ => Self::Terminated,
        }
    }
}

/// Where a pinned thread was bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub thread: ThreadId,
    pub name: Option<String>,
    /// Kernel thread id, on platforms that have one.
    pub native_id: Option<i32>,
    /// The cores the thread is allowed to run on.
    pub affinity: CoreMask,
    /// The single core the thread was given, when it was given exactly one.
    pub core: Option<usize>,
}

thread_local! {
    static CURRENT: RefCell<Option<Assignment>> = const { RefCell::new(None) };
}

/// The assignment of the calling thread, if it was created by a [`WorkerFactory`].
pub fn current() -> Option<Assignment> {
    CURRENT.with(|current| current.borrow().clone())
}

/// The cores the operating system currently lets the calling thread run on.
///
/// Unlike [`current`], this asks the platform, so it also works on threads this crate did not
/// create. Returns `None` where thread affinity is not supported.
pub fn os_affinity() -> Option<CoreMask> {
    sys::current_affinity()
}

/// Code a worker thread runs once it is bound.
pub type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

/// Creates worker threads that are bound to their cores before running anything else.
///
/// Every pool in this crate creates all of its threads through one of these.
pub trait WorkerFactory: Send + Sync {
    /// Spawns a thread running `body`.
    ///
    /// Returns once the new thread has bound itself. If binding fails the thread exits without
    /// calling `body` and the error is returned here.
    fn new_thread(&self, body: WorkerBody) -> Result<PinnedThread, PinningError>;

    /// How many distinct cores this factory spreads its threads over.
    fn cores(&self) -> usize;

    /// Assignments of every thread this factory created so far, in creation order.
    fn assignments(&self) -> Vec<Assignment>;
}

/// A worker thread bound to its cores.
pub struct PinnedThread {
    handle: JoinHandle<()>,
    assignment: Assignment,
    state: Arc<AtomicU8>,
}

impl PinnedThread {
    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn core(&self) -> Option<usize> {
        self.assignment.core
    }

    pub fn affinity(&self) -> CoreMask {
        self.assignment.affinity
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn thread(&self) -> &thread::Thread {
        self.handle.thread()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

impl fmt::Debug for PinnedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedThread")
            .field("assignment", &self.assignment)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks the worker terminated even when its body unwinds.
struct TerminateOnExit(Arc<AtomicU8>);

impl Drop for TerminateOnExit {
    fn drop(&mut self) {
        self.0.store(WorkerState::Terminated as u8, Ordering::Release);
    }
}

/// Thread creation shared by both factory flavours.
struct Spawner {
    name_prefix: String,
    stack_size: Option<usize>,
    binder: Arc<dyn Binder>,
    sequence: AtomicUsize,
    assignments: Mutex<Vec<Assignment>>,
}

impl Spawner {
    fn spawn(
        &self,
        affinity: CoreMask,
        core: Option<usize>,
        body: WorkerBody
    ) -> Result<PinnedThread, PinningError> {
        let id = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut builder = thread::Builder::new().name(format!("{}-{}", self.name_prefix, id));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        let binder = Arc::clone(&self.binder);
        let state = Arc::new(AtomicU8::new(WorkerState::Created as u8));
        let thread_state = Arc::clone(&state);

        let handle = builder
            .spawn(move || {
                thread_state.store(WorkerState::Binding as u8, Ordering::Release);
                // An unrestricted mask asks for no pinning at all.
                if !affinity.is_unrestricted() {
                    if let Err(err) = binder.bind(&affinity) {
                        thread_state.store(WorkerState::BindFailed as u8, Ordering::Release);
                        let _ = tx.send(Err(err));
                        return;
                    }
                }

                let current = thread::current();
                let assignment = Assignment {
                    thread: current.id(),
                    name: current.name().map(str::to_owned),
                    native_id: sys::current_native_id(),
                    affinity,
                    core,
                };
                CURRENT.with(|slot| {
                    *slot.borrow_mut() = Some(assignment.clone());
                });
                thread_state.store(WorkerState::Bound as u8, Ordering::Release);

                let _terminated = TerminateOnExit(Arc::clone(&thread_state));
                if tx.send(Ok(assignment)).is_err() {
                    return;
                }
                thread_state.store(WorkerState::Running as u8, Ordering::Release);
                body();
            })
            .map_err(PinningError::Spawn)?;

        match rx.recv() {
            Ok(Ok(assignment)) => {
                log::trace!(
                    "Worker {:?} bound to {:?}",
                    assignment.name.as_deref().unwrap_or("<unnamed>"),
                    affinity
                );
                self.assignments.lock().push(assignment.clone());
                Ok(PinnedThread { handle, assignment, state })
            }
            Ok(Err(source)) => {
                log::warn!("Worker #{} failed to bind to {:?}: {}", id, affinity, source);
                let _ = handle.join();
                Err(PinningError::BindFailed { affinity, source })
            }
            Err(_) => {
                let _ = handle.join();
                Err(PinningError::WorkerLost)
            }
        }
    }

    fn assignments(&self) -> Vec<Assignment> {
        self.assignments.lock().clone()
    }
}

/// Configures a [`PinnedWorkerFactory`] or a [`FixedAffinityFactory`].
pub struct FactoryBuilder {
    mask: CoreMask,
    name_prefix: String,
    stack_size: Option<usize>,
    binder: Arc<dyn Binder>,
}

impl FactoryBuilder {
    /// Prefix for worker thread names; workers are called `<prefix>-<n>`.
    pub fn name_prefix<T: Into<String>>(mut self, prefix: T) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Stack size, in bytes, of every worker thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn binder<B: Binder>(mut self, binder: B) -> Self {
        self.binder = Arc::new(binder);
        self
    }

    fn spawner(self) -> (CoreMask, Spawner) {
        let spawner = Spawner {
            name_prefix: self.name_prefix,
            stack_size: self.stack_size,
            binder: self.binder,
            sequence: AtomicUsize::new(0),
            assignments: Mutex::new(Vec::new()),
        };
        (self.mask, spawner)
    }

    /// A factory giving each thread its own core.
    pub fn build(self) -> PinnedWorkerFactory {
        let (mask, spawner) = self.spawner();
        PinnedWorkerFactory {
            roster: CoreRoster::new(mask),
            spawner,
        }
    }

    /// A factory binding every thread to the whole mask.
    pub fn build_fixed(self) -> FixedAffinityFactory {
        let (mask, spawner) = self.spawner();
        FixedAffinityFactory { mask, spawner }
    }
}

/// Pins each new thread to the next core of its [`CoreRoster`].
pub struct PinnedWorkerFactory {
    roster: CoreRoster,
    spawner: Spawner,
}

impl PinnedWorkerFactory {
    pub fn new(mask: CoreMask) -> Self {
        Self::builder(mask).build()
    }

    pub fn builder(mask: CoreMask) -> FactoryBuilder {
        FactoryBuilder {
            mask,
            name_prefix: String::from("pinned-worker"),
            stack_size: None,
            binder: Arc::new(OsBinder),
        }
    }

    pub fn roster(&self) -> &CoreRoster {
        &self.roster
    }
}

impl WorkerFactory for PinnedWorkerFactory {
    /// Takes the next roster core before spawning. A thread that fails to bind still used up
    /// its core, so threads created afterwards continue from the following one. Build a new
    /// factory after a [`PinningError::BindFailed`] to start over from the first core.
    fn new_thread(&self, body: WorkerBody) -> Result<PinnedThread, PinningError> {
        let core = self.roster.next();
        let affinity = CoreMask::single(core).map_err(|err| PinningError::BindFailed {
            affinity: CoreMask::EMPTY,
            source: io::Error::new(io::ErrorKind::InvalidInput, err),
        })?;
        self.spawner.spawn(affinity, Some(core), body)
    }

    fn cores(&self) -> usize {
        self.roster.len()
    }

    fn assignments(&self) -> Vec<Assignment> {
        self.spawner.assignments()
    }
}

/// Binds every new thread to the same mask, leaving core choice within it to the scheduler.
pub struct FixedAffinityFactory {
    mask: CoreMask,
    spawner: Spawner,
}

impl FixedAffinityFactory {
    pub fn new(mask: CoreMask) -> Self {
        PinnedWorkerFactory::builder(mask).build_fixed()
    }

    pub fn mask(&self) -> CoreMask {
        self.mask
    }
}

impl WorkerFactory for FixedAffinityFactory {
    fn new_thread(&self, body: WorkerBody) -> Result<PinnedThread, PinningError> {
        let core = if self.mask.len() == 1 { self.mask.cores().next() } else { None };
        self.spawner.spawn(self.mask, core, body)
    }

    fn cores(&self) -> usize {
        if self.mask.is_unrestricted() {
            sys::available_cores()
        } else {
            self.mask.len()
        }
    }

    fn assignments(&self) -> Vec<Assignment> {
        self.spawner.assignments()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records requested masks instead of binding, so tests do not depend on the host's cores.
    #[derive(Clone, Default)]
    pub struct RecordingBinder {
        pub bound: Arc<Mutex<Vec<CoreMask>>>,
    }

    impl Binder for RecordingBinder {
        fn bind(&self, affinity: &CoreMask) -> io::Result<()> {
            self.bound.lock().push(*affinity);
            Ok(())
        }
    }

    /// Refuses to bind one particular core.
    pub struct RejectCore(pub usize);

    impl Binder for RejectCore {
        fn bind(&self, affinity: &CoreMask) -> io::Result<()> {
            if affinity.contains(self.0) {
                Err(io::Error::from_raw_os_error(22))
            } else {
                Ok(())
            }
        }
    }

    pub fn recording_factory(cores: usize) -> Arc<PinnedWorkerFactory> {
        Arc::new(
            PinnedWorkerFactory::builder(CoreMask::with_count(cores as i64).unwrap())
                .binder(RecordingBinder::default())
                .build()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{ testing::*, * };

    #[test]
    fn threads_get_consecutive_cores() {
        let binder = RecordingBinder::default();
        let factory = PinnedWorkerFactory::builder(CoreMask::parse("1,4-5").unwrap())
            .binder(binder.clone())
            .build();

        let threads: Vec<_> = (0..4)
            .map(|_| factory.new_thread(Box::new(|| {})).unwrap())
            .collect();
        let cores: Vec<_> = threads
            .iter()
            .map(|t| t.core().unwrap())
            .collect();
        assert_eq!(cores, vec![1, 4, 5, 1]);

        for thread in threads {
            thread.join().unwrap();
        }
        let bound: Vec<_> = binder.bound
            .lock()
            .iter()
            .map(|m| m.cores().collect::<Vec<_>>())
            .collect();
        assert_eq!(bound.len(), 4);
        assert!(bound.iter().all(|cores| cores.len() == 1));
        assert_eq!(factory.assignments().len(), 4);
    }

    #[test]
    fn body_sees_its_own_assignment() {
        let factory = recording_factory(2);
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut threads = Vec::new();
        for _ in 0..2 {
            let tx = tx.clone();
            threads.push(
                factory
                    .new_thread(
                        Box::new(move || {
                            tx.send(current()).unwrap();
                        })
                    )
                    .unwrap()
            );
        }
        drop(tx);

        let seen: BTreeSet<_> = rx
            .iter()
            .map(|a| a.unwrap().core.unwrap())
            .collect();
        assert_eq!(seen, [0, 1].into_iter().collect());
        for thread in threads {
            assert_eq!(thread.assignment().thread, thread.thread().id());
            thread.join().unwrap();
        }
        assert!(current().is_none());
    }

    #[test]
    fn bind_failure_never_runs_the_body() {
        let factory = PinnedWorkerFactory::builder(CoreMask::with_count(2).unwrap())
            .binder(RejectCore(1))
            .build();
        let ran = Arc::new(AtomicUsize::new(0));

        let first = {
            let ran = Arc::clone(&ran);
            factory.new_thread(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let second = {
            let ran = Arc::clone(&ran);
            factory.new_thread(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
        };

        first.unwrap().join().unwrap();
        match second {
            Err(PinningError::BindFailed { affinity, .. }) => {
                assert_eq!(affinity, CoreMask::single(1).unwrap());
            }
            other => panic!("expected a bind failure, got {:?}", other),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(factory.assignments().len(), 1);
    }

    #[test]
    fn state_reaches_terminated() {
        let factory = recording_factory(1);
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let thread = factory
            .new_thread(
                Box::new(move || {
                    let _ = rx.recv();
                })
            )
            .unwrap();

        assert!(matches!(thread.state(), WorkerState::Bound | WorkerState::Running));
        drop(tx);
        while !thread.is_finished() {
            thread::yield_now();
        }
        assert_eq!(thread.state(), WorkerState::Terminated);
        thread.join().unwrap();
    }

    #[test]
    fn fixed_affinity_binds_whole_mask() {
        let binder = RecordingBinder::default();
        let mask = CoreMask::parse("2-3").unwrap();
        let factory = PinnedWorkerFactory::builder(mask)
            .name_prefix("fixed")
            .binder(binder.clone())
            .build_fixed();

        let thread = factory.new_thread(Box::new(|| {})).unwrap();
        assert_eq!(thread.affinity(), mask);
        assert_eq!(thread.core(), None);
        assert_eq!(thread.thread().name(), Some("fixed-0"));
        thread.join().unwrap();
        assert_eq!(*binder.bound.lock(), vec![mask]);
        assert_eq!(factory.cores(), 2);
    }

    #[test]
    fn os_binder_pins_to_an_allowed_core() {
        let Some(allowed) = os_affinity() else {
            return;
        };
        // Only a core the process may already use is safe to bind to in any environment.
        let core = allowed.cores().next().unwrap();
        let factory = PinnedWorkerFactory::new(CoreMask::single(core).unwrap());
        let (tx, rx) = crossbeam_channel::bounded(1);

        let thread = factory
            .new_thread(
                Box::new(move || {
                    tx.send(os_affinity()).unwrap();
                })
            )
            .unwrap();

        assert_eq!(rx.recv().unwrap(), Some(CoreMask::single(core).unwrap()));
        assert_eq!(thread.core(), Some(core));
        thread.join().unwrap();
    }

    #[test]
    fn unrestricted_factory_binds_every_allowed_core() {
        let Some(allowed) = os_affinity() else {
            return;
        };
        let factory = PinnedWorkerFactory::new(CoreMask::EMPTY);
        assert_eq!(factory.roster().cores(), allowed.cores().collect::<Vec<_>>().as_slice());

        let threads: Vec<_> = (0..factory.cores())
            .map(|_| factory.new_thread(Box::new(|| {})).unwrap())
            .collect();
        for thread in threads {
            assert!(allowed.contains(thread.core().unwrap()));
            thread.join().unwrap();
        }
    }

    #[test]
    fn concurrent_thread_creation_assigns_each_core_once() {
        const N: usize = 8;
        let factory = recording_factory(N);
        let barrier = Arc::new(std::sync::Barrier::new(N));

        let creators: Vec<_> = (0..N)
            .map(|_| {
                let factory = Arc::clone(&factory);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    factory.new_thread(Box::new(|| {})).unwrap()
                })
            })
            .collect();
        let workers: Vec<_> = creators
            .into_iter()
            .map(|creator| creator.join().unwrap())
            .collect();

        let mut cores: Vec<_> = factory
            .assignments()
            .iter()
            .map(|a| a.core.unwrap())
            .collect();
        cores.sort_unstable();
        assert_eq!(cores, (0..N).collect::<Vec<_>>());

        let threads: std::collections::HashSet<_> = workers
            .iter()
            .map(|w| w.thread().id())
            .collect();
        assert_eq!(threads.len(), N);
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
