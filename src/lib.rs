//! Thread pools whose workers are each bound to a CPU core for their whole lifetime.
//!
//! A [`CoreMask`] names the eligible cores. A [`PinnedWorkerFactory`] hands those cores out
//! round-robin to the threads it creates, and every thread binds itself to its core before it
//! runs anything else. The pools ([`PinnedThreadPool`], [`ScheduledPinnedPool`] and
//! [`PinnedWorkStealingPool`]) create all of their workers through such a factory.
//!
//! ```no_run
//! use corepool::{ PinnedThreadPool, ShutdownMode };
//!
//! let pool = PinnedThreadPool::for_cores("0-3".parse()?)?;
//! let answer = pool.submit(|| 6 * 7)?;
//! assert_eq!(answer.join(), Ok(42));
//! pool.shutdown(ShutdownMode::Drain)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod core_mask;
pub mod error;
pub mod executor;
pub mod executors;
pub mod factory;
pub mod roster;
pub mod scheduled;
pub mod stealing;
pub mod task;

mod sys;

pub use core_mask::{ CoreMask, MAX_CORES };
pub use error::{ CoreSetError, PinningError, PoolStateError, TaskError };
pub use executor::{ PinnedThreadPool, ShutdownMode };
pub use factory::{
    current,
    os_affinity,
    Assignment,
    Binder,
    FactoryBuilder,
    FixedAffinityFactory,
    OsBinder,
    PinnedThread,
    PinnedWorkerFactory,
    WorkerBody,
    WorkerFactory,
    WorkerState,
};
pub use roster::CoreRoster;
pub use scheduled::ScheduledPinnedPool;
pub use stealing::{ PinnedWorkStealingPool, StealContext };
pub use task::{ interrupted, CancelOutcome, TaskHandle, TaskStatus };

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(CoreMask: Send, Sync, Copy);
    assert_impl_all!(CoreRoster: Send, Sync);
    assert_impl_all!(PinnedWorkerFactory: Send, Sync);
    assert_impl_all!(FixedAffinityFactory: Send, Sync);
    assert_impl_all!(PinnedThreadPool: Send, Sync);
    assert_impl_all!(ScheduledPinnedPool: Send, Sync);
    assert_impl_all!(PinnedWorkStealingPool: Send, Sync);
    assert_impl_all!(TaskHandle<u32>: Send, Sync);
}
