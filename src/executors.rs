//! Shorthands that build a pinned pool straight from a [`CoreMask`].
//!
//! Every function here creates a fresh [`PinnedWorkerFactory`], so pools never share a roster.
//! Use the pool constructors directly to pass a custom factory.

use std::{ num::NonZeroUsize, sync::Arc };

use crate::{
    core_mask::CoreMask,
    error::PinningError,
    executor::PinnedThreadPool,
    factory::PinnedWorkerFactory,
    scheduled::ScheduledPinnedPool,
    stealing::PinnedWorkStealingPool,
};

fn factory(mask: CoreMask) -> Arc<PinnedWorkerFactory> {
    Arc::new(PinnedWorkerFactory::new(mask))
}

/// One worker pinned to the first core of `mask`.
pub fn new_single_pinned_executor(mask: CoreMask) -> Result<PinnedThreadPool, PinningError> {
    PinnedThreadPool::single(factory(mask))
}

/// `concurrency` workers, by default one per core of `mask`.
pub fn new_fixed_pinned_pool(
    mask: CoreMask,
    concurrency: Option<NonZeroUsize>
) -> Result<PinnedThreadPool, PinningError> {
    PinnedThreadPool::new(concurrency, factory(mask))
}

/// One scheduling worker pinned to the first core of `mask`.
pub fn new_single_pinned_scheduled_executor(
    mask: CoreMask
) -> Result<ScheduledPinnedPool, PinningError> {
    ScheduledPinnedPool::single(factory(mask))
}

pub fn new_scheduled_pinned_pool(
    mask: CoreMask,
    concurrency: Option<NonZeroUsize>
) -> Result<ScheduledPinnedPool, PinningError> {
    ScheduledPinnedPool::new(concurrency, factory(mask))
}

/// A work-stealing pool with one worker per core of `mask`.
pub fn new_pinned_work_stealing_pool(
    mask: CoreMask
) -> Result<PinnedWorkStealingPool, PinningError> {
    PinnedWorkStealingPool::for_cores(mask)
}
