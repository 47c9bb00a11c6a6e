use std::{
    env,
    error::Error,
    hint::black_box,
    sync::{ atomic::{ AtomicUsize, Ordering }, Arc },
    time::Instant,
};

use corepool::{ CoreMask, PinnedThreadPool, PinnedWorkStealingPool, ShutdownMode, StealContext };

fn fib(n: u128) -> u128 {
    (0..n).fold((0, 1), |(a, b), _| (b, a + b)).0
}

/// Splits `count` fib computations in halves until a chunk is small enough to run inline.
fn fib_batch(ctx: &StealContext, count: usize, completed: &Arc<AtomicUsize>) {
    if count <= 64 {
        for _ in 0..count {
            black_box(fib(130));
        }
        completed.fetch_add(count, Ordering::Relaxed);
        return;
    }
    let half = count / 2;
    let rest = Arc::clone(completed);
    let (_, right) = ctx.fork_join(
        |ctx| fib_batch(ctx, half, completed),
        move |ctx| fib_batch(ctx, count - half, &rest)
    );
    if let Err(err) = right {
        log::warn!("Fib batch failed: {}", err);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let mask = match args.next() {
        Some(spec) => spec.parse::<CoreMask>()?,
        None => CoreMask::EMPTY,
    };
    let tasks = match args.next() {
        Some(count) => count.parse::<usize>()?,
        None => 100_000,
    };

    let completed = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    let pool = PinnedThreadPool::for_cores(mask)?;
    for _ in 0..tasks {
        let completed = Arc::clone(&completed);
        pool.execute(move || {
            black_box(fib(130));
            completed.fetch_add(1, Ordering::Relaxed);
        })?;
    }
    pool.shutdown(ShutdownMode::Drain)?;
    println!(
        "fixed pool: {} workers ran {} tasks in {:?}",
        pool.size(),
        completed.load(Ordering::Relaxed),
        started.elapsed()
    );

    let completed = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();
    let pool = PinnedWorkStealingPool::for_cores(mask)?;
    let batch = Arc::clone(&completed);
    pool.submit(move |ctx: &StealContext| fib_batch(ctx, tasks, &batch))?.join()?;
    pool.shutdown(ShutdownMode::Drain)?;
    println!(
        "work-stealing pool: {} workers ran {} tasks in {:?}",
        pool.parallelism(),
        completed.load(Ordering::Relaxed),
        started.elapsed()
    );

    for worker in pool.workers() {
        log::debug!(
            "{} bound to {} (core {:?})",
            worker.name.as_deref().unwrap_or("<unnamed>"),
            worker.affinity.to_spec(),
            worker.core
        );
    }
    Ok(())
}
