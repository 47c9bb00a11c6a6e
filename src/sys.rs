use std::io;

use crate::core_mask::CoreMask;

/// Restricts the calling thread to the cores selected by `mask`.
#[cfg(target_os = "linux")]
pub fn bind_current_thread(mask: &CoreMask) -> io::Result<()> {
    use rustix::process::{ sched_setaffinity, CpuSet, Pid };

    let mut set = CpuSet::new();
    for core in mask.cores() {
        set.set(core);
    }
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|errno|
        io::Error::from_raw_os_error(errno.raw_os_error())
    )
}

#[cfg(not(target_os = "linux"))]
pub fn bind_current_thread(mask: &CoreMask) -> io::Result<()> {
    log::trace!("Thread affinity is not supported here, ignoring mask {}", mask);
    Ok(())
}

/// The cores the calling thread may currently run on, limited to those a [`CoreMask`] can hold.
#[cfg(target_os = "linux")]
pub fn current_affinity() -> Option<CoreMask> {
    use rustix::process::{ sched_getaffinity, Pid };

    use crate::core_mask::MAX_CORES;

    let set = sched_getaffinity(Pid::from_raw(0)).ok()?;
    let bits = (0..MAX_CORES)
        .filter(|&core| set.is_set(core))
        .fold(0u64, |bits, core| bits | (1u64 << core));
    CoreMask::from_bits(bits).ok()
}

#[cfg(not(target_os = "linux"))]
pub fn current_affinity() -> Option<CoreMask> {
    None
}

/// Number of cores the calling thread is allowed to run on.
pub fn available_cores() -> usize {
    #[cfg(target_os = "linux")]
    {
        use rustix::process::{ sched_getaffinity, Pid };

        if let Ok(set) = sched_getaffinity(Pid::from_raw(0)) {
            let count = set.count() as usize;
            if count > 0 {
                return count;
            }
        }
    }

    std::thread::available_parallelism()
        .map(|x| x.get())
        .unwrap_or(1)
}

/// Kernel-level id of the calling thread, where the platform has one.
pub fn current_native_id() -> Option<i32> {
    #[cfg(target_os = "linux")]
    {
        Some(rustix::thread::gettid().as_raw_nonzero().get())
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
