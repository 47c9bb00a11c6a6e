use std::sync::atomic::{ AtomicUsize, Ordering };

use crossbeam_utils::CachePadded;

use crate::{ core_mask::{ CoreMask, MAX_CORES }, sys };

/// Hands out the cores of a [`CoreMask`] to newly created workers, round-robin.
///
/// The k-th call to [`CoreRoster::next`] returns `cores[k % len]`. Each pool owns its own roster,
/// so cursors never interfere across pools.
#[derive(Debug)]
pub struct CoreRoster {
    cores: Vec<usize>,
    cursor: CachePadded<AtomicUsize>,
}

impl CoreRoster {
    /// Builds a roster over the cores of `mask`.
    ///
    /// [`CoreMask::EMPTY`] expands to the cores the calling thread may run on. Where the platform
    /// cannot report them it falls back to cores `0..available_cores()`, capped at [`MAX_CORES`].
    pub fn new(mask: CoreMask) -> Self {
        let cores = if mask.is_unrestricted() {
            unrestricted_cores()
        } else {
            mask.cores().collect()
        };
        Self::from_cores(cores)
    }

    pub(crate) fn from_cores(cores: Vec<usize>) -> Self {
        assert!(!cores.is_empty(), "a core roster needs at least one core");
        Self {
            cores,
            cursor: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// The core for the next worker.
    pub fn next(&self) -> usize {
        let ticket = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.cores[ticket % self.cores.len()]
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    /// Cores in allocation order.
    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    /// Number of cores handed out so far.
    pub fn allocated(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

fn unrestricted_cores() -> Vec<usize> {
    match sys::current_affinity() {
        Some(allowed) => allowed.cores().collect(),
        None => (0..sys::available_cores().min(MAX_CORES)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::{ collections::BTreeSet, sync::{ Arc, Barrier } };

    use super::*;

    #[test]
    fn allocation_cycles_in_ascending_order() {
        let roster = CoreRoster::new(CoreMask::parse("7,2-3").unwrap());
        let picked: Vec<_> = (0..7).map(|_| roster.next()).collect();
        assert_eq!(picked, vec![2, 3, 7, 2, 3, 7, 2]);
        assert_eq!(roster.allocated(), 7);
    }

    #[test]
    fn empty_mask_expands_to_allowed_cores() {
        let roster = CoreRoster::new(CoreMask::EMPTY);
        let expected: Vec<_> = match sys::current_affinity() {
            Some(allowed) => allowed.cores().collect(),
            None => (0..sys::available_cores().min(MAX_CORES)).collect(),
        };
        assert_eq!(roster.cores(), expected.as_slice());
        assert!(!roster.cores().is_empty());
    }


    #[test]
    fn concurrent_allocation_is_a_permutation() {
        const N: usize = 16;
        let roster = Arc::new(CoreRoster::new(CoreMask::with_count(N as i64).unwrap()));
        let barrier = Arc::new(Barrier::new(N));

        let threads: Vec<_> = (0..N)
            .map(|_| {
                let roster = Arc::clone(&roster);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    roster.next()
                })
            })
            .collect();

        let picked: Vec<_> = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();
        let distinct: BTreeSet<_> = picked.iter().copied().collect();
        assert_eq!(picked.len(), N);
        assert_eq!(distinct, (0..N).collect());
    }
}
