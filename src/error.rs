use std::io;

use thiserror::Error;

use crate::core_mask::CoreMask;

/// Errors produced while turning a core specification into a [`CoreMask`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreSetError {
    /// The specification is malformed: empty, non-numeric, negative or an inverted range.
    #[error("invalid core specification '{spec}': {problem}")]
    InvalidSpecification {
        /// The offending token, or the whole specification when no single token is to blame.
        spec: String,
        problem: &'static str,
    },

    /// A well-formed core index that does not fit in the mask.
    #[error("core index {index} is out of range, the mask holds at most {limit} cores")]
    OutOfRange { index: u64, limit: usize },
}

impl CoreSetError {
    pub(crate) fn invalid(spec: impl Into<String>, problem: &'static str) -> Self {
        Self::InvalidSpecification { spec: spec.into(), problem }
    }
}

/// Errors produced while creating a pinned worker thread.
#[derive(Debug, Error)]
pub enum PinningError {
    /// The platform refused to bind the new worker to its cores. The worker never ran a task.
    #[error("failed to bind worker thread to cores {affinity}")]
    BindFailed {
        affinity: CoreMask,
        #[source]
        source: io::Error,
    },

    /// The operating system could not create the thread at all.
    #[error("failed to spawn worker thread")]
    Spawn(#[source] io::Error),

    /// The worker died before reporting the outcome of its binding.
    #[error("worker thread exited before reporting its binding")]
    WorkerLost,
}

/// Errors caused by using a pool in the wrong lifecycle state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolStateError {
    /// The pool no longer accepts tasks.
    #[error("pool is shut down")]
    Shutdown,

    /// `shutdown` was already called on this pool.
    #[error("pool was already shut down")]
    AlreadyShutdown,
}

/// Why a task handle did not yield a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(CoreSetError: Send, Sync, Debug);
    assert_impl_all!(PinningError: Send, Sync, Debug);
    assert_impl_all!(PoolStateError: Send, Sync, Debug);
    assert_impl_all!(TaskError: Send, Sync, Debug);

    #[test]
    fn invalid_specification_names_the_token() {
        let error = CoreSetError::invalid("10-2", "range start exceeds range end");
        assert_eq!(
            error.to_string(),
            "invalid core specification '10-2': range start exceeds range end"
        );
    }

    #[test]
    fn bind_failure_keeps_os_error_as_source() {
        use std::error::Error as _;

        let error = PinningError::BindFailed {
            affinity: CoreMask::single(3).unwrap(),
            source: io::Error::from_raw_os_error(22),
        };
        assert!(error.to_string().contains("8"));
        assert!(error.source().is_some());
    }
}
