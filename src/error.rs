//! Error types for memoized computation.

use std::fmt;
use std::sync::Arc;

use crate::ConsistencyState;

/// A state-machine contract violation on a computed value.
///
/// These indicate misuse of the API and are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// A transition was requested from a state that does not allow it.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// The state the value was in.
        from: ConsistencyState,
        /// The state the caller tried to reach.
        to: ConsistencyState,
    },

    /// Dependencies can only be recorded while a value is computing.
    #[error("dependencies can only be recorded while computing (state: {state:?})")]
    NotComputing {
        /// The state the value was in.
        state: ConsistencyState,
    },
}

/// Errors returned by memoized function calls.
///
/// Producer errors can be propagated using the `?` operator, which automatically
/// converts any `Into<anyhow::Error>` type into `ComputeError::Producer`.
#[derive(Debug, Clone)]
pub enum ComputeError {
    /// The producer failed.
    ///
    /// This is the only variant that is cached: the failed output is stored in the
    /// computed value and replayed to every reader until the value is invalidated.
    Producer(Arc<anyhow::Error>),

    /// The call was cancelled. Never cached.
    Cancelled,

    /// The same logical call chain requested a key it is already computing.
    Reentrant {
        /// Name of the memoized function.
        function: &'static str,
        /// Debug representation of the input.
        input: String,
    },

    /// The call ran under a try-get-existing or invalidating context and produced no value.
    NotComputed,

    /// A computed value was driven through an illegal transition.
    InvalidState(StateError),
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Producer(e) => write!(f, "producer error: {}", e),
            ComputeError::Cancelled => write!(f, "computation cancelled"),
            ComputeError::Reentrant { function, input } => {
                write!(f, "reentrant call to {}({}) within its own computation", function, input)
            }
            ComputeError::NotComputed => write!(f, "no cached value and computation not allowed"),
            ComputeError::InvalidState(e) => write!(f, "{}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for ComputeError {
    fn from(err: T) -> Self {
        ComputeError::Producer(Arc::new(err.into()))
    }
}

impl ComputeError {
    /// Returns true if this error may be stored as a computed value's output.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, ComputeError::Producer(_))
    }

    /// Returns true if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ComputeError::Cancelled)
    }

    /// Returns a reference to the inner producer error if this is a `Producer` variant.
    pub fn producer_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            ComputeError::Producer(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the producer error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.producer_error().and_then(|e| e.downcast_ref::<E>())
    }
}
