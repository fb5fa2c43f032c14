#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod computed;
mod context;
pub mod dependency;
mod error;
mod function;
mod invalidation;
mod lock;
mod pruner;
mod registry;
mod runtime;
mod tag;
mod timer;
pub mod tracer;

pub use computed::{AnyComputed, Computed, ConsistencyState, Output};
pub use context::{CallOptions, Captured, ComputeContext};
pub use error::{ComputeError, StateError};
pub use function::{ComputedRef, FunctionId, FunctionOptions, Input, MemoFunction, Producer};
pub use invalidation::{Invalidation, InvalidationReason};
pub use pruner::{PruneConfig, PruneStats};
pub use runtime::{MemoRuntime, MemoRuntimeBuilder};
pub use tag::{Tag, TagClock};
pub use timer::{ExpirationPolicy, TimerKind, TimerWheel};
pub use tracer::{ComputeOutcome, LogTracer, NoopTracer, Tracer, TracerKey};

pub use tokio_util::sync::CancellationToken;
