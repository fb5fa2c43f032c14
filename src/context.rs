//! Per-call intent: how memoized calls behave inside a scope.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use memo_flow::{ComputeContext, ComputeError, MemoRuntime};
//!
//! let runtime = MemoRuntime::new();
//! let square = runtime.function("square", |x: u64, _cancel| async move {
//!     Ok::<_, ComputeError>(x * x)
//! });
//!
//! // Nothing cached yet, and this scope is not allowed to compute.
//! let miss = ComputeContext::try_get_existing(square.invoke(4)).await;
//! assert!(matches!(miss, Err(ComputeError::NotComputed)));
//!
//! assert_eq!(*square.invoke(4).await.unwrap(), 16);
//!
//! // Drop the cached value through the same call path that reads it.
//! let _ = ComputeContext::invalidating(square.invoke(4)).await;
//! assert!(square.get_existing(&4).is_none());
//! # }
//! ```

use std::future::Future;
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

use crate::dependency::Frame;
use crate::{AnyComputed, Computed, Invalidation};

bitflags! {
    /// Flags that change what a memoized call does.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallOptions: u8 {
        /// Serve only cached values; a miss fails with `ComputeError::NotComputed`.
        const TRY_GET_EXISTING = 0b0001;
        /// Invalidate the cached value instead of returning it. Implies `TRY_GET_EXISTING`.
        const INVALIDATE = 0b0011;
        /// Record the computed value that served the first call in scope.
        const CAPTURE = 0b0100;
    }
}

/// The computed value that served a captured call.
#[derive(Debug, Clone)]
pub struct Captured(Arc<dyn AnyComputed>);

impl Captured {
    /// The captured value, type-erased.
    pub fn computed(&self) -> &Arc<dyn AnyComputed> {
        &self.0
    }

    /// The captured value as a typed `Computed`, if the types match.
    pub fn downcast<I, O>(&self) -> Option<Arc<Computed<I, O>>>
    where
        I: Send + Sync + 'static,
        O: Send + Sync + 'static,
    {
        self.0.clone().into_any().downcast::<Computed<I, O>>().ok()
    }
}

struct ContextData {
    options: CallOptions,
    invalidation: Option<Invalidation>,
    captured: OnceLock<Captured>,
}

impl ContextData {
    const fn flags(options: CallOptions) -> Self {
        Self {
            options,
            invalidation: None,
            captured: OnceLock::new(),
        }
    }
}

static DEFAULT: ContextData = ContextData::flags(CallOptions::empty());
static TRY_GET_EXISTING: ContextData = ContextData::flags(CallOptions::TRY_GET_EXISTING);
static INVALIDATE: ContextData = ContextData::flags(CallOptions::INVALIDATE);

#[derive(Clone)]
enum Repr {
    Shared(&'static ContextData),
    Owned(Arc<ContextData>),
}

/// Call options plus, for capturing scopes, the slot that receives the served value.
///
/// Contexts without a capture slot or custom invalidation are shared statics; cloning
/// and installing them allocates nothing.
#[derive(Clone)]
pub struct ComputeContext(Repr);

impl Default for ComputeContext {
    fn default() -> Self {
        ComputeContext(Repr::Shared(&DEFAULT))
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("options", &self.options())
            .field("invalidation", &self.data().invalidation)
            .finish()
    }
}

impl ComputeContext {
    /// Context with `options`.
    pub fn new(options: CallOptions) -> Self {
        if options.contains(CallOptions::CAPTURE) {
            return Self::owned(options, None);
        }
        if options.contains(CallOptions::INVALIDATE) {
            ComputeContext(Repr::Shared(&INVALIDATE))
        } else if options.contains(CallOptions::TRY_GET_EXISTING) {
            ComputeContext(Repr::Shared(&TRY_GET_EXISTING))
        } else {
            ComputeContext::default()
        }
    }

    fn owned(options: CallOptions, invalidation: Option<Invalidation>) -> Self {
        ComputeContext(Repr::Owned(Arc::new(ContextData {
            options,
            invalidation,
            captured: OnceLock::new(),
        })))
    }

    fn data(&self) -> &ContextData {
        match &self.0 {
            Repr::Shared(data) => data,
            Repr::Owned(data) => data,
        }
    }

    /// The ambient context of the caller.
    pub fn current() -> Self {
        Frame::current().context
    }

    /// The options of this context.
    pub fn options(&self) -> CallOptions {
        self.data().options
    }

    /// The invalidation applied by invalidating calls in this context.
    pub fn invalidation(&self) -> Invalidation {
        self.data().invalidation.unwrap_or_default()
    }

    /// The value captured in this context so far.
    pub fn captured(&self) -> Option<Captured> {
        self.data().captured.get().cloned()
    }

    pub(crate) fn try_capture(&self, computed: &Arc<dyn AnyComputed>) {
        if self.options().contains(CallOptions::CAPTURE) {
            let _ = self.data().captured.set(Captured(computed.clone()));
        }
    }

    /// Run `fut` with this context installed. The previous context is restored when
    /// `fut` completes or is dropped.
    pub async fn enter<F: Future>(self, fut: F) -> F::Output {
        Frame::current().with_context(self).scope(fut).await
    }

    /// Run `fut` with a context built from `options`.
    pub async fn scope<F: Future>(options: CallOptions, fut: F) -> F::Output {
        ComputeContext::new(options).enter(fut).await
    }

    /// Run `fut` so that memoized calls only return cached values.
    pub async fn try_get_existing<F: Future>(fut: F) -> F::Output {
        ComputeContext::scope(CallOptions::TRY_GET_EXISTING, fut).await
    }

    /// Run `fut` so that memoized calls invalidate their cached value.
    pub async fn invalidating<F: Future>(fut: F) -> F::Output {
        ComputeContext::scope(CallOptions::INVALIDATE, fut).await
    }

    /// Like [`invalidating`](Self::invalidating), recording `invalidation` as the reason.
    pub async fn invalidating_with<F: Future>(invalidation: Invalidation, fut: F) -> F::Output {
        ComputeContext::owned(CallOptions::INVALIDATE, Some(invalidation))
            .enter(fut)
            .await
    }

    /// Run `fut` and capture the computed value that served its first memoized call.
    ///
    /// The caller's other options stay in effect.
    pub async fn capture<F: Future>(fut: F) -> (F::Output, Option<Captured>) {
        let outer = ComputeContext::current();
        let context = ComputeContext::owned(
            outer.options() | CallOptions::CAPTURE,
            outer.data().invalidation,
        );
        let output = context.clone().enter(fut).await;
        (output, context.captured())
    }
}
