//! Ambient dependency tracking.
//!
//! The computation currently being produced travels with the logical async call chain
//! in a task-local frame. A memoized call made inside a producer finds its consumer
//! there and records the edge. Tasks spawned from a producer start with an empty frame,
//! so work detached from the call chain is never attributed to it.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::context::{CallOptions, ComputeContext};
use crate::error::ComputeError;
use crate::tracer::{Tracer, TracerKey};
use crate::{AnyComputed, Computed, FunctionId};

tokio::task_local! {
    static FRAME: Frame;
}

/// A computing value and the computation that was current when it started.
struct Link {
    computed: Arc<dyn AnyComputed>,
    parent: Option<Arc<Link>>,
}

#[derive(Clone, Default)]
pub(crate) struct Frame {
    chain: Option<Arc<Link>>,
    pub context: ComputeContext,
    pub cancel: Option<CancellationToken>,
}

impl Frame {
    /// The ambient frame, or an empty one outside any scope.
    pub fn current() -> Frame {
        FRAME.try_with(Frame::clone).unwrap_or_default()
    }

    /// The computation being produced, if any.
    pub fn computing(&self) -> Option<&Arc<dyn AnyComputed>> {
        self.chain.as_ref().map(|link| &link.computed)
    }

    /// Frame for running the producer of `computed`.
    ///
    /// Producers always start with the default context.
    pub fn for_producer(&self, computed: Arc<dyn AnyComputed>, cancel: CancellationToken) -> Frame {
        Frame {
            chain: Some(Arc::new(Link {
                computed,
                parent: self.chain.clone(),
            })),
            context: ComputeContext::default(),
            cancel: Some(cancel),
        }
    }

    /// Frame identical to this one but with `context` installed.
    pub fn with_context(&self, context: ComputeContext) -> Frame {
        Frame {
            chain: self.chain.clone(),
            context,
            cancel: self.cancel.clone(),
        }
    }

    /// Returns true if `function(input)` is being computed somewhere up this call chain.
    pub fn is_computing<I, O>(&self, function: FunctionId, input: &I) -> bool
    where
        I: Debug + PartialEq + Send + Sync + 'static,
        O: Send + Sync + 'static,
    {
        let mut link = self.chain.as_deref();
        while let Some(current) = link {
            if current.computed.function() == function
                && current
                    .computed
                    .as_any()
                    .downcast_ref::<Computed<I, O>>()
                    .is_some_and(|c| c.input() == input)
            {
                return true;
            }
            link = current.parent.as_deref();
        }
        false
    }

    /// Run `fut` with this frame installed.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        FRAME.scope(self, fut).await
    }

    /// Record `dependency` as used by the current computation.
    ///
    /// Invalidating calls never record edges.
    pub fn record(
        &self,
        dependency: &Arc<dyn AnyComputed>,
        tracer: &dyn Tracer,
    ) -> Result<(), ComputeError> {
        if self.context.options().contains(CallOptions::INVALIDATE) {
            return Ok(());
        }
        let Some(consumer) = self.computing() else {
            return Ok(());
        };
        consumer
            .add_used(dependency.clone())
            .map_err(ComputeError::InvalidState)?;
        tracer.on_dependency_recorded(
            TracerKey::new(consumer.function(), consumer.input_debug(), Some(consumer.tag())),
            TracerKey::new(
                dependency.function(),
                dependency.input_debug(),
                Some(dependency.tag()),
            ),
        );
        Ok(())
    }
}

/// The computation currently being produced on this call chain, if any.
pub fn current() -> Option<Arc<dyn AnyComputed>> {
    FRAME
        .try_with(|frame| frame.computing().cloned())
        .ok()
        .flatten()
}

/// Returns true if the caller runs inside a producer.
pub fn is_computing() -> bool {
    FRAME
        .try_with(|frame| frame.chain.is_some())
        .unwrap_or(false)
}

/// The cancellation token of the producer running on this call chain, if any.
pub fn cancellation() -> Option<CancellationToken> {
    FRAME.try_with(|frame| frame.cancel.clone()).ok().flatten()
}
