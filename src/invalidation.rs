use crate::Tag;

/// Invalidation is a record why a computed value is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    /// Tag of the value whose invalidation started the cascade, if it was a computed value.
    pub source: Option<Tag>,
    /// Tag of the direct dependency that passed the invalidation on, if any.
    pub dependency: Option<Tag>,
    /// Reason is the reason why this value is invalidated.
    pub reason: InvalidationReason,
}

impl Invalidation {
    /// An invalidation requested by a caller after a mutation.
    pub fn manual() -> Self {
        Self::new_source(None, InvalidationReason::Manual)
    }

    /// Create a new invalidation as source.
    pub fn new_source(source: Option<Tag>, reason: InvalidationReason) -> Self {
        Self {
            source,
            dependency: source,
            reason,
        }
    }

    /// The invalidation passed to dependents of `dependency` during a cascade.
    ///
    /// The original source is preserved so every node of a cascade reports the same origin.
    pub fn propagated(&self, dependency: Tag) -> Self {
        Self {
            source: self.source.or(Some(dependency)),
            dependency: Some(dependency),
            reason: InvalidationReason::DependencyInvalidated,
        }
    }
}

impl Default for Invalidation {
    fn default() -> Self {
        Self::manual()
    }
}

/// InvalidationReason is a reason why a computed value is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    /// A caller invalidated the value explicitly.
    Manual,
    /// A value this one used was invalidated.
    DependencyInvalidated,
    /// The keep-alive period elapsed under the invalidating expiration policy.
    KeepAliveExpired,
    /// The output was released and a new value replaced it.
    OutputReleased,
    /// The computation was cancelled or failed with a system error before it completed.
    Abandoned,
}
