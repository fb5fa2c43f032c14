use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tag is the generation id of a computed value.
///
/// Tags are drawn from a runtime-wide [`TagClock`], so they are unique across all
/// functions and strictly increasing for successive computations of the same input.
///
/// # Examples
///
/// ```
/// # use memo_flow::{Tag, TagClock};
/// let clock = TagClock::new();
/// let first = clock.next();
/// let second = clock.next();
/// assert!(first.is_older_than(second));
/// assert!(!second.is_older_than(first));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

impl Tag {
    /// Returns true if this tag was issued before `other`.
    pub fn is_older_than(&self, other: Tag) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic source of [`Tag`]s. The first issued tag is `Tag(1)`.
#[derive(Debug, Default)]
pub struct TagClock {
    last: AtomicU64,
}

impl TagClock {
    /// Create a new clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next tag.
    pub fn next(&self) -> Tag {
        Tag(self.last.fetch_add(1, Ordering::AcqRel).wrapping_add(1))
    }

    /// The most recently issued tag, if any.
    pub fn last(&self) -> Option<Tag> {
        match self.last.load(Ordering::Acquire) {
            0 => None,
            n => Some(Tag(n)),
        }
    }
}
