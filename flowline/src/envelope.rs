//! Channel message types: the stop marker and sequence tagging.

use serde::{Deserialize, Serialize};

/// A message flowing through a stage channel.
///
/// Every channel in the engine carries `Envelope`s rather than bare tasks so
/// that the end-of-input marker is part of the element type and dispatch on
/// it is exhaustive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope<T> {
    /// A task to be processed.
    Task(T),
    /// No more tasks will arrive.
    Stop,
}

impl<T> Envelope<T> {
    /// Returns true if this is the stop marker.
    #[must_use]
    pub const fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }

    /// Returns the task payload, if any.
    pub fn into_task(self) -> Option<T> {
        match self {
            Self::Task(task) => Some(task),
            Self::Stop => None,
        }
    }
}

/// A task tagged with its admission sequence number.
///
/// Ordered stages assign sequence numbers at admission time, starting at 0
/// and incrementing without gaps, so completions can be re-sequenced into
/// arrival order no matter which worker finishes first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequenced<T> {
    /// Position of this task in the stage's admission order.
    pub seq: u64,
    /// The task itself.
    pub payload: T,
}

impl<T> Sequenced<T> {
    /// Tags a payload with a sequence number.
    #[must_use]
    pub const fn new(seq: u64, payload: T) -> Self {
        Self { seq, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_is_stop() {
        assert!(Envelope::<u32>::Stop.is_stop());
        assert!(!Envelope::Task(1).is_stop());
    }

    #[test]
    fn test_envelope_into_task() {
        assert_eq!(Envelope::Task(7).into_task(), Some(7));
        assert_eq!(Envelope::<u32>::Stop.into_task(), None);
    }

    #[test]
    fn test_sequenced_carries_payload() {
        let s = Sequenced::new(3, "task");
        assert_eq!(s.seq, 3);
        assert_eq!(s.payload, "task");
    }
}
