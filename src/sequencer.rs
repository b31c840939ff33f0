//! Frame sequencing: which indices of a run still need delivering.
//!
//! One [`SequencingState`] exists per active run and is owned exclusively by
//! that run's delivery driver; it is discarded when the run closes. The
//! state is deliberately independent of any transport so that a notification
//! channel can reconnect without re-delivering frames.
//!
//! Invariants:
//! - every delivered index is `< last_known_length`;
//! - the delivered set only grows for the lifetime of a run;
//! - [`SequencingState::pending`] is a pure function of the state and the
//!   currently available length — calling it twice without an intervening
//!   [`SequencingState::mark_delivered`] returns the same sequence.

use std::collections::BTreeSet;

use tracing::warn;

/// Delivery bookkeeping for one run.
#[derive(Debug, Default, Clone)]
pub struct SequencingState {
    delivered: BTreeSet<u64>,
    last_known_length: u64,
}

impl SequencingState {
    /// Fresh state with nothing delivered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The ordered indices to deliver next, given that the catalog currently
    /// exposes `available_length` frames.
    ///
    /// With nothing delivered yet this is the full backfill `[0,
    /// available_length)`: a run discovered mid-acquisition gets its
    /// historical frames, not just new ones. Otherwise it is the gaps
    /// between the lowest and highest delivered index (out-of-order catalog
    /// writes, transient fetch failures) followed by everything above the
    /// highest delivered index. Indices are ascending and always within
    /// `[0, available_length)`.
    pub fn pending(&self, available_length: u64) -> Vec<u64> {
        if available_length < self.last_known_length {
            // Catalog data disappearing is not a supported transition.
            warn!(
                available_length,
                last_known_length = self.last_known_length,
                "catalog array shrank; continuing with the shorter length"
            );
        }
        let (min, max) = match (self.delivered.first(), self.delivered.last()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => return (0..available_length).collect(),
        };
        let mut out: Vec<u64> = (min..max)
            .filter(|i| !self.delivered.contains(i))
            .filter(|&i| i < available_length)
            .collect();
        out.extend(max + 1..available_length);
        out
    }

    /// Credit one successfully emitted frame.
    ///
    /// Must be called exactly once per frame, immediately after the
    /// downstream send succeeds; a failed send is not credited so the index
    /// is retried on the next cycle.
    pub fn mark_delivered(&mut self, index: u64) {
        self.delivered.insert(index);
        self.last_known_length = self.last_known_length.max(index + 1);
    }

    /// Whether `index` has already been delivered.
    pub fn is_delivered(&self, index: u64) -> bool {
        self.delivered.contains(&index)
    }

    /// Number of frames delivered so far.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.len() as u64
    }

    /// Highest frame count this state has been confronted with.
    pub fn last_known_length(&self) -> u64 {
        self.last_known_length
    }

    /// True when nothing remains to deliver at the given length.
    pub fn is_drained(&self, available_length: u64) -> bool {
        self.pending(available_length).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivered(indices: &[u64]) -> SequencingState {
        let mut state = SequencingState::new();
        for &i in indices {
            state.mark_delivered(i);
        }
        state
    }

    #[test]
    fn test_empty_state_backfills_everything() {
        let state = SequencingState::new();
        assert_eq!(state.pending(4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_catalog_yields_no_pending() {
        let state = SequencingState::new();
        assert_eq!(state.pending(0), Vec::<u64>::new());
        assert!(state.is_drained(0));
    }

    #[test]
    fn test_gap_fill_then_tail() {
        // delivered = {0,1,2,5}, N = 9 => [3,4,6,7,8]
        let state = delivered(&[0, 1, 2, 5]);
        assert_eq!(state.pending(9), vec![3, 4, 6, 7, 8]);
    }

    #[test]
    fn test_pending_is_idempotent() {
        let state = delivered(&[0, 2]);
        let first = state.pending(5);
        let second = state.pending(5);
        assert_eq!(first, second);
        assert_eq!(first, vec![1, 3, 4]);
    }

    #[test]
    fn test_no_pending_when_caught_up() {
        let state = delivered(&[0, 1, 2]);
        assert_eq!(state.pending(3), Vec::<u64>::new());
        assert!(state.is_drained(3));
    }

    #[test]
    fn test_mark_delivered_is_monotonic() {
        let mut state = delivered(&[0, 1]);
        state.mark_delivered(3);
        assert!(state.is_delivered(0));
        assert!(state.is_delivered(1));
        assert!(state.is_delivered(3));
        assert_eq!(state.delivered_count(), 3);
        assert_eq!(state.last_known_length(), 4);
    }

    #[test]
    fn test_pending_respects_available_length() {
        // Indices are always within [0, N), each exactly once, ascending.
        let state = delivered(&[1, 4, 7]);
        for n in 0..12u64 {
            let pending = state.pending(n);
            let mut sorted = pending.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(pending, sorted, "ascending and unique for N={n}");
            for &i in &pending {
                assert!(i < n);
                assert!(!state.is_delivered(i));
            }
        }
    }

    #[test]
    fn test_shrunken_length_does_not_panic() {
        let state = delivered(&[0, 1, 2, 3, 4]);
        // Catalog claims fewer frames than were delivered; anomaly is logged
        // and pending stays empty.
        assert_eq!(state.pending(2), Vec::<u64>::new());
    }

    #[test]
    fn test_invariant_delivered_below_last_known_length() {
        let mut state = SequencingState::new();
        for i in [5u64, 0, 9, 3] {
            state.mark_delivered(i);
        }
        assert!(state.last_known_length() > 9);
        assert_eq!(state.delivered_count(), 4);
    }
}
