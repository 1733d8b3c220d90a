//! Participation tracker for playback start.
//!
//! The elected host collects accept/decline responses from the full receiver
//! set. The round finalizes when every pending peer answered or the timeout
//! elapses, whichever comes first; non-responders are silently excluded so a
//! stalled peer never blocks the session.

use std::collections::HashSet;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ParticipationTracker {
    pending: HashSet<i64>,
    accepted: Vec<i64>,
    declined: Vec<i64>,
    deadline: Instant,
}

impl ParticipationTracker {
    pub fn new(receivers: impl IntoIterator<Item = i64>, timeout: Duration) -> Self {
        Self {
            pending: receivers.into_iter().collect(),
            accepted: Vec::new(),
            declined: Vec::new(),
            deadline: Instant::now() + timeout,
        }
    }

    /// Record one peer's answer. Answers from unknown or already-answered
    /// peers are ignored.
    pub fn on_response(&mut self, user_id: i64, accept: bool) {
        if !self.pending.remove(&user_id) {
            return;
        }
        if accept {
            self.accepted.push(user_id);
        } else {
            self.declined.push(user_id);
        }
    }

    /// Complete once nobody is pending or the deadline passed.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() || Instant::now() >= self.deadline
    }

    /// Peers that accepted in time. Only meaningful once complete.
    pub fn accepted(&self) -> &[i64] {
        &self.accepted
    }

    pub fn declined(&self) -> &[i64] {
        &self.declined
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_early_when_everyone_answers() {
        let mut tracker = ParticipationTracker::new([1, 2], Duration::from_secs(60));
        assert!(!tracker.is_complete());
        tracker.on_response(1, true);
        tracker.on_response(2, false);
        assert!(tracker.is_complete());
        assert_eq!(tracker.accepted(), &[1]);
        assert_eq!(tracker.declined(), &[2]);
    }

    #[test]
    fn timeout_excludes_silent_peers() {
        // A never answers; B and C accept before the deadline.
        let mut tracker = ParticipationTracker::new([1, 2, 3], Duration::from_millis(50));
        tracker.on_response(2, true);
        tracker.on_response(3, true);
        assert!(!tracker.is_complete());

        std::thread::sleep(Duration::from_millis(60));
        assert!(tracker.is_complete());
        let mut accepted = tracker.accepted().to_vec();
        accepted.sort_unstable();
        assert_eq!(accepted, vec![2, 3]);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn duplicate_and_unknown_responses_are_ignored() {
        let mut tracker = ParticipationTracker::new([7], Duration::from_secs(60));
        tracker.on_response(7, false);
        tracker.on_response(7, true);
        tracker.on_response(99, true);
        assert_eq!(tracker.accepted(), &[] as &[i64]);
        assert_eq!(tracker.declined(), &[7]);
    }
}
