//! Per-channel loop state owned exclusively by the decision thread.
//!
//! Two small trackers live for the whole run: how many chunks of the current
//! read each channel has produced, and the last action dispatched per
//! channel. Neither needs synchronisation; the main loop is the only writer
//! and reader.

use core_model::Action;

/// Counts chunks seen for the current read on each channel.
///
/// Invariant: the counter resets to zero the moment a channel reports a read
/// number different from the last one seen, so the count only ever describes
/// consecutive chunks of one molecule.
#[derive(Debug)]
pub struct ChunkTracker {
    /// Indexed by channel (1-based; slot 0 unused): (read_number, count).
    seen: Vec<(u32, u32)>,
}

impl ChunkTracker {
    pub fn new(channels: usize) -> Self {
        Self {
            seen: vec![(0, 0); channels + 1],
        }
    }

    /// Record a chunk for `(channel, read_number)` and return how many chunks
    /// of that read have now been seen. O(1).
    pub fn seen(&mut self, channel: u32, read_number: u32) -> u32 {
        let slot = &mut self.seen[channel as usize];
        if slot.0 != read_number {
            *slot = (read_number, 0);
        }
        slot.1 += 1;
        slot.1
    }

    /// Current count without recording, for assertions and observability.
    pub fn count(&self, channel: u32, read_number: u32) -> u32 {
        match self.seen.get(channel as usize) {
            Some(&(number, count)) if number == read_number => count,
            _ => 0,
        }
    }
}

/// Last action dispatched per channel, with the read it applied to.
///
/// Lets the decision engine suppress re-sending an identical command for the
/// same read and gives the statistics layer its first-read signal.
#[derive(Debug)]
pub struct SentActionTracker {
    last: Vec<Option<(u32, Action)>>,
}

impl SentActionTracker {
    pub fn new(channels: usize) -> Self {
        Self {
            last: vec![None; channels + 1],
        }
    }

    pub fn record(&mut self, channel: u32, read_number: u32, action: Action) {
        self.last[channel as usize] = Some((read_number, action));
    }

    /// Last `(read_number, action)` dispatched on this channel, if any.
    pub fn get(&self, channel: u32) -> Option<(u32, Action)> {
        self.last.get(channel as usize).copied().flatten()
    }

    /// True when `action` was already dispatched for this exact read.
    pub fn already_sent(&self, channel: u32, read_number: u32, action: Action) -> bool {
        self.get(channel) == Some((read_number, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_counter_increments_within_a_read() {
        let mut tracker = ChunkTracker::new(512);
        assert_eq!(tracker.seen(7, 100), 1);
        assert_eq!(tracker.seen(7, 100), 2);
        assert_eq!(tracker.seen(7, 100), 3);
        assert_eq!(tracker.count(7, 100), 3);
    }

    #[test]
    fn chunk_counter_resets_on_new_read() {
        let mut tracker = ChunkTracker::new(512);
        tracker.seen(7, 100);
        tracker.seen(7, 100);
        assert_eq!(tracker.seen(7, 101), 1);
        assert_eq!(tracker.count(7, 100), 0);
    }

    #[test]
    fn channels_are_independent() {
        let mut tracker = ChunkTracker::new(512);
        tracker.seen(7, 100);
        assert_eq!(tracker.seen(8, 100), 1);
        assert_eq!(tracker.seen(7, 100), 2);
    }

    #[test]
    fn sent_actions_track_read_and_action() {
        let mut tracker = SentActionTracker::new(512);
        assert_eq!(tracker.get(7), None);
        tracker.record(7, 100, Action::StopReceiving);
        assert!(tracker.already_sent(7, 100, Action::StopReceiving));
        assert!(!tracker.already_sent(7, 100, Action::Unblock));
        assert!(!tracker.already_sent(7, 101, Action::StopReceiving));
        tracker.record(7, 101, Action::Unblock);
        assert_eq!(tracker.get(7), Some((101, Action::Unblock)));
    }
}
