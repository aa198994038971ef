use std::collections::VecDeque;
use std::time::Instant;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

/// Wrap-aware sequence comparison.
#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug)]
struct SentPacket {
    sequence: u32,
    send_time: Instant,
    acked: bool,
}

/// Tracks in-flight packet sequences and derives a smoothed RTT from the
/// acks that come back (RFC 6298 smoothing).
#[derive(Debug)]
pub struct AckTracker {
    in_flight: VecDeque<SentPacket>,
    max_in_flight: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            in_flight: VecDeque::with_capacity(max_in_flight),
            max_in_flight,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track_packet(&mut self, sequence: u32) {
        while self.in_flight.len() >= self.max_in_flight {
            self.in_flight.pop_front();
        }
        self.in_flight.push_back(SentPacket {
            sequence,
            send_time: Instant::now(),
            acked: false,
        });
    }

    /// Marks everything the remote acknowledged and returns the newly acked
    /// sequences. `ack` names the newest packet the remote saw, bit N of
    /// `ack_bitfield` the packet N+1 before it.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32) -> Vec<u32> {
        let mut acked = Vec::new();
        let now = Instant::now();

        for sent in &mut self.in_flight {
            if sent.acked {
                continue;
            }

            let hit = if sent.sequence == ack {
                true
            } else if sequence_greater_than(ack, sent.sequence) {
                let diff = ack.wrapping_sub(sent.sequence);
                diff <= 32 && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };

            if hit {
                sent.acked = true;
                acked.push(sent.sequence);
                let rtt = now.duration_since(sent.send_time).as_secs_f32() * 1000.0;
                self.rtt_var = 0.75 * self.rtt_var + 0.25 * (rtt - self.srtt).abs();
                self.srtt = 0.875 * self.srtt + 0.125 * rtt;
            }
        }

        while self.in_flight.front().is_some_and(|p| p.acked) {
            self.in_flight.pop_front();
        }

        acked
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    /// Retransmission timeout derived from the RTT estimate.
    pub fn rto_ms(&self) -> f32 {
        (self.srtt + 4.0 * self.rtt_var).clamp(100.0, 1000.0)
    }

    pub fn unacked_count(&self) -> usize {
        self.in_flight.iter().filter(|p| !p.acked).count()
    }
}

/// Remembers which packet sequences arrived so duplicates can be dropped
/// and outgoing headers can carry ack data for the remote.
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    newest: u32,
    bitfield: u32,
    any_received: bool,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for duplicates and for packets more than 32 sequences
    /// behind the newest one seen.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if !self.any_received {
            self.any_received = true;
            self.newest = sequence;
            self.bitfield = 0;
            return true;
        }

        if sequence == self.newest {
            return false;
        }

        if sequence_greater_than(sequence, self.newest) {
            let diff = sequence.wrapping_sub(self.newest);
            if diff <= 32 {
                // A diff of exactly 32 shifts every old bit out; u32 << 32
                // is UB-adjacent (panics in debug), so go through checked_shl.
                self.bitfield = self.bitfield.checked_shl(diff).unwrap_or(0) | (1 << (diff - 1));
            } else {
                self.bitfield = 0;
            }
            self.newest = sequence;
            return true;
        }

        let diff = self.newest.wrapping_sub(sequence);
        if diff > 32 {
            return false;
        }
        let bit = 1 << (diff - 1);
        if self.bitfield & bit != 0 {
            return false;
        }
        self.bitfield |= bit;
        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.newest, self.bitfield)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sequence_comparison_wraps() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn receive_tracker_builds_bitfield() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(1));
        assert!(tracker.record_received(2));
        assert!(tracker.record_received(3));

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn receive_tracker_accepts_out_of_order() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(3));
        assert!(tracker.record_received(1));
        assert!(tracker.record_received(2));

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn receive_tracker_drops_duplicates() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(5));
        assert!(!tracker.record_received(5));
        assert!(tracker.record_received(4));
        assert!(!tracker.record_received(4));
        assert!(tracker.record_received(6));
    }

    #[test]
    fn receive_tracker_survives_a_31_packet_gap() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(0));

        // Exactly 32 ahead: the old newest still fits in the last ack bit.
        assert!(tracker.record_received(32));
        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 32);
        assert_eq!(bitfield, 1 << 31);

        // Beyond 32 the window restarts empty.
        assert!(tracker.record_received(70));
        assert_eq!(tracker.ack_data(), (70, 0));
    }

    #[test]
    fn receive_tracker_drops_stale() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record_received(100));
        assert!(!tracker.record_received(50));
    }

    #[test]
    fn ack_tracker_updates_rtt() {
        let mut tracker = AckTracker::new(32);
        tracker.track_packet(1);
        std::thread::sleep(Duration::from_millis(10));

        let acked = tracker.process_ack(1, 0);
        assert_eq!(acked, vec![1]);
        assert!(tracker.srtt() > 0.0);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn ack_tracker_reads_bitfield() {
        let mut tracker = AckTracker::new(32);
        tracker.track_packet(10);
        tracker.track_packet(11);
        tracker.track_packet(12);

        // Ack 12 plus bit 1 (sequence 10); 11 stays in flight.
        let acked = tracker.process_ack(12, 0b10);
        assert!(acked.contains(&10));
        assert!(acked.contains(&12));
        assert!(!acked.contains(&11));
        assert_eq!(tracker.unacked_count(), 1);
    }
}
