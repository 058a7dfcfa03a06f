use std::collections::HashMap;

use tracing::error;

use crate::config_models::entity_id::EntityId;

/// Sequence state of the traffic with one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgTrackerInfo {
    /// Last sequence number handed out for a message to the peer.
    pub max_sent_seq: u64,

    /// Highest sequence number the peer acknowledged.
    pub max_ack_seq: u64,

    /// Last sequence number received from the peer.
    pub max_recv_seq: u64,

    /// Highest received sequence number this side acknowledged.
    pub max_acked_seq: u64,
}

/// Sliding-window flow control over an ordered, lossless transport.
///
/// Outbound messages get consecutive sequence numbers starting at 1; the
/// sender stops starting new bursts once `max_pending_msgs` are in flight to
/// any peer. Inbound messages must arrive in sequence and are acknowledged
/// cumulatively, at most every `max_pending_acks` messages. Any violation
/// means the transport broke its guarantees and is fatal.
#[derive(Debug, Clone)]
pub struct MsgTracker {
    max_pending_msgs: u64,
    max_pending_acks: u64,
    peers: HashMap<EntityId, MsgTrackerInfo>,
}

impl MsgTracker {
    pub fn new(max_pending_msgs: u64, max_pending_acks: u64) -> Self {
        Self {
            max_pending_msgs,
            max_pending_acks,
            peers: HashMap::new(),
        }
    }

    pub fn add_entity(&mut self, peer: EntityId) {
        self.peers.entry(peer).or_default();
    }

    fn info_mut(&mut self, peer: EntityId) -> &mut MsgTrackerInfo {
        match self.peers.get_mut(&peer) {
            Some(info) => info,
            None => {
                error!("msg tracker: unknown peer {}", peer);
                panic!("msg tracker has no entry for peer {}", peer);
            }
        }
    }

    pub fn info(&self, peer: EntityId) -> Option<MsgTrackerInfo> {
        self.peers.get(&peer).copied()
    }

    /// Sequence number for the next message to `peer`. Never 0.
    pub fn inc_get_seq(&mut self, peer: EntityId) -> u64 {
        let info = self.info_mut(peer);
        info.max_sent_seq += 1;
        info.max_sent_seq
    }

    /// Record a cumulative ack from `peer`.
    ///
    /// # Panics
    /// If `ack_seq` is below an earlier ack or beyond the last sent message.
    pub fn recv_ack(&mut self, peer: EntityId, ack_seq: u64) {
        let info = self.info_mut(peer);
        if ack_seq < info.max_ack_seq || ack_seq > info.max_sent_seq {
            error!(
                "msg tracker: ack {} from {} outside [{}, {}]",
                ack_seq, peer, info.max_ack_seq, info.max_sent_seq
            );
            panic!(
                "protocol violation: ack {} from peer {} outside [{}, {}]",
                ack_seq, peer, info.max_ack_seq, info.max_sent_seq
            );
        }
        info.max_ack_seq = ack_seq;
    }

    /// True iff fewer than `max_pending_msgs` messages are unacknowledged for
    /// every peer.
    pub fn check_send_all(&self) -> bool {
        self.peers
            .values()
            .all(|info| info.max_sent_seq - info.max_ack_seq < self.max_pending_msgs)
    }

    pub fn pending_msgs(&self, peer: EntityId) -> u64 {
        self.peers
            .get(&peer)
            .map(|info| info.max_sent_seq - info.max_ack_seq)
            .unwrap_or_default()
    }

    /// Record receipt of message `seq` from `peer`. Returns true when an ack
    /// is due; the caller must then send one for `seq`.
    ///
    /// # Panics
    /// If `seq` is not the successor of the last received sequence number.
    pub fn recv_msg(&mut self, peer: EntityId, seq: u64) -> bool {
        let max_pending_acks = self.max_pending_acks;
        let info = self.info_mut(peer);
        if seq != info.max_recv_seq + 1 {
            error!(
                "msg tracker: got seq {} from {}, expected {}",
                seq,
                peer,
                info.max_recv_seq + 1
            );
            panic!(
                "protocol violation: seq {} from peer {} after {}",
                seq, peer, info.max_recv_seq
            );
        }
        info.max_recv_seq = seq;
        if seq > info.max_acked_seq + max_pending_acks {
            info.max_acked_seq = seq;
            return true;
        }
        false
    }

    /// Force an ack of everything received so far. Returns the sequence
    /// number to acknowledge, or `None` if nothing new arrived.
    pub fn ack_all(&mut self, peer: EntityId) -> Option<u64> {
        let info = self.info_mut(peer);
        if info.max_recv_seq == info.max_acked_seq {
            return None;
        }
        info.max_acked_seq = info.max_recv_seq;
        Some(info.max_recv_seq)
    }
}

#[cfg(test)]
mod tests {
    use proptest::collection;
    use proptest::prelude::*;
    use test_strategy::proptest;

    use super::*;

    #[test]
    fn sequence_numbers_start_at_one() {
        let mut tracker = MsgTracker::new(2, 1);
        tracker.add_entity(5);
        tracker.add_entity(6);
        assert_eq!(1, tracker.inc_get_seq(5));
        assert_eq!(2, tracker.inc_get_seq(5));
        assert_eq!(1, tracker.inc_get_seq(6));
        assert!(!tracker.check_send_all());
        tracker.recv_ack(5, 1);
        assert!(tracker.check_send_all());
        assert_eq!(1, tracker.pending_msgs(5));
    }

    #[test]
    fn acks_are_delayed_by_the_pending_ack_window() {
        let mut tracker = MsgTracker::new(8, 2);
        tracker.add_entity(1);
        assert!(!tracker.recv_msg(1, 1));
        assert!(!tracker.recv_msg(1, 2));
        assert!(tracker.recv_msg(1, 3));
        assert!(!tracker.recv_msg(1, 4));
        assert_eq!(Some(4), tracker.ack_all(1));
        assert_eq!(None, tracker.ack_all(1));
        assert!(!tracker.recv_msg(1, 5));
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn sequence_gap_is_fatal() {
        let mut tracker = MsgTracker::new(8, 2);
        tracker.add_entity(1);
        tracker.recv_msg(1, 1);
        tracker.recv_msg(1, 3);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn ack_beyond_sent_is_fatal() {
        let mut tracker = MsgTracker::new(8, 2);
        tracker.add_entity(1);
        tracker.inc_get_seq(1);
        tracker.recv_ack(1, 2);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn regressing_ack_is_fatal() {
        let mut tracker = MsgTracker::new(8, 2);
        tracker.add_entity(1);
        tracker.inc_get_seq(1);
        tracker.inc_get_seq(1);
        tracker.recv_ack(1, 2);
        tracker.recv_ack(1, 1);
    }

    /// Ops on peers 0..3: `true` sends, `false` acks a valid sequence number
    /// chosen by the fraction.
    #[proptest]
    fn window_invariant_holds(
        #[strategy(1u64..6)] window: u64,
        #[strategy(collection::vec((0..3i32, any::<bool>(), 0.0f64..1.0), 1..100))] ops: Vec<(
            i32,
            bool,
            f64,
        )>,
    ) {
        let mut tracker = MsgTracker::new(window, 1);
        for peer in 0..3 {
            tracker.add_entity(peer);
        }
        for (peer, send, fraction) in ops {
            if send {
                let seq = tracker.inc_get_seq(peer);
                prop_assert_ne!(0, seq);
            } else {
                let info = tracker.info(peer).unwrap();
                let span = info.max_sent_seq - info.max_ack_seq;
                let ack = info.max_ack_seq + (span as f64 * fraction) as u64;
                tracker.recv_ack(peer, ack);
            }
            let mut any_full = false;
            for peer in 0..3 {
                let info = tracker.info(peer).unwrap();
                prop_assert!(info.max_ack_seq <= info.max_sent_seq);
                any_full |= info.max_sent_seq - info.max_ack_seq >= window;
            }
            prop_assert_eq!(!any_full, tracker.check_send_all());
        }
    }
}
