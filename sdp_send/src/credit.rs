use tracing::trace;
use crate::safe_converter::ClampedCast;

/// What a successful post stamped into its header, and what is needed to undo it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostStamp {
    pub recv_bufs: u16,
    pub seq_num: u32,
    pub seq_ack: u32,
    prev_advertised: u32,
}

/// Per-connection flow control bookkeeping.
///
/// `remote_credits` is the number of receive buffers the peer has posted that we may still
///  fill. Data posts need at least `min_credits`, leaving the rest for control messages which
///  must never be starved by data.
#[derive(Debug)]
pub struct CreditLedger {
    remote_credits: i32,
    min_credits: i32,
    local_recv_buffers: u32,
    local_advertised: u32,
    send_seq: u32,
    ack_seq: u32,
}

impl CreditLedger {
    pub fn new(initial_remote_credits: i32, local_recv_buffers: u32, min_credits: i32) -> CreditLedger {
        CreditLedger {
            remote_credits: initial_remote_credits,
            min_credits,
            local_recv_buffers,
            local_advertised: 0,
            send_seq: 0,
            ack_seq: 0,
        }
    }

    pub fn remote_credits(&self) -> i32 {
        self.remote_credits
    }

    pub fn local_advertised(&self) -> u32 {
        self.local_advertised
    }

    pub fn send_seq(&self) -> u32 {
        self.send_seq
    }

    pub fn ack_seq(&self) -> u32 {
        self.ack_seq
    }

    /// enough credits for a data message
    pub fn has_send_credit(&self) -> bool {
        self.remote_credits >= self.min_credits
    }

    /// more credits than data messages need, i.e. an ack could piggy-back on queued data
    pub fn has_spare_credit(&self) -> bool {
        self.remote_credits > self.min_credits
    }

    /// any credit at all, which is what control messages need
    pub fn has_control_credit(&self) -> bool {
        self.remote_credits > 0
    }

    /// Takes one credit for a post and advances the send sequence. The number of local receive
    ///  buffers advertised to the peer is refreshed from current availability.
    pub fn consume_credit(&mut self) -> PostStamp {
        let prev_advertised = self.local_advertised;

        self.remote_credits -= 1;
        self.send_seq = self.send_seq.wrapping_add(1);
        self.local_advertised = self.local_recv_buffers;

        trace!("consumed credit: {} remaining, seq {}", self.remote_credits, self.send_seq);
        PostStamp {
            recv_bufs: self.local_advertised.clamped_cast(),
            seq_num: self.send_seq,
            seq_ack: self.ack_seq,
            prev_advertised,
        }
    }

    /// exact inverse of [CreditLedger::consume_credit] for a post the transport refused
    pub fn restore_credit(&mut self, stamp: PostStamp) {
        debug_assert_eq!(stamp.seq_num, self.send_seq, "restoring a credit out of order");

        self.remote_credits += 1;
        self.send_seq = self.send_seq.wrapping_sub(1);
        self.local_advertised = stamp.prev_advertised;
    }

    /// the peer reported how many receive buffers it has available for us, and the last
    ///  sequence number it received
    pub fn update_remote(&mut self, remote_credits: i32, peer_seq: u32) {
        self.remote_credits = remote_credits.max(0);
        self.ack_seq = peer_seq;
    }

    pub fn set_local_recv_buffers(&mut self, local_recv_buffers: u32) {
        self.local_recv_buffers = local_recv_buffers;
    }
}
