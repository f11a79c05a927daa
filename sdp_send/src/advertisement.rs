use std::collections::VecDeque;
use tracing::{debug, trace};
use crate::buffers::send_buffer::SendBuffer;
use crate::send_queue::SendQueue;
use crate::transport::WorkRequestId;

/// A receive buffer the peer published as a target for RDMA writes ('sink advertisement')
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub addr: u64,
    pub rkey: u32,
    /// bytes still available in the remote buffer
    pub remaining: u32,
    /// bytes written into the remote buffer so far
    pub posted: u32,
    /// the most recent RDMA write against this advertisement
    pub wr_id: Option<WorkRequestId>,
}

impl Advertisement {
    pub fn new(addr: u64, rkey: u32, size: u32) -> Advertisement {
        Advertisement {
            addr,
            rkey,
            remaining: size,
            posted: 0,
            wr_id: None,
        }
    }
}

/// where the next RDMA write goes, and what is needed to take it back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTarget {
    pub remote_addr: u64,
    pub remote_key: u32,
    prev_remaining: u32,
    prev_wr_id: Option<WorkRequestId>,
}

/// Pending sink advertisements in the order the peer published them, plus the data buffers
///  that are currently being written into them. The head of the pending queue is the 'active'
///  advertisement.
#[derive(Debug, Default)]
pub struct AdvertisementTable {
    pending: VecDeque<Advertisement>,
    sink_writes: SendQueue,
    /// advertisements received and not yet retired or discarded
    received: u32,
}

impl AdvertisementTable {
    pub fn new() -> AdvertisementTable {
        AdvertisementTable::default()
    }

    pub fn push(&mut self, advertisement: Advertisement) {
        trace!("sink advertisement received: {:?}", advertisement);
        self.pending.push_back(advertisement);
        self.received += 1;
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn peek_active_advertisement(&self) -> Option<&Advertisement> {
        self.pending.front()
    }

    pub fn take_active_advertisement(&mut self) -> Option<Advertisement> {
        self.pending.pop_front()
    }

    /// Final bookkeeping for an advertisement taken from the table. Returns the number of
    ///  bytes written into it, which is what the completion message reports.
    pub fn retire_advertisement(&mut self, advertisement: Advertisement) -> u32 {
        debug!("retiring sink advertisement at {:#x} after {} bytes", advertisement.addr, advertisement.posted);
        self.received = self.received.saturating_sub(1);
        advertisement.posted
    }

    /// Reserves `len` bytes in the active advertisement for a write with the given id
    pub fn advance_active(&mut self, len: u32, wr_id: WorkRequestId) -> Option<WriteTarget> {
        let active = self.pending.front_mut()?;
        let target = WriteTarget {
            remote_addr: active.addr,
            remote_key: active.rkey,
            prev_remaining: active.remaining,
            prev_wr_id: active.wr_id,
        };

        // the peer guarantees its sink holds at least one full message, so a write may exceed
        //  what is nominally left
        active.remaining = active.remaining.saturating_sub(len);
        active.addr += len as u64;
        active.posted += len;
        active.wr_id = Some(wr_id);
        Some(target)
    }

    /// undo [AdvertisementTable::advance_active] after the transport refused the write
    pub fn rewind_active(&mut self, len: u32, target: WriteTarget) {
        if let Some(active) = self.pending.front_mut() {
            active.remaining = target.prev_remaining;
            active.addr = target.remote_addr;
            active.posted -= len;
            active.wr_id = target.prev_wr_id;
        }
    }

    pub fn track_write(&mut self, buffer: SendBuffer) {
        self.sink_writes.put_tail(buffer);
    }

    pub fn has_sink_writes(&self) -> bool {
        !self.sink_writes.is_empty()
    }

    pub fn num_sink_writes(&self) -> usize {
        self.sink_writes.len()
    }

    pub fn take_completed_writes(&mut self, wr_id: WorkRequestId) -> Vec<SendBuffer> {
        self.sink_writes.take_completed(wr_id)
    }

    /// drops all pending advertisements, e.g. on abort. Writes in flight stay tracked until the
    ///  transport completes them.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
        self.received = 0;
    }
}
