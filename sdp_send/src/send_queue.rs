use std::collections::VecDeque;
use crate::buffers::send_buffer::SendBuffer;
use crate::transport::WorkRequestId;

/// An ordered collection of send buffers. Buffers are owned by the queue while they are in it,
///  so a buffer can never be a member of two queues.
#[derive(Debug, Default)]
pub struct SendQueue {
    buffers: VecDeque<SendBuffer>,
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn put_tail(&mut self, buffer: SendBuffer) {
        self.buffers.push_back(buffer);
    }

    /// for elements that were taken from the head and refused, so FIFO order is preserved
    pub fn put_head(&mut self, buffer: SendBuffer) {
        self.buffers.push_front(buffer);
    }

    pub fn take_head(&mut self) -> Option<SendBuffer> {
        self.buffers.pop_front()
    }

    /// the tail element if it matches the filter, e.g. a data buffer that has room left
    pub fn tail_mut_if(&mut self, filter: impl FnOnce(&SendBuffer) -> bool) -> Option<&mut SendBuffer> {
        match self.buffers.back_mut() {
            Some(buffer) if filter(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Removes all elements up to and including the one with the given work request id.
    ///  Completions of a signaled request imply completion of all unsignaled requests posted
    ///  before it.
    pub fn take_completed(&mut self, wr_id: WorkRequestId) -> Vec<SendBuffer> {
        let Some(pos) = self.buffers.iter().position(|b| b.wr_id() == Some(wr_id)) else {
            return Vec::new();
        };
        self.buffers.drain(..=pos).collect()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = SendBuffer> + '_ {
        self.buffers.drain(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendBuffer> {
        self.buffers.iter()
    }
}
