use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use parking_lot::Mutex;
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace};
use crate::buffers::send_buffer::SendBuffer;
use crate::safe_converter::SafeCast;

/// Source of transmit buffers. Buffers are registered with the transport once and reused
///  aggressively, so connections never allocate on the send path.
#[cfg_attr(test, automock)]
pub trait BufferPool: Send + Sync + 'static {
    /// `None` if the pool is exhausted
    fn acquire(&self) -> Option<SendBuffer>;

    fn release(&self, buffer: SendBuffer);

    fn buffer_size(&self) -> usize;
}

/// A pool with an upper bound on the number of buffers in existence. Buffers are created
///  lazily and get consecutive, page aligned pseudo addresses in one registered region.
pub struct SendBufferPool {
    buf_size: usize,
    max_buffers: usize,
    lkey: u32,
    buffers: Mutex<Vec<SendBuffer>>,
    num_allocated: AtomicUsize,
    next_addr: AtomicU64,
}

impl SendBufferPool {
    pub fn new(buf_size: usize, max_buffers: usize, lkey: u32) -> SendBufferPool {
        SendBufferPool {
            buf_size,
            max_buffers,
            lkey,
            buffers: Mutex::new(Vec::with_capacity(max_buffers)),
            num_allocated: AtomicUsize::new(0),
            next_addr: AtomicU64::new(0),
        }
    }

    /// number of buffers currently handed out
    pub fn num_in_use(&self) -> usize {
        self.num_allocated.load(Ordering::Acquire) - self.buffers.lock().len()
    }

    fn stride(&self) -> u64 {
        self.buf_size.div_ceil(SendBuffer::PAGE_SIZE).safe_cast() * SendBuffer::PAGE_SIZE.safe_cast()
    }
}

impl BufferPool for SendBufferPool {
    fn acquire(&self) -> Option<SendBuffer> {
        if let Some(buffer) = self.buffers.lock().pop() {
            trace!("returning buffer from pool");
            return Some(buffer);
        }

        let reserved = self.num_allocated.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            if n < self.max_buffers { Some(n + 1) } else { None }
        });
        if reserved.is_err() {
            debug!("buffer pool exhausted: all {} buffers are in use", self.max_buffers);
            return None;
        }

        debug!("no buffer in pool: creating new buffer");
        let base_addr = self.next_addr.fetch_add(self.stride(), Ordering::AcqRel);
        Some(SendBuffer::new(self.buf_size, base_addr, self.lkey))
    }

    fn release(&self, mut buffer: SendBuffer) {
        assert_eq!(buffer.capacity(), self.buf_size,
                   "returned buffer does not have the regular capacity of {} bytes", self.buf_size);

        buffer.reset();
        trace!("returning buffer to pool");
        self.buffers.lock().push(buffer);
    }

    fn buffer_size(&self) -> usize {
        self.buf_size
    }
}
