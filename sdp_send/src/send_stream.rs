use bytes::BufMut;
use parking_lot::MutexGuard;
use tracing::{debug, span, trace, Level};
use crate::buffers::send_buffer::SendBuffer;
use crate::connection::{Connection, ConnectionInner};
use crate::error::SendError;
use crate::send_path::{Admission, BufferReason};

/// Once some bytes were accepted, errors turn into a short count: the caller learns about the
///  error on its next call.
fn partial(copied: usize, error: SendError) -> Result<usize, SendError> {
    if copied > 0 {
        Ok(copied)
    }
    else {
        Err(error)
    }
}

impl Connection {
    /// Appends `bytes` to the connection's stream and returns the number of bytes accepted.
    ///
    /// If `urgent` is set, the last byte is sent as the connection's out-of-band byte.
    ///  A non-blocking call accepts as much as the send queue limit allows and returns
    ///  `WouldBlock` if that is nothing. A blocking call waits for write space until all bytes
    ///  are accepted, the connection breaks, or [Connection::interrupt_blocked_senders] is
    ///  called.
    pub fn send(&self, bytes: &[u8], urgent: bool, blocking: bool) -> Result<usize, SendError> {
        let span = span!(Level::TRACE, "sdp_send", correlation_id = ?self.shared.id, len = bytes.len(), urgent, blocking);
        let _entered = span.enter();

        let mut inner = self.shared.inner.lock();
        if inner.shutdown_send {
            drop(inner);
            return Err(SendError::BrokenPipe);
        }

        let result = self.ingest(&mut inner, bytes, urgent, blocking);
        inner.flush_or_abort();
        self.finish(inner);
        result
    }

    fn ingest(&self, inner: &mut MutexGuard<'_, ConnectionInner>, bytes: &[u8], urgent: bool, blocking: bool) -> Result<usize, SendError> {
        let interrupt_generation = inner.interrupt_generation;
        let mut copied = 0;

        while copied < bytes.len() {
            if !inner.state.can_send_data() {
                debug!("connection cannot send in state {:?}", inner.state);
                return partial(copied, SendError::NotConnected);
            }

            let space = inner.write_space(urgent);
            if space == 0 {
                if !blocking {
                    return partial(copied, SendError::WouldBlock);
                }

                inner.write_full = true;
                inner.flush_or_abort();
                if std::mem::take(&mut inner.wake_writers) {
                    self.shared.write_space.notify_all();
                }
                if !inner.write_full {
                    // the flush itself made room
                    continue;
                }

                trace!("waiting for write space");
                self.shared.write_space.wait(inner);
                if inner.interrupt_generation != interrupt_generation {
                    debug!("interrupted while waiting for write space");
                    return partial(copied, SendError::Interrupted);
                }
                continue;
            }

            let end = copied + space.min(bytes.len() - copied);
            let last_chunk = urgent && end == bytes.len();
            match inner.append_bytes(&bytes[copied..end], last_chunk) {
                Ok(n) => copied += n,
                Err(e) => {
                    if e.is_fatal() {
                        inner.abort(&e.to_string());
                    }
                    return partial(copied, e);
                }
            }
        }

        trace!("accepted {} bytes", copied);
        Ok(copied)
    }
}

impl ConnectionInner {
    /// Copies a prefix of `bytes` into a single buffer, either the partially filled buffer at
    ///  the tail of the data queue or a fresh one. `urgent` marks the last byte of `bytes` as
    ///  out-of-band; it applies only if that byte fits.
    pub(crate) fn append_bytes(&mut self, bytes: &[u8], urgent: bool) -> Result<usize, SendError> {
        if let Some(tail) = self.data_queue.tail_mut_if(|b| b.is_data() && !b.is_full() && !b.flags.oob_present) {
            let n = tail.remaining_mut().min(bytes.len());
            tail.put_slice(&bytes[..n]);
            let urgent = urgent && n == bytes.len();
            if urgent {
                tail.flags.oob_present = true;
            }

            trace!("appended {} bytes to queued buffer", n);
            self.account_committed(n, urgent);
            return Ok(n);
        }

        let Some(mut buffer) = self.pool.acquire() else {
            self.stats.alloc_failures += 1;
            return Err(SendError::OutOfMemory);
        };
        buffer.reserve_window(self.send_buffer_size);

        let n = buffer.remaining_mut().min(bytes.len());
        buffer.put_slice(&bytes[..n]);
        self.commit_bytes(buffer, n, urgent && n == bytes.len())?;
        Ok(n)
    }

    fn account_committed(&mut self, n: usize, urgent: bool) {
        self.bytes_queued += n;
        self.bytes_unposted += n;
        self.stats.bytes_accepted += n as u64;

        if urgent {
            // a newer urgent byte supersedes one that was not posted yet
            if self.oob.pending_offset.is_none() {
                self.oob.send_pending = true;
            }
            self.oob.pending_offset = Some(self.bytes_unposted);
        }
    }

    /// The first commit of a fresh buffer: it is posted right away if nothing is waiting ahead
    ///  of it, and queued otherwise. If admission fails, the commit is undone and the buffer
    ///  goes back to the pool.
    fn commit_bytes(&mut self, mut buffer: SendBuffer, n: usize, urgent: bool) -> Result<(), SendError> {
        let prev_oob = self.oob;
        if urgent {
            buffer.flags.oob_present = true;
        }
        self.account_committed(n, urgent);

        let admission = if self.data_queue.is_empty() && self.ctrl_queue.is_empty() {
            self.admit_data(buffer)
        }
        else {
            Admission::Buffered(buffer, BufferReason::Backlog)
        };

        match admission {
            Admission::Posted => Ok(()),
            Admission::Buffered(buffer, reason) => {
                self.queue_data(buffer, reason);
                Ok(())
            }
            Admission::Failed { buffer: Some(mut buffer), error } => {
                debug!("admission of {} bytes failed: {}", n, error);
                self.bytes_queued -= n;
                self.bytes_unposted -= n;
                self.stats.bytes_accepted -= n as u64;
                self.oob = prev_oob;
                buffer.truncate(0);
                self.pool.release(buffer);
                Err(error)
            }
            Admission::Failed { buffer: None, error } => Err(error),
        }
    }
}
