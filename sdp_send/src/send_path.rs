//! Admission of buffers to the transport: the decision whether a buffer is posted right away
//!  through the buffered path, written directly into an advertised sink buffer, or held back.

use tracing::{debug, error, trace, warn};
use crate::buffers::send_buffer::{BufferKind, SendBuffer};
use crate::connection::ConnectionInner;
use crate::error::SendError;
use crate::header::{Bsdh, HeaderFlags};
use crate::mode::{ModeChange, TransferMode};
use crate::safe_converter::PrecheckedCast;
use crate::transport::WorkRequestFlags;

/// why a buffer was not posted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferReason {
    /// out of work request slots, or held back to coalesce / for slow start
    NoBuffers,
    NoCredit,
    /// other buffers are waiting ahead of it
    Backlog,
}

#[must_use]
pub(crate) enum Admission {
    Posted,
    /// not an error: the caller puts the buffer into the matching retry queue
    Buffered(SendBuffer, BufferReason),
    /// The buffer is returned if it was not handed to the transport. After a successful RDMA
    ///  write whose completion message could not be sent, there is no buffer left to return.
    Failed { buffer: Option<SendBuffer>, error: SendError },
}

impl ConnectionInner {
    /// Routes a data buffer to the buffered path or to the active sink advertisement. Buffers
    ///  carrying an urgent byte always take the buffered path because only that path carries
    ///  the out-of-band flags.
    pub(crate) fn admit_data(&mut self, buffer: SendBuffer) -> Admission {
        if !self.state.can_send_data() || self.source_cancel {
            return Admission::Failed { buffer: Some(buffer), error: SendError::InvalidState };
        }

        if self.adverts.peek_active_advertisement().is_none() || buffer.flags.oob_present {
            self.post_data(buffer)
        }
        else {
            self.post_sink(buffer)
        }
    }

    fn post_data(&mut self, buffer: SendBuffer) -> Admission {
        if !self.credits.has_send_credit() {
            return Admission::Buffered(buffer, BufferReason::NoCredit);
        }

        // an unsignaled post never completes on its own, so it must not hold anything back
        if self.signaled_in_flight > 0 || self.adverts.has_sink_writes() {
            if !self.config.nodelay && !buffer.is_full() && !buffer.flags.oob_present {
                trace!("holding partially filled buffer while work is in flight");
                return Admission::Buffered(buffer, BufferReason::NoBuffers);
            }

            if self.posted_work >= self.post_window {
                self.post_window_holds += 1;
                if self.post_window_holds >= self.config.post_window_ramp {
                    self.post_window_holds = 0;
                    if self.post_window < self.config.max_outstanding_work {
                        self.post_window += 1;
                        trace!("post window grows to {}", self.post_window);
                    }
                }
                return Admission::Buffered(buffer, BufferReason::NoBuffers);
            }
        }

        let mut after_advertisement = false;
        match self.adverts.peek_active_advertisement().map(|a| a.posted) {
            Some(written) if written > 0 => {
                // the peer must learn how much went into its sink before the stream continues
                //  through its receive buffers
                if let Err(e) = self.retire_active_advertisement() {
                    return Admission::Failed { buffer: Some(buffer), error: e };
                }
                if !self.ctrl_queue.is_empty() || !self.credits.has_send_credit() {
                    return Admission::Buffered(buffer, BufferReason::NoCredit);
                }
                after_advertisement = true;
            }
            Some(_) => {
                if let Some(unused) = self.adverts.take_active_advertisement() {
                    debug!("discarding unused sink advertisement at {:#x}", unused.addr);
                    let _ = self.adverts.retire_advertisement(unused);
                }
                after_advertisement = true;
            }
            None => {}
        }

        let result = self.post_buffer(buffer);
        if matches!(result, Admission::Posted) && !after_advertisement {
            self.stats.nondiscarded_sends += 1;
        }
        result
    }

    fn post_sink(&mut self, mut buffer: SendBuffer) -> Admission {
        if self.posted_work >= self.config.max_outstanding_work {
            return Admission::Buffered(buffer, BufferReason::NoBuffers);
        }
        if !buffer.is_data() {
            return Admission::Failed { buffer: Some(buffer), error: SendError::InvalidArgument };
        }

        let len = buffer.data_size();
        let wr_id = self.next_wr_id;
        let Some(target) = self.adverts.advance_active(len.prechecked_cast(), wr_id) else {
            return Admission::Failed { buffer: Some(buffer), error: SendError::InvalidArgument };
        };

        self.next_wr_id = wr_id.next();
        self.posted_work += 1;
        buffer.set_wr_id(Some(wr_id));
        let prev_oob = self.oob;
        self.account_posted(len);

        let sgl = [buffer.payload_segment()];
        if let Err(e) = self.transport.submit_rdma_write(&buffer, &sgl, target.remote_addr, target.remote_key) {
            warn!("RDMA write of {} bytes was refused: {}", len, e);
            self.adverts.rewind_active(len.prechecked_cast(), target);
            self.next_wr_id = wr_id;
            self.posted_work -= 1;
            self.bytes_unposted += len;
            self.oob = prev_oob;
            buffer.set_wr_id(None);
            return Admission::Failed { buffer: Some(buffer), error: SendError::InvalidArgument };
        }

        trace!("RDMA write {} of {} bytes to {:#x}", wr_id, len, target.remote_addr);
        self.stats.rdma_writes += 1;
        self.adverts.track_write(buffer);

        let exhausted = self.adverts.peek_active_advertisement()
            .map(|a| (a.remaining as usize) < self.send_buffer_size)
            .unwrap_or(false);
        if exhausted {
            if let Err(e) = self.retire_active_advertisement() {
                error!("sink write went out but its completion could not be reported: {}", e);
                return Admission::Failed { buffer: None, error: SendError::NoDevice };
            }
        }
        Admission::Posted
    }

    /// Hands a buffer to the transport through the buffered path: data and control alike. The
    ///  header is written here, so a buffer that was refused before goes out with current
    ///  credit and sequence information.
    pub(crate) fn post_buffer(&mut self, mut buffer: SendBuffer) -> Admission {
        let stamp = self.credits.consume_credit();
        let wr_id = self.next_wr_id;
        self.next_wr_id = wr_id.next();
        self.posted_work += 1;
        buffer.set_wr_id(Some(wr_id));

        let prev_oob = self.oob;
        let prev_unsignaled_run = self.unsignaled_run;
        let data_size = if buffer.is_data() { buffer.data_size() } else { 0 };
        self.account_posted(data_size);

        let mut header_flags = buffer.header_flags();
        let mut solicit = buffer.flags.solicit;
        if self.oob.send_pending && self.oob.pending_offset.map(|o| o <= self.config.oob_pending_limit).unwrap_or(false) {
            header_flags |= HeaderFlags::OOB_PEND;
            solicit = true;
            self.oob.send_pending = false;
        }
        if buffer.flags.oob_present && self.oob.pending_offset == Some(0) {
            header_flags |= HeaderFlags::OOB_PRES;
            solicit = true;
            self.oob.pending_offset = None;
        }

        let header = Bsdh {
            mid: buffer.message_id(),
            flags: header_flags,
            recv_bufs: stamp.recv_bufs,
            size: buffer.wire_len().prechecked_cast(),
            seq_num: stamp.seq_num,
            seq_ack: stamp.seq_ack,
        };
        buffer.write_header(&header);

        let mut flags = WorkRequestFlags::empty();
        let sgl = if buffer.wire_len() <= self.config.inline_max {
            flags |= WorkRequestFlags::INLINE;
            vec![buffer.inline_segment()]
        }
        else {
            buffer.segments()
        };
        if solicit {
            flags |= WorkRequestFlags::SOLICIT;
        }
        let signaled = self.needs_signal(buffer.flags.unsignaled);
        if signaled {
            flags |= WorkRequestFlags::SIGNALED;
        }

        if let Err(e) = self.transport.submit_send(&buffer, &sgl, flags) {
            warn!("transport refused {:?}: {}", buffer, e);
            self.credits.restore_credit(stamp);
            self.next_wr_id = wr_id;
            self.posted_work -= 1;
            self.bytes_unposted += data_size;
            self.oob = prev_oob;
            self.unsignaled_run = prev_unsignaled_run;
            buffer.set_wr_id(None);
            return Admission::Failed { buffer: Some(buffer), error: SendError::Io(e) };
        }

        trace!("posted {:?} as work request {}: seq {}, flags {:?}", header.mid, wr_id, header.seq_num, flags);
        if signaled {
            self.signaled_in_flight += 1;
        }
        self.stats.segments_sent += 1;
        if let BufferKind::Control(kind) = buffer.kind() {
            self.stats.on_control_sent(kind);
        }
        self.posted.put_tail(buffer);
        Admission::Posted
    }

    fn account_posted(&mut self, data_size: usize) {
        self.bytes_unposted -= data_size;
        if let Some(offset) = self.oob.pending_offset.as_mut() {
            *offset = offset.saturating_sub(data_size);
        }
    }

    /// Posts that do not need a completion can go unsignaled in runs of `unsignaled_batch`,
    ///  relying on the next signaled completion to cover them.
    fn needs_signal(&mut self, may_go_unsignaled: bool) -> bool {
        if self.config.unsignaled_batch == 0 || !may_go_unsignaled || self.unsignaled_run >= self.config.unsignaled_batch {
            self.unsignaled_run = 0;
            return true;
        }
        self.unsignaled_run += 1;
        false
    }

    pub(crate) fn queue_data(&mut self, mut buffer: SendBuffer, reason: BufferReason) {
        trace!("buffering {} bytes: {:?}", buffer.data_size(), reason);
        buffer.flags.queued = true;
        self.data_queue.put_tail(buffer);

        if self.modes.send_mode() == TransferMode::Combined && self.data_queue.len() >= self.config.send_backlog {
            debug!("send backlog of {} buffers: requesting pipelined mode", self.data_queue.len());
            if let Err(e) = self.send_mode_change(ModeChange::PipeRecv) {
                debug!("request for pipelined mode failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use mockall::Sequence;
    use crate::advertisement::Advertisement;
    use crate::buffers::buffer_pool::{MockBufferPool, SendBufferPool};
    use crate::buffers::send_buffer::SendBuffer;
    use crate::config::SdpConfig;
    use crate::connection::{Connection, ConnectionState, DisconnectState};
    use crate::control_messages::ControlMessage;
    use crate::error::{SendError, TransportError};
    use crate::header::{HeaderFlags, MessageId};
    use crate::mode::{ModeChange, TransferMode};
    use crate::test_util::{params, recording_connection, RecordingTransport, Submission};
    use crate::transport::{MockTransport, WorkRequestFlags};

    #[test]
    fn test_sink_write_and_completion() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        conn.on_sink_available(Advertisement::new(0x8000, 77, 50)).unwrap();

        assert_eq!(conn.send(&[5u8; 60], false, false), Ok(60));

        let submissions = transport.submissions();
        assert_eq!(submissions.len(), 2);
        match &submissions[0] {
            Submission::RdmaWrite { payload, remote_addr, remote_key, .. } => {
                assert_eq!(payload, &vec![5u8; 60]);
                assert_eq!(*remote_addr, 0x8000);
                assert_eq!(*remote_key, 77);
            }
            other => panic!("unexpected submission {:?}", other),
        }
        assert_eq!(submissions[1].control_message(), Some(ControlMessage::RdmaWriteComplete(60)));

        let snapshot = conn.snapshot();
        assert!(snapshot.active_advertisement.is_none());
        assert_eq!(snapshot.sink_writes, 1);
        assert_eq!(snapshot.posted_work, 2);
        assert_eq!(conn.stats().rdma_writes, 1);
    }

    #[test]
    fn test_sink_stays_active_while_room_left() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        conn.on_sink_available(Advertisement::new(0x8000, 77, 4000)).unwrap();
        let room = 1024 - SendBuffer::HEADER_LEN;

        assert_eq!(conn.send(&vec![1u8; 2 * room], false, false), Ok(2 * room));

        let submissions = transport.submissions();
        assert_eq!(submissions.len(), 3);
        match (&submissions[0], &submissions[1]) {
            (Submission::RdmaWrite { remote_addr: a, .. }, Submission::RdmaWrite { remote_addr: b, .. }) => {
                assert_eq!(*a, 0x8000);
                assert_eq!(*b, 0x8000 + room as u64);
            }
            other => panic!("unexpected submissions {:?}", other),
        }
        // nothing left to send, so the half used advertisement is reported back to the peer
        assert_eq!(submissions[2].control_message(), Some(ControlMessage::RdmaWriteComplete(2 * room as u32)));
        assert!(conn.snapshot().active_advertisement.is_none());
    }

    #[test]
    fn test_urgent_data_bypasses_sink() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        conn.on_sink_available(Advertisement::new(0x8000, 77, 4000)).unwrap();

        conn.send(b"!", true, false).unwrap();

        let submissions = transport.submissions();
        assert_eq!(submissions.len(), 1);
        match &submissions[0] {
            Submission::Send { header, payload, .. } => {
                assert_eq!(header.mid, MessageId::Data);
                assert!(header.flags.contains(HeaderFlags::OOB_PRES));
                assert_eq!(payload, b"!");
            }
            other => panic!("unexpected submission {:?}", other),
        }
        // the advertisement was not used, so it is discarded without a completion message
        assert!(conn.snapshot().active_advertisement.is_none());
    }

    #[test]
    fn test_completion_precedes_later_buffered_data() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        conn.on_sink_available(Advertisement::new(0x8000, 77, 4000)).unwrap();
        conn.send(&[1u8; 30], false, false).unwrap();

        conn.send(b"x", true, false).unwrap();

        let submissions = transport.submissions();
        assert_eq!(submissions.len(), 3);
        assert!(matches!(submissions[0], Submission::RdmaWrite { .. }));
        assert_eq!(submissions[1].control_message(), Some(ControlMessage::RdmaWriteComplete(30)));
        match &submissions[2] {
            Submission::Send { header, payload, .. } => {
                assert_eq!(header.mid, MessageId::Data);
                assert_eq!(payload, b"x");
            }
            other => panic!("unexpected submission {:?}", other),
        }
    }

    #[test]
    fn test_sink_write_refused() {
        let mut transport = MockTransport::new();
        transport.expect_submit_rdma_write()
            .times(1)
            .returning(|_, _, _, _| Err(TransportError::new("queue full")));
        transport.expect_submit_send().never();

        let pool = Arc::new(SendBufferPool::new(1024, 8, 1));
        let conn = Connection::new(Arc::new(SdpConfig::default()), params(10), Arc::new(transport), pool.clone()).unwrap();
        conn.on_sink_available(Advertisement::new(0x8000, 77, 4000)).unwrap();

        assert_eq!(conn.send(&[1u8; 100], false, false), Err(SendError::InvalidArgument));

        let snapshot = conn.snapshot();
        assert_eq!(snapshot.posted_work, 0);
        assert_eq!(snapshot.bytes_queued, 0);
        assert_eq!(snapshot.bytes_unposted, 0);
        let active = snapshot.active_advertisement.unwrap();
        assert_eq!(active.remaining, 4000);
        assert_eq!(active.posted, 0);
        assert_eq!(active.addr, 0x8000);
        assert_eq!(snapshot.pending_advertisements, 1);
        assert_eq!(pool.num_in_use(), 0);
    }

    #[test]
    fn test_unreported_sink_write_aborts() {
        let mut pool = MockBufferPool::new();
        pool.expect_buffer_size().return_const(1024usize);
        let mut handed_out = false;
        pool.expect_acquire().returning(move || {
            if handed_out {
                None
            }
            else {
                handed_out = true;
                Some(SendBuffer::new(1024, 0x1000, 1))
            }
        });
        pool.expect_release().returning(|_| ());

        let transport = RecordingTransport::new();
        let conn = Connection::new(Arc::new(SdpConfig::default()), params(10), transport.clone(), Arc::new(pool)).unwrap();
        conn.on_sink_available(Advertisement::new(0x8000, 77, 50)).unwrap();

        // the write goes out, but there is no buffer left to report it to the peer
        assert_eq!(conn.send(&[5u8; 60], false, false), Err(SendError::NoDevice));

        let submissions = transport.submissions();
        assert_eq!(submissions.len(), 1);
        assert!(matches!(submissions[0], Submission::RdmaWrite { .. }));

        let snapshot = conn.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert_eq!(snapshot.disconnect, DisconnectState::Aborted);
        assert_eq!(snapshot.sink_writes, 1);
        assert_eq!(snapshot.posted_work, 1);
        assert_eq!(snapshot.bytes_queued, 60);
        assert_eq!(snapshot.pending_advertisements, 0);
        assert_eq!(conn.stats().rdma_writes, 1);
    }

    #[test]
    fn test_refused_post_is_rolled_back_and_aborts() {
        let mut seq = Sequence::new();
        let mut transport = MockTransport::new();
        transport.expect_submit_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(TransportError::new("broken")));
        // the abort notification goes out with the credit that was given back
        transport.expect_submit_send()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|buffer, _, flags| buffer.message_id() == MessageId::Abort && flags.contains(WorkRequestFlags::SOLICIT))
            .returning(|_, _, _| Ok(()));

        let pool = Arc::new(SendBufferPool::new(1024, 8, 1));
        let conn = Connection::new(Arc::new(SdpConfig::default()), params(10), Arc::new(transport), pool.clone()).unwrap();

        let result = conn.send(b"hello", false, false);

        assert!(matches!(result, Err(SendError::Io(_))));
        let snapshot = conn.snapshot();
        assert_eq!(snapshot.remote_credits, 9);
        assert_eq!(snapshot.send_seq, 1);
        assert_eq!(snapshot.bytes_queued, 0);
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert_eq!(pool.num_in_use(), 1);
    }

    #[test]
    fn test_partial_buffer_held_while_in_flight() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);

        conn.send(b"first", false, false).unwrap();
        conn.send(b"second", false, false).unwrap();
        conn.send(b"third", false, false).unwrap();

        assert_eq!(transport.submissions().len(), 1);
        let snapshot = conn.snapshot();
        assert_eq!(snapshot.data_queued, 1);
        assert_eq!(snapshot.bytes_unposted, 11);

        conn.on_send_completion(transport.submissions()[0].wr_id());

        let submissions = transport.submissions();
        assert_eq!(submissions.len(), 2);
        match &submissions[1] {
            Submission::Send { payload, .. } => assert_eq!(payload, b"secondthird"),
            other => panic!("unexpected submission {:?}", other),
        }
    }

    #[test]
    fn test_post_window_ramps_up() {
        let config = SdpConfig {
            nodelay: true,
            post_window_initial: 2,
            post_window_ramp: 2,
            max_outstanding_work: 4,
            ..SdpConfig::default()
        };
        let (conn, transport, _pool) = recording_connection(config, 100);

        for i in 0..6u8 {
            conn.send(&[i], false, false).unwrap();
        }
        // every second held post widens the window by one
        assert_eq!(transport.submissions().len(), 4);
        assert_eq!(conn.snapshot().posted_work, 4);

        conn.send(b"x", false, false).unwrap();
        for _ in 0..10 {
            conn.flush();
        }
        assert_eq!(transport.submissions().len(), 4);
        assert_eq!(conn.snapshot().data_queued, 1);
    }

    #[test]
    fn test_unsignaled_batching() {
        let config = SdpConfig { unsignaled_batch: 2, ..SdpConfig::default() };
        let (conn, transport, _pool) = recording_connection(config, 100);

        for _ in 0..4 {
            conn.send_gratuitous_ack().unwrap();
        }

        let signaled = transport.submissions().iter()
            .map(|s| match s {
                Submission::Send { flags, .. } => flags.contains(WorkRequestFlags::SIGNALED),
                other => panic!("unexpected submission {:?}", other),
            })
            .collect::<Vec<_>>();
        assert_eq!(signaled, vec![false, false, true, false]);
    }

    #[test]
    fn test_unsignaled_post_does_not_hold_back_data() {
        let config = SdpConfig { unsignaled_batch: 2, ..SdpConfig::default() };
        let (conn, transport, _pool) = recording_connection(config, 10);

        conn.send_gratuitous_ack().unwrap();
        conn.send(b"hi", false, false).unwrap();

        let submissions = transport.submissions();
        assert_eq!(submissions.len(), 2);
        match &submissions[0] {
            Submission::Send { header, flags, .. } => {
                assert_eq!(header.mid, MessageId::Data);
                assert!(!flags.contains(WorkRequestFlags::SIGNALED));
            }
            other => panic!("unexpected submission {:?}", other),
        }
        match &submissions[1] {
            Submission::Send { header, payload, .. } => {
                assert_eq!(header.mid, MessageId::Data);
                assert_eq!(payload, b"hi");
            }
            other => panic!("unexpected submission {:?}", other),
        }
        assert_eq!(conn.snapshot().data_queued, 0);
    }

    #[test]
    fn test_inline_threshold() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        conn.send(&[0u8; 48], false, false).unwrap();
        match &transport.submissions()[0] {
            Submission::Send { flags, num_segments, .. } => {
                assert!(flags.contains(WorkRequestFlags::INLINE));
                assert_eq!(*num_segments, 1);
            }
            other => panic!("unexpected submission {:?}", other),
        }

        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        conn.send(&[0u8; 49], false, false).unwrap();
        match &transport.submissions()[0] {
            Submission::Send { flags, .. } => assert!(!flags.contains(WorkRequestFlags::INLINE)),
            other => panic!("unexpected submission {:?}", other),
        }
    }

    #[test]
    fn test_backlog_requests_pipelined_mode() {
        let config = SdpConfig { send_backlog: 2, ..SdpConfig::default() };
        let (conn, transport, _pool) = recording_connection(config, 3);
        let room = 1024 - SendBuffer::HEADER_LEN;

        conn.send(b"a", false, false).unwrap();
        conn.send(&vec![1u8; 2 * room], false, false).unwrap();

        let snapshot = conn.snapshot();
        assert_eq!(snapshot.data_queued, 2);
        assert_eq!(snapshot.send_mode, TransferMode::Pipelined);
        assert_eq!(transport.submissions().last().unwrap().control_message(), Some(ControlMessage::ModeChange(ModeChange::PipeRecv)));
    }
}
