use tracing::{debug, error, trace};
use crate::buffers::send_buffer::{BufferKind, SendBuffer};
use crate::connection::ConnectionInner;
use crate::control_messages::ControlMessage;
use crate::error::SendError;
use crate::mode::{ModeChange, TransferMode};
use crate::send_path::{Admission, BufferReason};

impl ConnectionInner {
    pub(crate) fn build_control(&mut self, msg: &ControlMessage) -> Result<SendBuffer, SendError> {
        let Some(mut buffer) = self.pool.acquire() else {
            self.stats.alloc_failures += 1;
            return Err(SendError::OutOfMemory);
        };

        buffer.reserve_window(self.send_buffer_size);
        buffer.set_kind(BufferKind::Control(msg.kind()), msg.header_flags());
        buffer.flags.solicit = msg.solicit();
        buffer.flags.unsignaled = msg.unsignaled();
        msg.ser_extension(&mut buffer);
        Ok(buffer)
    }

    /// Control messages need a single credit, so they can always get through while data is
    ///  held back by the credit threshold.
    pub(crate) fn admit_control(&mut self, buffer: SendBuffer) -> Admission {
        if !self.state.can_send_control() {
            return Admission::Failed { buffer: Some(buffer), error: SendError::InvalidState };
        }
        if self.posted_work >= self.config.max_outstanding_work {
            return Admission::Buffered(buffer, BufferReason::NoBuffers);
        }
        if !self.credits.has_control_credit() {
            return Admission::Buffered(buffer, BufferReason::NoCredit);
        }
        self.post_buffer(buffer)
    }

    /// Posts a control message right away, or queues it behind control messages that are
    ///  already waiting. Refusals for lack of credits or work request slots are not errors.
    pub(crate) fn send_control(&mut self, msg: ControlMessage) -> Result<(), SendError> {
        let buffer = self.build_control(&msg)?;

        let admission = if self.ctrl_queue.is_empty() {
            self.admit_control(buffer)
        }
        else {
            Admission::Buffered(buffer, BufferReason::Backlog)
        };

        match admission {
            Admission::Posted => {
                debug!("sent {:?}", msg);
                Ok(())
            }
            Admission::Buffered(mut buffer, reason) => {
                debug!("queueing {:?}: {:?}", msg, reason);
                buffer.flags.queued = true;
                self.ctrl_queue.put_tail(buffer);
                Ok(())
            }
            Admission::Failed { buffer, error } => {
                if let Some(buffer) = buffer {
                    self.pool.release(buffer);
                }
                Err(error)
            }
        }
    }

    /// A gratuitous ack is redundant if queued messages will carry the same credit information
    ///  soon anyway.
    pub(crate) fn send_ack(&mut self) -> Result<(), SendError> {
        let data_will_carry_it = !self.data_queue.is_empty() && self.credits.has_spare_credit();
        if data_will_carry_it || !self.ctrl_queue.is_empty() {
            trace!("ack piggy-backs on queued messages");
            return Ok(());
        }
        self.send_control(ControlMessage::Ack)
    }

    pub(crate) fn send_mode_change(&mut self, change: ModeChange) -> Result<(), SendError> {
        self.modes.apply(change)?;
        self.send_control(ControlMessage::ModeChange(change))
    }

    /// Takes the active advertisement out of the table and reports the bytes written into it.
    ///  The peer cannot reuse its sink buffer without that report, so failure is a hard error.
    pub(crate) fn retire_active_advertisement(&mut self) -> Result<(), SendError> {
        let Some(advertisement) = self.adverts.take_active_advertisement() else {
            return Ok(());
        };
        let written = self.adverts.retire_advertisement(advertisement);

        self.send_control(ControlMessage::RdmaWriteComplete(written))
            .map_err(|e| {
                error!("failed to report {} bytes written to sink: {}", written, e);
                SendError::NoDevice
            })
    }

    pub(crate) fn send_control_message(&mut self, msg: ControlMessage) -> Result<(), SendError> {
        match msg {
            ControlMessage::Ack => self.send_ack(),
            ControlMessage::ModeChange(change) => self.send_mode_change(change),
            ControlMessage::SinkAvailable { .. } if self.modes.recv_mode() != TransferMode::Pipelined => {
                Err(SendError::Protocol(format!("sink advertisement in receive mode {:?}", self.modes.recv_mode())))
            }
            ControlMessage::Disconnect => self.request_disconnect(),
            ControlMessage::Abort => {
                self.abort("abort requested");
                Ok(())
            }
            ControlMessage::SourceCancel => {
                // no more data until the application acknowledged the cancellation
                self.source_cancel = true;
                self.send_control(msg)
            }
            _ => self.send_control(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use crate::buffers::buffer_pool::MockBufferPool;
    use crate::config::SdpConfig;
    use crate::connection::{Connection, ConnectionState};
    use crate::control_messages::{ControlKind, ControlMessage};
    use crate::error::SendError;
    use crate::header::HeaderFlags;
    use crate::mode::{ModeChange, TransferMode};
    use crate::test_util::{params, recording_connection, RecordingTransport, Submission};
    use crate::transport::WorkRequestFlags;

    fn control_messages(transport: &RecordingTransport) -> Vec<ControlMessage> {
        transport.submissions().iter()
            .filter_map(|s| s.control_message())
            .collect()
    }

    #[test]
    fn test_mode_change_to_pipelined() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);

        assert_eq!(conn.request_mode_change(ModeChange::PipeRecv), Ok(()));
        let snapshot = conn.snapshot();
        assert_eq!(snapshot.send_mode, TransferMode::Pipelined);
        assert_eq!(snapshot.recv_mode, TransferMode::Combined);
        assert_eq!(control_messages(&transport), vec![ControlMessage::ModeChange(ModeChange::PipeRecv)]);

        let result = conn.request_mode_change(ModeChange::PipeRecv);
        assert!(matches!(result, Err(SendError::Protocol(_))));
        let snapshot = conn.snapshot();
        assert_eq!(snapshot.send_mode, TransferMode::Error);
        assert_eq!(snapshot.recv_mode, TransferMode::Error);
        assert_eq!(snapshot.state, ConnectionState::Error);
    }

    #[test]
    fn test_control_preempts_data_but_keeps_its_own_order() {
        let config = SdpConfig { nodelay: true, ..SdpConfig::default() };
        let (conn, transport, _pool) = recording_connection(config, 0);

        conn.send(b"data", false, false).unwrap();
        conn.send_control(ControlMessage::SendSm).unwrap();
        conn.send_control(ControlMessage::ResizeBufferAck(4096)).unwrap();
        assert!(transport.submissions().is_empty());
        assert_eq!(conn.snapshot().control_queued, 2);

        conn.on_credit_update(10, 0);

        let submissions = transport.submissions();
        assert_eq!(submissions.len(), 3);
        assert_eq!(submissions[0].control_message(), Some(ControlMessage::SendSm));
        assert_eq!(submissions[1].control_message(), Some(ControlMessage::ResizeBufferAck(4096)));
        match &submissions[2] {
            Submission::Send { payload, .. } => assert_eq!(payload, b"data"),
            other => panic!("unexpected submission {:?}", other),
        }
    }

    #[test]
    fn test_control_uses_credits_below_data_threshold() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 1);

        conn.send(b"data", false, false).unwrap();
        conn.send_control(ControlMessage::SinkCancelAck).unwrap();

        assert_eq!(control_messages(&transport), vec![ControlMessage::SinkCancelAck]);
        let snapshot = conn.snapshot();
        assert_eq!(snapshot.remote_credits, 0);
        assert_eq!(snapshot.data_queued, 1);
    }

    #[test]
    fn test_gratuitous_ack() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        conn.send_gratuitous_ack().unwrap();

        match &transport.submissions()[0] {
            Submission::Send { header, payload, flags, .. } => {
                assert!(payload.is_empty());
                assert_eq!(header.flags, HeaderFlags::empty());
                assert!(!flags.contains(WorkRequestFlags::SOLICIT));
            }
            other => panic!("unexpected submission {:?}", other),
        }
        assert_eq!(conn.stats().control_sent(ControlKind::Ack), 1);
    }

    #[test]
    fn test_ack_piggybacks_on_queued_control() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 0);
        conn.send_control(ControlMessage::SendSm).unwrap();

        conn.send_gratuitous_ack().unwrap();

        assert_eq!(conn.snapshot().control_queued, 1);
        conn.on_credit_update(5, 0);
        assert_eq!(control_messages(&transport), vec![ControlMessage::SendSm]);
    }

    #[test]
    fn test_ack_not_skipped_without_spare_credit() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 2);
        conn.send(b"data", false, false).unwrap();
        assert_eq!(conn.snapshot().data_queued, 1);

        conn.send_gratuitous_ack().unwrap();

        assert_eq!(control_messages(&transport), vec![ControlMessage::Ack]);
    }

    #[test]
    fn test_sink_available_requires_pipelined_receive() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        let msg = ControlMessage::SinkAvailable { size: 4096, rkey: 3, addr: 0x4000, non_discard: 2 };

        assert!(matches!(conn.send_control(msg.clone()), Err(SendError::Protocol(_))));
        assert_eq!(control_messages(&transport), vec![ControlMessage::Abort]);

        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        conn.set_recv_mode(TransferMode::Pipelined);
        assert_eq!(conn.send_control(msg.clone()), Ok(()));
        assert_eq!(control_messages(&transport), vec![msg]);
    }

    #[test]
    fn test_rdma_read_complete_requests_pipelining() {
        let (conn, transport, _pool) = recording_connection(SdpConfig::default(), 10);
        conn.send_control(ControlMessage::RdmaReadComplete(100)).unwrap();

        match &transport.submissions()[0] {
            Submission::Send { header, flags, .. } => {
                assert!(header.flags.contains(HeaderFlags::REQ_PIPE));
                assert!(flags.contains(WorkRequestFlags::SOLICIT));
            }
            other => panic!("unexpected submission {:?}", other),
        }
    }

    #[test]
    fn test_source_cancel_blocks_data() {
        let config = SdpConfig { nodelay: true, ..SdpConfig::default() };
        let (conn, transport, _pool) = recording_connection(config, 10);
        conn.send_control(ControlMessage::SourceCancel).unwrap();

        assert_eq!(conn.send(b"data", false, false), Err(SendError::InvalidState));

        conn.clear_source_cancel();
        assert_eq!(conn.send(b"data", false, false), Ok(4));
        assert_eq!(transport.submissions().len(), 2);
    }

    #[test]
    fn test_out_of_buffers() {
        let mut pool = MockBufferPool::new();
        pool.expect_buffer_size().return_const(1024usize);
        pool.expect_acquire().returning(|| None);

        let conn = Connection::new(Arc::new(SdpConfig::default()), params(10), RecordingTransport::new(), Arc::new(pool)).unwrap();

        assert_eq!(conn.send_control(ControlMessage::SendSm), Err(SendError::OutOfMemory));
        assert_eq!(conn.send(b"data", false, false), Err(SendError::OutOfMemory));
        assert_eq!(conn.stats().alloc_failures, 2);
        assert_eq!(conn.snapshot().state, ConnectionState::Established);
    }
}
