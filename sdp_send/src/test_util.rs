use std::sync::Arc;
use parking_lot::Mutex;
use crate::buffers::buffer_pool::SendBufferPool;
use crate::buffers::send_buffer::SendBuffer;
use crate::config::{ConnectionParams, SdpConfig};
use crate::connection::Connection;
use crate::control_messages::ControlMessage;
use crate::error::TransportError;
use crate::header::Bsdh;
use crate::transport::{Segment, Transport, WorkRequestFlags, WorkRequestId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    Send {
        wr_id: WorkRequestId,
        header: Bsdh,
        payload: Vec<u8>,
        flags: WorkRequestFlags,
        num_segments: usize,
    },
    RdmaWrite {
        wr_id: WorkRequestId,
        payload: Vec<u8>,
        remote_addr: u64,
        remote_key: u32,
    },
}

impl Submission {
    pub fn wr_id(&self) -> WorkRequestId {
        match self {
            Submission::Send { wr_id, .. } => *wr_id,
            Submission::RdmaWrite { wr_id, .. } => *wr_id,
        }
    }

    /// the message parsed back from the wire, if this was a control message
    pub fn control_message(&self) -> Option<ControlMessage> {
        match self {
            Submission::Send { header, payload, .. } => {
                let mut buf: &[u8] = payload;
                ControlMessage::deser(header.mid, &mut buf).ok()
            }
            Submission::RdmaWrite { .. } => None,
        }
    }
}

/// A transport that accepts everything and records what it was given, parsed back from the
///  buffer's wire representation
pub struct RecordingTransport {
    submissions: Mutex<Vec<Submission>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport {
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }
}

impl Transport for RecordingTransport {
    fn submit_send(&self, buffer: &SendBuffer, sgl: &[Segment], flags: WorkRequestFlags) -> Result<(), TransportError> {
        let mut wire = buffer.wire_bytes();
        let header = Bsdh::deser(&mut wire)
            .map_err(|e| TransportError::new(e.to_string()))?;
        assert_eq!(header.size as usize, buffer.wire_len());
        assert_eq!(sgl.iter().map(|s| s.len as usize).sum::<usize>(), buffer.wire_len());

        self.submissions.lock().push(Submission::Send {
            wr_id: buffer.wr_id().expect("work request id is assigned before posting"),
            header,
            payload: wire.to_vec(),
            flags,
            num_segments: sgl.len(),
        });
        Ok(())
    }

    fn submit_rdma_write(&self, buffer: &SendBuffer, sgl: &[Segment], remote_addr: u64, remote_key: u32) -> Result<(), TransportError> {
        assert_eq!(sgl.len(), 1);
        assert_eq!(sgl[0].len as usize, buffer.data_size());

        self.submissions.lock().push(Submission::RdmaWrite {
            wr_id: buffer.wr_id().expect("work request id is assigned before posting"),
            payload: buffer.payload().to_vec(),
            remote_addr,
            remote_key,
        });
        Ok(())
    }
}

pub fn params(initial_remote_credits: i32) -> ConnectionParams {
    ConnectionParams {
        local_buffer_size: 1024,
        peer_buffer_size: 1024,
        initial_remote_credits,
        local_receive_buffers: 8,
    }
}

pub fn recording_connection(config: SdpConfig, initial_remote_credits: i32) -> (Connection, Arc<RecordingTransport>, Arc<SendBufferPool>) {
    let transport = RecordingTransport::new();
    let pool = Arc::new(SendBufferPool::new(1024, 64, 1));
    let conn = Connection::new(Arc::new(config), params(initial_remote_credits), transport.clone(), pool.clone())
        .expect("valid connection parameters");
    (conn, transport, pool)
}
