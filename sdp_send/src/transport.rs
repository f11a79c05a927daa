use std::fmt::{Display, Formatter};
use bitflags::bitflags;
#[cfg(test)] use mockall::automock;
use crate::buffers::send_buffer::SendBuffer;
use crate::error::TransportError;

/// Identifies a work request handed to the transport. Ids are assigned in posting order per
///  connection, and completions are reported with the id of the completed request.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct WorkRequestId(u64);

impl Display for WorkRequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl WorkRequestId {
    pub const ZERO: WorkRequestId = WorkRequestId(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> WorkRequestId {
        WorkRequestId(self.0.wrapping_add(1))
    }
}

/// One scatter / gather element of a work request: a registered memory range
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

bitflags! {
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct WorkRequestFlags: u8 {
        /// the local transport should report a completion for this request
        const SIGNALED = 0b0000_0001;
        /// the peer should be notified proactively when the message arrives
        const SOLICIT  = 0b0000_0010;
        /// the payload is small enough to be copied into the work request
        const INLINE   = 0b0000_0100;
    }
}

/// This is the abstraction of the reliable, RDMA capable transport below the send engine,
///  introduced to keep the engine independent of the actual verbs implementation and to
///  facilitate mocking it away for testing.
///
/// Completions are delivered asynchronously by the transport through
///  [crate::connection::Connection::on_send_completion], carrying the [WorkRequestId] stored
///  in the buffer at submission time.
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync + 'static {
    fn submit_send(&self, buffer: &SendBuffer, sgl: &[Segment], flags: WorkRequestFlags) -> Result<(), TransportError>;

    fn submit_rdma_write(&self, buffer: &SendBuffer, sgl: &[Segment], remote_addr: u64, remote_key: u32) -> Result<(), TransportError>;
}
