use std::sync::OnceLock;
use std::time::Duration;
use anyhow::{anyhow, bail};
use crate::buffers::send_buffer::SendBuffer;
use crate::control_messages::ControlMessage;

pub const DEFAULT_CLEANUP_WAIT: Duration = Duration::from_millis(500);

static CLEANUP_WAIT: OnceLock<Duration> = OnceLock::new();

/// Sets the disconnect watchdog interval for the whole process. This can be done once, before
///  the first connection starts disconnecting; later calls fail.
pub fn init_cleanup_wait(wait: Duration) -> anyhow::Result<()> {
    if wait.is_zero() {
        bail!("cleanup wait must be positive");
    }
    CLEANUP_WAIT.set(wait)
        .map_err(|_| anyhow!("cleanup wait was already initialized"))
}

pub fn cleanup_wait() -> Duration {
    CLEANUP_WAIT.get()
        .copied()
        .unwrap_or(DEFAULT_CLEANUP_WAIT)
}

pub struct SdpConfig {
    /// Data messages are posted only while the peer has at least this many receive buffers
    ///  available for us. The remainder is reserved for control messages, so a connection
    ///  can always send acks, mode changes and completions.
    pub min_remote_credits: i32,

    /// This is the upper bound for the number of work requests (sends and RDMA writes) that
    ///  may be outstanding at the transport at the same time, i.e. the size of the send
    ///  completion queue
    pub max_outstanding_work: usize,

    /// Slow start: while work is in flight, data posts are held once this many work requests
    ///  are outstanding. The window grows by one for every `post_window_ramp` held posts, up to
    ///  `max_outstanding_work`. This gives the peer time to advertise sink buffers before the
    ///  whole backlog goes out through the buffered path.
    pub post_window_initial: usize,
    pub post_window_ramp: usize,

    /// Messages with at most this many bytes (including the header) are posted inline
    pub inline_max: usize,

    /// Number of bytes an application may have queued or in flight before writes block
    pub send_queue_limit: usize,

    /// If the data queue grows to this many buffers in combined mode, the connection asks
    ///  to switch to pipelined mode
    pub send_backlog: usize,

    /// An urgent byte is announced as 'pending' only while it is at most this many bytes away
    pub oob_pending_limit: usize,

    /// If `false`, a partially filled buffer is held back while other work is in flight so
    ///  that subsequent writes can be combined into it
    pub nodelay: bool,

    /// If non-zero, up to this many consecutive buffers that do not need a completion are
    ///  posted unsignaled before a signaled post is forced
    pub unsignaled_batch: usize,
}

impl Default for SdpConfig {
    fn default() -> Self {
        SdpConfig {
            min_remote_credits: 3,
            max_outstanding_work: 64,
            post_window_initial: 16,
            post_window_ramp: 4,
            inline_max: 64,
            send_queue_limit: 64 * 1024,
            send_backlog: 8,
            oob_pending_limit: 0xFFFF,
            nodelay: false,
            unsignaled_batch: 0,
        }
    }
}

impl SdpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_remote_credits < 1 {
            bail!("at least one remote credit must be required for data messages");
        }
        if self.max_outstanding_work == 0 {
            bail!("outstanding work limit must be positive");
        }
        if self.post_window_initial == 0 || self.post_window_initial > self.max_outstanding_work {
            bail!("initial post window must be between 1 and the outstanding work limit");
        }
        if self.post_window_ramp == 0 {
            bail!("post window ramp must be positive");
        }
        if self.send_queue_limit == 0 {
            bail!("send queue limit must be positive");
        }
        if self.send_backlog == 0 {
            bail!("send backlog must be positive");
        }

        Ok(())
    }
}

/// Values negotiated for one connection during connection setup
#[derive(Clone, Debug)]
pub struct ConnectionParams {
    pub local_buffer_size: usize,
    /// size of the peer's receive buffers, i.e. the maximum message size it accepts
    pub peer_buffer_size: usize,
    pub initial_remote_credits: i32,
    /// receive buffers we have posted for the peer
    pub local_receive_buffers: u32,
}

impl ConnectionParams {
    /// maximum size of a message including its header
    pub fn send_buffer_size(&self) -> usize {
        self.local_buffer_size.min(self.peer_buffer_size)
    }

    pub fn validate(&self, pool_buffer_size: usize) -> anyhow::Result<()> {
        if self.local_buffer_size > pool_buffer_size {
            bail!("local buffer size {} exceeds the pool's buffer size {}", self.local_buffer_size, pool_buffer_size);
        }
        if self.send_buffer_size() < SendBuffer::HEADER_LEN + ControlMessage::MAX_EXTENSION_LEN {
            bail!("buffer size {} has no room for control messages", self.send_buffer_size());
        }
        if self.initial_remote_credits < 0 {
            bail!("negative initial remote credits");
        }
        Ok(())
    }
}
