use std::sync::Arc;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tracing::{debug, error, span, trace, warn, Level};
use uuid::Uuid;
use crate::advertisement::{Advertisement, AdvertisementTable};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::send_buffer::SendBuffer;
use crate::config::{ConnectionParams, SdpConfig};
use crate::control_messages::ControlMessage;
use crate::credit::CreditLedger;
use crate::disconnect::Watchdog;
use crate::error::SendError;
use crate::mode::{ModeChange, ModeController, TransferMode};
use crate::send_path::Admission;
use crate::send_queue::SendQueue;
use crate::stats::SendStats;
use crate::transport::{Transport, WorkRequestId};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Established,
    /// the peer sent its disconnect, we may still send
    PeerDisconnected,
    /// our disconnect is on its way, waiting for the handshake to complete
    TimeWait,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn can_send_data(&self) -> bool {
        matches!(self, ConnectionState::Established | ConnectionState::PeerDisconnected)
    }

    pub fn can_send_control(&self) -> bool {
        matches!(self, ConnectionState::Established | ConnectionState::PeerDisconnected | ConnectionState::TimeWait)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisconnectState {
    Open,
    /// requested while data was still queued, sent once the data queue drains
    Pending,
    Sent,
    Aborted,
}

/// Tracking of the single urgent byte per connection
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct OobState {
    /// unposted bytes up to and including the most recent urgent byte
    pub pending_offset: Option<usize>,
    /// the next post should announce the urgent byte as pending
    pub send_pending: bool,
}

/// A consistent view of a connection's send side, for diagnostics and tests
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub disconnect: DisconnectState,
    pub send_mode: TransferMode,
    pub recv_mode: TransferMode,
    pub remote_credits: i32,
    pub local_advertised: u32,
    pub send_seq: u32,
    pub data_queued: usize,
    pub control_queued: usize,
    pub posted: usize,
    pub sink_writes: usize,
    pub posted_work: usize,
    pub bytes_queued: usize,
    pub bytes_unposted: usize,
    pub active_advertisement: Option<Advertisement>,
    /// sink advertisements received from the peer and not retired yet
    pub pending_advertisements: u32,
    pub watchdog_armed: bool,
    pub writer_waiting: bool,
}

pub(crate) struct ConnectionInner {
    pub(crate) config: Arc<SdpConfig>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pool: Arc<dyn BufferPool>,
    /// negotiated maximum message size including the header
    pub(crate) send_buffer_size: usize,

    pub(crate) state: ConnectionState,
    pub(crate) disconnect: DisconnectState,
    pub(crate) shutdown_send: bool,
    pub(crate) source_cancel: bool,

    pub(crate) credits: CreditLedger,
    pub(crate) modes: ModeController,
    pub(crate) adverts: AdvertisementTable,

    pub(crate) data_queue: SendQueue,
    pub(crate) ctrl_queue: SendQueue,
    pub(crate) posted: SendQueue,

    /// work requests handed to the transport and not completed yet, sends and RDMA writes
    pub(crate) posted_work: usize,
    /// signaled sends not completed yet; only these guarantee a later completion
    pub(crate) signaled_in_flight: usize,
    pub(crate) post_window: usize,
    pub(crate) post_window_holds: usize,
    pub(crate) next_wr_id: WorkRequestId,
    pub(crate) unsignaled_run: usize,

    pub(crate) oob: OobState,
    /// application bytes accepted and not completed by the transport
    pub(crate) bytes_queued: usize,
    /// application bytes accepted and not handed to the transport
    pub(crate) bytes_unposted: usize,

    pub(crate) write_full: bool,
    pub(crate) wake_writers: bool,
    pub(crate) interrupt_generation: u64,

    pub(crate) watchdog: Watchdog,
    pub(crate) stats: SendStats,
}

impl ConnectionInner {
    pub(crate) fn write_space(&self, urgent: bool) -> usize {
        let headroom = if urgent { self.send_buffer_size } else { 0 };
        (self.config.send_queue_limit + headroom).saturating_sub(self.bytes_queued)
    }

    /// returns a buffer the transport is done with to the pool
    pub(crate) fn release_buffer(&mut self, buffer: SendBuffer) {
        if buffer.is_data() {
            self.bytes_queued -= buffer.data_size();
        }
        self.pool.release(buffer);
    }

    /// returns a buffer that never reached the transport to the pool
    pub(crate) fn discard_unposted(&mut self, buffer: SendBuffer) {
        if buffer.is_data() {
            self.bytes_unposted -= buffer.data_size();
        }
        self.release_buffer(buffer);
    }

    pub(crate) fn on_send_completion(&mut self, wr_id: WorkRequestId) {
        let mut completed = self.posted.take_completed(wr_id);
        if completed.is_empty() {
            completed = self.adverts.take_completed_writes(wr_id);
        }
        else {
            self.signaled_in_flight = self.signaled_in_flight.saturating_sub(1);
        }
        if completed.is_empty() {
            warn!("completion for unknown work request {}", wr_id);
            return;
        }

        trace!("work request {} completed, releasing {} buffer(s)", wr_id, completed.len());
        for buffer in completed {
            self.posted_work -= 1;
            self.release_buffer(buffer);
        }
        self.flush_or_abort();
    }

    pub(crate) fn flush_or_abort(&mut self) {
        if let Err(e) = self.flush() {
            if e.is_fatal() {
                self.abort(&e.to_string());
            }
            else {
                debug!("flush stopped: {}", e);
            }
        }
    }

    /// Forcibly terminates the connection: the peer is notified on a best effort basis, queued
    ///  buffers are dropped and blocked writers are woken up. Buffers already handed to the
    ///  transport are released through their completions.
    pub(crate) fn abort(&mut self, reason: &str) {
        if self.disconnect == DisconnectState::Aborted {
            return;
        }
        error!("aborting connection: {}", reason);

        if self.state.can_send_control() {
            match self.build_control(&ControlMessage::Abort) {
                Ok(buffer) => match self.admit_control(buffer) {
                    Admission::Posted => {}
                    Admission::Buffered(buffer, _) | Admission::Failed { buffer: Some(buffer), .. } => self.pool.release(buffer),
                    Admission::Failed { buffer: None, .. } => {}
                },
                Err(e) => debug!("could not notify peer of abort: {}", e),
            }
        }

        self.state = ConnectionState::Error;
        self.disconnect = DisconnectState::Aborted;
        self.shutdown_send = true;
        self.watchdog.disarm();

        let queued = self.data_queue.drain()
            .chain(self.ctrl_queue.drain())
            .collect::<Vec<_>>();
        for buffer in queued {
            self.discard_unposted(buffer);
        }
        self.adverts.clear_pending();
        self.oob = OobState::default();
        self.wake_writers = true;
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            disconnect: self.disconnect,
            send_mode: self.modes.send_mode(),
            recv_mode: self.modes.recv_mode(),
            remote_credits: self.credits.remote_credits(),
            local_advertised: self.credits.local_advertised(),
            send_seq: self.credits.send_seq(),
            data_queued: self.data_queue.len(),
            control_queued: self.ctrl_queue.len(),
            posted: self.posted.len(),
            sink_writes: self.adverts.num_sink_writes(),
            posted_work: self.posted_work,
            bytes_queued: self.bytes_queued,
            bytes_unposted: self.bytes_unposted,
            active_advertisement: self.adverts.peek_active_advertisement().cloned(),
            pending_advertisements: self.adverts.received(),
            watchdog_armed: self.watchdog.is_armed(),
            writer_waiting: self.write_full,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) id: Uuid,
    pub(crate) inner: Mutex<ConnectionInner>,
    pub(crate) write_space: Condvar,
    pub(crate) runtime: Option<Handle>,
}

/// The send side of one connection. This is a cheap handle that can be cloned and used from
///  several threads: ingest calls, transport completion callbacks and the disconnect watchdog
///  all serialize on the connection's lock.
///
/// If the connection is created inside a tokio runtime, the disconnect watchdog runs as a task
///  on that runtime. Otherwise the owner must call [Connection::on_watchdog_tick] every
///  [crate::config::cleanup_wait] while it returns `true`.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl Connection {
    pub fn new(config: Arc<SdpConfig>, params: ConnectionParams, transport: Arc<dyn Transport>, pool: Arc<dyn BufferPool>) -> anyhow::Result<Connection> {
        config.validate()?;
        params.validate(pool.buffer_size())?;

        let id = Uuid::new_v4();
        debug!("creating connection {}: {:?}", id, params);

        let inner = ConnectionInner {
            credits: CreditLedger::new(params.initial_remote_credits, params.local_receive_buffers, config.min_remote_credits),
            post_window: config.post_window_initial,
            send_buffer_size: params.send_buffer_size(),
            config,
            transport,
            pool,
            state: ConnectionState::Established,
            disconnect: DisconnectState::Open,
            shutdown_send: false,
            source_cancel: false,
            modes: ModeController::new(),
            adverts: AdvertisementTable::new(),
            data_queue: SendQueue::new(),
            ctrl_queue: SendQueue::new(),
            posted: SendQueue::new(),
            posted_work: 0,
            signaled_in_flight: 0,
            post_window_holds: 0,
            next_wr_id: WorkRequestId::ZERO,
            unsignaled_run: 0,
            oob: OobState::default(),
            bytes_queued: 0,
            bytes_unposted: 0,
            write_full: false,
            wake_writers: false,
            interrupt_generation: 0,
            watchdog: Watchdog::new(),
            stats: SendStats::default(),
        };

        Ok(Connection {
            shared: Arc::new(Shared {
                id,
                inner: Mutex::new(inner),
                write_space: Condvar::new(),
                runtime: Handle::try_current().ok(),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Runs `f` on the locked connection, then performs deferred work that must not happen
    ///  while the lock is held
    pub(crate) fn with_inner<R>(&self, op: &'static str, f: impl FnOnce(&mut ConnectionInner) -> R) -> R {
        let span = span!(Level::TRACE, "sdp_connection", op, correlation_id = ?self.shared.id);
        let _entered = span.enter();

        let mut inner = self.shared.inner.lock();
        let result = f(&mut inner);
        self.finish(inner);
        result
    }

    pub(crate) fn finish(&self, mut inner: MutexGuard<'_, ConnectionInner>) {
        let spawn_watchdog = inner.watchdog.take_spawn_request();
        let wake = std::mem::take(&mut inner.wake_writers);
        drop(inner);

        if wake {
            self.shared.write_space.notify_all();
        }
        if spawn_watchdog {
            self.spawn_watchdog();
        }
    }

    /// Called by the transport when a signaled work request completed. All buffers posted
    ///  before it on the same path are released as well.
    pub fn on_send_completion(&self, wr_id: WorkRequestId) {
        self.with_inner("send_completion", |inner| inner.on_send_completion(wr_id))
    }

    /// The receive side processed a header from the peer: `remote_credits` receive buffers are
    ///  available for us, and `peer_seq` is the last sequence number the peer sent.
    pub fn on_credit_update(&self, remote_credits: i32, peer_seq: u32) {
        self.with_inner("credit_update", |inner| {
            inner.credits.update_remote(remote_credits, peer_seq);
            inner.flush_or_abort();
        })
    }

    /// The peer published a sink buffer. Zero sized advertisements are a protocol violation.
    pub fn on_sink_available(&self, advertisement: Advertisement) -> Result<(), SendError> {
        self.with_inner("sink_available", |inner| {
            if advertisement.remaining == 0 {
                let error = SendError::Protocol("zero sized sink advertisement".to_string());
                inner.abort(&error.to_string());
                return Err(error);
            }
            inner.adverts.push(advertisement);
            inner.flush_or_abort();
            Ok(())
        })
    }

    pub fn set_local_receive_buffers(&self, local_receive_buffers: u32) {
        self.with_inner("local_receive_buffers", |inner| inner.credits.set_local_recv_buffers(local_receive_buffers))
    }

    /// The receive side applied a mode change requested by the peer
    pub fn set_recv_mode(&self, mode: TransferMode) {
        self.with_inner("recv_mode", |inner| inner.modes.set_recv_mode(mode))
    }

    pub fn clear_source_cancel(&self) {
        self.with_inner("clear_source_cancel", |inner| {
            inner.source_cancel = false;
            inner.flush_or_abort();
        })
    }

    /// Sends a control message, or queues it behind control messages that are waiting for
    ///  credits. Protocol and transport failures abort the connection.
    pub fn send_control(&self, msg: ControlMessage) -> Result<(), SendError> {
        self.with_inner("send_control", |inner| {
            let result = inner.send_control_message(msg);
            if let Err(e) = &result {
                if e.is_fatal() {
                    inner.abort(&e.to_string());
                }
            }
            result
        })
    }

    /// an ack without payload, unless the ack can piggy-back on queued messages
    pub fn send_gratuitous_ack(&self) -> Result<(), SendError> {
        self.send_control(ControlMessage::Ack)
    }

    pub fn request_mode_change(&self, change: ModeChange) -> Result<(), SendError> {
        self.send_control(ControlMessage::ModeChange(change))
    }

    pub fn abort(&self) {
        self.with_inner("abort", |inner| inner.abort("abort requested by application"))
    }

    pub fn flush(&self) {
        self.with_inner("flush", |inner| inner.flush_or_abort())
    }

    /// wakes all writers blocked waiting for write space, making them return `Interrupted`
    pub fn interrupt_blocked_senders(&self) {
        self.with_inner("interrupt", |inner| {
            inner.interrupt_generation += 1;
            inner.wake_writers = true;
        })
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.inner.lock().snapshot()
    }

    pub fn stats(&self) -> SendStats {
        self.shared.inner.lock().stats.clone()
    }
}
