//! Graceful disconnect and the watchdog that guards it.
//!
//! A disconnect requested while data is still queued is deferred until the data queue drains.
//!  Either way, a watchdog is armed that re-checks the connection every
//!  [crate::config::cleanup_wait]: if a tick finds no change since the previous one (no
//!  progress on the send backlog while pending, no state change while waiting for the
//!  handshake), the connection is aborted.

use tracing::{debug, info, trace, warn};
use crate::config::cleanup_wait;
use crate::connection::{Connection, ConnectionInner, ConnectionState, DisconnectState};
use crate::control_messages::ControlMessage;
use crate::error::SendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchdogSnapshot {
    /// nothing to compare against yet: the next tick only records
    Unset,
    Progress { queued: usize, posted_work: usize },
    State(ConnectionState),
}

#[derive(Debug)]
pub(crate) struct Watchdog {
    armed: bool,
    spawn_requested: bool,
    saved: WatchdogSnapshot,
}

impl Watchdog {
    pub(crate) fn new() -> Watchdog {
        Watchdog {
            armed: false,
            spawn_requested: false,
            saved: WatchdogSnapshot::Unset,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    /// (Re-)arms the watchdog. A timer is started only if none is running, so there is never
    ///  more than one per connection.
    fn arm(&mut self, snapshot: WatchdogSnapshot) {
        self.saved = snapshot;
        if !self.armed {
            self.armed = true;
            self.spawn_requested = true;
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
        self.spawn_requested = false;
        self.saved = WatchdogSnapshot::Unset;
    }

    pub(crate) fn take_spawn_request(&mut self) -> bool {
        std::mem::take(&mut self.spawn_requested)
    }
}

impl ConnectionInner {
    fn watchdog_snapshot(&self) -> WatchdogSnapshot {
        match self.disconnect {
            DisconnectState::Pending => WatchdogSnapshot::Progress {
                queued: self.data_queue.len(),
                posted_work: self.posted_work,
            },
            _ => WatchdogSnapshot::State(self.state),
        }
    }

    pub(crate) fn request_disconnect(&mut self) -> Result<(), SendError> {
        self.shutdown_send = true;

        if self.disconnect != DisconnectState::Open {
            debug!("disconnect already in progress: {:?}", self.disconnect);
            return Ok(());
        }
        if !self.state.can_send_data() {
            return Err(SendError::NotConnected);
        }

        if self.data_queue.is_empty() && self.posted_work < self.config.max_outstanding_work {
            self.send_disconnect()?;
            self.watchdog.arm(WatchdogSnapshot::State(self.state));
        }
        else {
            info!("deferring disconnect until {} queued buffer(s) are sent", self.data_queue.len());
            self.disconnect = DisconnectState::Pending;
            let snapshot = self.watchdog_snapshot();
            self.watchdog.arm(snapshot);
        }
        Ok(())
    }

    fn send_disconnect(&mut self) -> Result<(), SendError> {
        self.send_control(ControlMessage::Disconnect)?;
        info!("disconnect sent");
        self.state = ConnectionState::TimeWait;
        self.disconnect = DisconnectState::Sent;
        Ok(())
    }

    /// the disconnect step of a flush
    pub(crate) fn try_send_disconnect(&mut self) -> Result<(), SendError> {
        if self.disconnect != DisconnectState::Pending
            || !self.data_queue.is_empty()
            || self.posted_work >= self.config.max_outstanding_work
        {
            return Ok(());
        }

        self.send_disconnect()?;
        // a full interval for the handshake, starting now
        self.watchdog.arm(WatchdogSnapshot::Unset);
        Ok(())
    }

    pub(crate) fn on_peer_disconnect(&mut self) {
        match self.state {
            ConnectionState::Established => {
                debug!("peer disconnected, sending is still possible");
                self.state = ConnectionState::PeerDisconnected;
            }
            ConnectionState::TimeWait => self.on_disconnect_complete(),
            other => debug!("peer disconnect in state {:?}", other),
        }
    }

    pub(crate) fn on_disconnect_complete(&mut self) {
        if self.state == ConnectionState::Error {
            return;
        }
        info!("disconnect complete");
        self.state = ConnectionState::Closed;
        self.watchdog.disarm();
        self.wake_writers = true;
    }

    /// Returns `true` if the watchdog should tick again
    pub(crate) fn watchdog_tick(&mut self) -> bool {
        if !self.watchdog.is_armed() {
            return false;
        }

        match self.disconnect {
            DisconnectState::Open | DisconnectState::Aborted => {
                self.watchdog.disarm();
                return false;
            }
            DisconnectState::Sent if self.state == ConnectionState::Closed => {
                self.watchdog.disarm();
                return false;
            }
            _ => {}
        }

        let current = self.watchdog_snapshot();
        if current == self.watchdog.saved {
            warn!("no progress during disconnect for {:?} ({:?})", cleanup_wait(), current);
            self.abort("disconnect timed out");
            return false;
        }

        trace!("disconnect watchdog: {:?}", current);
        self.watchdog.saved = current;
        true
    }
}

impl Connection {
    /// Half-closes the connection: no more application data is accepted, and a disconnect
    ///  message follows the queued data.
    pub fn request_disconnect(&self) -> Result<(), SendError> {
        self.with_inner("disconnect", |inner| {
            let result = inner.request_disconnect();
            if let Err(e) = &result {
                if e.is_fatal() {
                    inner.abort(&e.to_string());
                }
            }
            result
        })
    }

    /// The peer's disconnect message arrived
    pub fn on_peer_disconnect(&self) {
        self.with_inner("peer_disconnect", |inner| inner.on_peer_disconnect())
    }

    /// The transport reports the disconnect handshake as complete
    pub fn on_disconnect_complete(&self) {
        self.with_inner("disconnect_complete", |inner| inner.on_disconnect_complete())
    }

    /// Drives the disconnect watchdog for connections created outside a tokio runtime. Returns
    ///  `true` while the watchdog needs further ticks.
    pub fn on_watchdog_tick(&self) -> bool {
        self.with_inner("watchdog_tick", |inner| inner.watchdog_tick())
    }

    pub(crate) fn spawn_watchdog(&self) {
        let Some(runtime) = &self.shared.runtime else {
            debug!("no tokio runtime: the disconnect watchdog is driven through on_watchdog_tick");
            return;
        };

        let connection = self.clone();
        runtime.spawn(async move {
            loop {
                tokio::time::sleep(cleanup_wait()).await;
                if !connection.on_watchdog_tick() {
                    break;
                }
            }
            trace!("disconnect watchdog finished");
        });
    }
}
