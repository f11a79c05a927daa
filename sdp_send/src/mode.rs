use tracing::{debug, warn};
use crate::error::SendError;

/// Negotiated transfer strategy for one direction of a connection
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferMode {
    Buffered,
    Combined,
    Pipelined,
    /// terminal: an illegal transition was requested
    Error,
}

/// Mode change requests as carried in the mode change message. Bit 3 distinguishes the
///  direction, the lower bits encode the target mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ModeChange {
    /// source to sink: our send mode Combined -> Buffered
    BuffRecv = 0x0,
    /// sink to source: our receive mode Buffered -> Combined
    CombSend = 0x9,
    /// source to sink: our send mode Combined -> Pipelined
    PipeRecv = 0x2,
    /// source to sink: our send mode Pipelined -> Combined
    CombRecv = 0x1,
}

impl TryFrom<u8> for ModeChange {
    type Error = SendError;

    fn try_from(value: u8) -> Result<ModeChange, SendError> {
        match value {
            0x0 => Ok(ModeChange::BuffRecv),
            0x9 => Ok(ModeChange::CombSend),
            0x2 => Ok(ModeChange::PipeRecv),
            0x1 => Ok(ModeChange::CombRecv),
            _ => Err(SendError::Protocol(format!("unknown mode change {:#x}", value))),
        }
    }
}

#[derive(Debug)]
pub struct ModeController {
    send_mode: TransferMode,
    recv_mode: TransferMode,
}

impl ModeController {
    pub fn new() -> ModeController {
        ModeController {
            send_mode: TransferMode::Combined,
            recv_mode: TransferMode::Combined,
        }
    }

    pub fn send_mode(&self) -> TransferMode {
        self.send_mode
    }

    pub fn recv_mode(&self) -> TransferMode {
        self.recv_mode
    }

    pub fn set_recv_mode(&mut self, mode: TransferMode) {
        self.recv_mode = mode;
    }

    /// Validates a requested transition against the current modes and executes it. A request
    ///  that does not start from the required mode moves both directions to `Error`.
    pub fn apply(&mut self, change: ModeChange) -> Result<(), SendError> {
        let (from, to, is_send) = match change {
            ModeChange::BuffRecv => (TransferMode::Combined, TransferMode::Buffered, true),
            ModeChange::CombSend => (TransferMode::Buffered, TransferMode::Combined, false),
            ModeChange::PipeRecv => (TransferMode::Combined, TransferMode::Pipelined, true),
            ModeChange::CombRecv => (TransferMode::Pipelined, TransferMode::Combined, true),
        };

        let current = if is_send { self.send_mode } else { self.recv_mode };
        if current != from {
            warn!("illegal mode change {:?} from send mode {:?} / receive mode {:?}", change, self.send_mode, self.recv_mode);
            self.send_mode = TransferMode::Error;
            self.recv_mode = TransferMode::Error;
            return Err(SendError::Protocol(format!("illegal mode change {:?} from {:?}", change, current)));
        }

        debug!("mode change {:?}: {:?} -> {:?}", change, from, to);
        if is_send {
            self.send_mode = to;
        }
        else {
            self.recv_mode = to;
        }
        Ok(())
    }
}
