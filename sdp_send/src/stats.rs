use rustc_hash::FxHashMap;
use crate::control_messages::ControlKind;

/// Informational per-connection counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendStats {
    /// messages posted through the send path, data and control
    pub segments_sent: u64,
    pub rdma_writes: u64,
    pub control_sent: FxHashMap<ControlKind, u64>,
    pub alloc_failures: u64,
    /// payload bytes accepted from the application
    pub bytes_accepted: u64,
    /// data messages posted while no sink advertisement was active
    pub nondiscarded_sends: u64,
}

impl SendStats {
    pub fn control_sent(&self, kind: ControlKind) -> u64 {
        self.control_sent.get(&kind).copied().unwrap_or(0)
    }

    pub(crate) fn on_control_sent(&mut self, kind: ControlKind) {
        *self.control_sent.entry(kind).or_default() += 1;
    }
}
