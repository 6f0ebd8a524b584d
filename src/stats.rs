//! Pipeline counters and device events.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::packet::LogMessage;

/// Lock-free counters shared by the ingestion loop, the dispatcher and the
/// request coordinator.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Datagrams read from the socket
    pub datagrams: AtomicU64,
    /// Packets sliced out of datagrams and offered to the handoff queue
    pub packets_received: AtomicU64,
    /// Packets dropped because the handoff queue was full
    pub dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    pub materialize_errors: AtomicU64,
    pub dispatched: AtomicU64,
    pub callback_errors: AtomicU64,
    /// Replies that arrived after their request timed out
    pub late_replies: AtomicU64,
    pub packets_sent: AtomicU64,
    /// Packets still queued when the dispatcher was stopped
    pub discarded_on_stop: AtomicU64,
    pub monitor_gaps: AtomicU64,
    /// Packets a full subscription stream could not take
    pub subscriber_drops: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            datagrams: load(&self.datagrams),
            packets_received: load(&self.packets_received),
            dropped: load(&self.dropped),
            decode_errors: load(&self.decode_errors),
            materialize_errors: load(&self.materialize_errors),
            dispatched: load(&self.dispatched),
            callback_errors: load(&self.callback_errors),
            late_replies: load(&self.late_replies),
            packets_sent: load(&self.packets_sent),
            discarded_on_stop: load(&self.discarded_on_stop),
            monitor_gaps: load(&self.monitor_gaps),
            subscriber_drops: load(&self.subscriber_drops),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub datagrams: u64,
    pub packets_received: u64,
    pub dropped: u64,
    pub decode_errors: u64,
    pub materialize_errors: u64,
    pub dispatched: u64,
    pub callback_errors: u64,
    pub late_replies: u64,
    pub packets_sent: u64,
    pub discarded_on_stop: u64,
    pub monitor_gaps: u64,
    pub subscriber_drops: u64,
}

/// Diagnostics published on the device's event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A datagram tail or payload could not be decoded
    DecodeFailure { packet_type: Option<u16>, reason: String },
    CallbackFailure { key: String, reason: String },
    /// The socket failed; the device has left the connected state
    SocketFault { reason: String },
    /// Log line forwarded from the instrument
    DeviceLog(LogMessage),
    /// Protocol monitor counter skipped values
    MonitorGap { expected: u32, received: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = PipelineStats::new();
        PipelineStats::incr(&stats.dropped);
        PipelineStats::add(&stats.packets_received, 12);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.packets_received, 12);
        assert_eq!(snapshot.dispatched, 0);
        assert_eq!(snapshot, stats.snapshot());
    }
}
