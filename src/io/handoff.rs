//! Bounded handoff queue between the receive activity and the dispatcher.
//!
//! The receive side never blocks: when the queue is full the newest packet is
//! dropped and counted.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use tracing::{info, warn};

use crate::packet::OwnedPacket;
use crate::stats::PipelineStats;

/// Outcome of [`HandoffSender::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Queue full; the packet was dropped
    Dropped,
    /// Dispatcher gone
    Closed,
}

/// Producer half owned by the receive activity.
#[derive(Debug)]
pub struct HandoffSender {
    tx: Sender<OwnedPacket>,
    stats: Arc<PipelineStats>,
    /// Packets dropped in the current overflow burst
    burst: u64,
}

/// Create a handoff queue holding at most `capacity` packets.
pub fn handoff(
    capacity: usize,
    stats: Arc<PipelineStats>,
) -> (HandoffSender, Receiver<OwnedPacket>) {
    let (tx, rx) = bounded(capacity);
    (HandoffSender { tx, stats, burst: 0 }, rx)
}

impl HandoffSender {
    pub fn offer(&mut self, packet: OwnedPacket) -> Offer {
        match self.tx.try_send(packet) {
            Ok(()) => {
                if self.burst > 0 {
                    info!(dropped = self.burst, "Handoff queue drained, overflow ended");
                    self.burst = 0;
                }
                Offer::Accepted
            }
            Err(TrySendError::Full(packet)) => {
                PipelineStats::incr(&self.stats.dropped);
                if self.burst == 0 {
                    warn!(
                        capacity = ?self.tx.capacity(),
                        packet_type = packet.header.packet_type,
                        "Handoff queue full, dropping newest packets"
                    );
                }
                self.burst += 1;
                Offer::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Offer::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(n: u32) -> OwnedPacket {
        OwnedPacket::new(n, 1, 0, &n.to_le_bytes())
    }

    #[test]
    fn overflow_drops_newest_and_keeps_order() {
        let stats = Arc::new(PipelineStats::new());
        let (mut tx, rx) = handoff(4, stats.clone());

        let outcomes: Vec<_> = (0..7).map(|n| tx.offer(packet(n))).collect();
        assert_eq!(&outcomes[..4], &[Offer::Accepted; 4]);
        assert_eq!(&outcomes[4..], &[Offer::Dropped; 3]);
        assert_eq!(stats.snapshot().dropped, 3);

        let delivered: Vec<u32> = rx.try_iter().map(|p| p.header.time).collect();
        assert_eq!(delivered, vec![0, 1, 2, 3]);

        assert_eq!(tx.offer(packet(9)), Offer::Accepted);
        drop(rx);
        assert_eq!(tx.offer(packet(10)), Offer::Closed);
    }
}
