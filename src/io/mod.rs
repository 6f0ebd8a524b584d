//! Socket I/O: transport seam, handoff queue and the ingestion loop.

pub mod handoff;
pub mod ingest;
pub mod transport;

pub use handoff::{HandoffSender, Offer, handoff};
pub use ingest::{
    IngestLoop, IngestOutcome, IoThreadConfig, Outbound, OutboundReceiver, OutboundSender,
    ingest_datagram, outbound_queue, spawn_io_thread,
};
pub use transport::{DatagramTransport, TransportLayer, UdpTransport};
