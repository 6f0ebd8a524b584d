//! Ingestion loop: the receive and send activities sharing one socket.
//!
//! Both activities run on a single-threaded tokio runtime owned by a
//! dedicated OS thread. The receive activity slices every datagram into
//! packets and offers them to the handoff queue; the send activity drains
//! the outbound queue onto the wire. Either activity ending stops the other.

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::handoff::{HandoffSender, Offer};
use super::transport::{DatagramTransport, TransportLayer, UdpTransport};
use crate::error::{DecodeError, Result, SdkError};
use crate::packet::{Command, decode_generic, split};
use crate::stats::{DeviceEvent, PipelineStats};

/// Item on the outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Already encoded packet(s)
    Bytes(Vec<u8>),
    /// Encoded by the send activity with the given header time
    Command { command: Command, time: u32 },
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

pub fn outbound_queue() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// Result of slicing one datagram onto the handoff queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestOutcome {
    /// Packets accepted by the queue
    pub accepted: usize,
    pub dropped: usize,
    /// Decode failure that ended the datagram early
    pub error: Option<DecodeError>,
    /// The dispatcher side of the queue is gone
    pub closed: bool,
}

/// Split `datagram`, copy each packet out and offer it to the handoff queue.
///
/// Packets preceding a corrupt tail are still delivered.
pub fn ingest_datagram(
    datagram: &[u8],
    handoff: &mut HandoffSender,
    stats: &PipelineStats,
) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();
    for slice in split(datagram) {
        let packet = match slice.and_then(decode_generic) {
            Ok(generic) => generic.into_owned(),
            Err(e) => {
                PipelineStats::incr(&stats.decode_errors);
                outcome.error = Some(e);
                break;
            }
        };
        PipelineStats::incr(&stats.packets_received);
        match handoff.offer(packet) {
            Offer::Accepted => outcome.accepted += 1,
            Offer::Dropped => outcome.dropped += 1,
            Offer::Closed => {
                outcome.closed = true;
                break;
            }
        }
    }
    outcome
}

/// Errors the receive path survives.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}

/// The two activities plus the state they own.
pub struct IngestLoop<T: DatagramTransport> {
    pub transport: T,
    pub handoff: HandoffSender,
    pub outbound: OutboundReceiver,
    pub stats: Arc<PipelineStats>,
    pub events: broadcast::Sender<DeviceEvent>,
    pub max_datagram_size: usize,
    pub cancel: CancellationToken,
}

impl<T: DatagramTransport> IngestLoop<T> {
    /// Run until cancelled, the outbound queue closes, or the socket fails.
    ///
    /// Returns `Err` only for a fatal socket error.
    pub async fn run(self) -> Result<()> {
        let IngestLoop {
            transport,
            mut handoff,
            mut outbound,
            stats,
            events,
            max_datagram_size,
            cancel,
        } = self;

        info!(local = ?transport.local_addr().ok(), "Ingestion loop started");
        let result = tokio::select! {
            r = receive_activity(
                &transport,
                &mut handoff,
                &stats,
                &events,
                max_datagram_size,
                &cancel,
            ) => r,
            r = send_activity(&transport, &mut outbound, &stats, &cancel) => r,
        };

        let snapshot = stats.snapshot();
        match &result {
            Ok(()) => info!(
                datagrams = snapshot.datagrams,
                packets = snapshot.packets_received,
                dropped = snapshot.dropped,
                sent = snapshot.packets_sent,
                "Ingestion loop stopped"
            ),
            Err(e) => error!(error = %e, datagrams = snapshot.datagrams, "Ingestion loop failed"),
        }
        // Dropping `handoff` on return lets the dispatcher drain and exit
        result
    }
}

async fn receive_activity<T: DatagramTransport>(
    transport: &T,
    handoff: &mut HandoffSender,
    stats: &PipelineStats,
    events: &broadcast::Sender<DeviceEvent>,
    max_datagram_size: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Receive activity cancelled");
                return Ok(());
            }
            r = transport.recv(&mut buf) => r,
        };

        let len = match received {
            Ok(len) => len,
            Err(e) if is_transient(&e) => {
                warn!(error = %e, "Transient receive error");
                continue;
            }
            Err(e) => return Err(SdkError::socket("recv", e)),
        };

        PipelineStats::incr(&stats.datagrams);
        let outcome = ingest_datagram(&buf[..len], handoff, stats);
        trace!(len, accepted = outcome.accepted, dropped = outcome.dropped, "Datagram ingested");

        if let Some(e) = outcome.error {
            warn!(error = %e, len, "Discarding corrupt datagram tail");
            let _ = events
                .send(DeviceEvent::DecodeFailure { packet_type: None, reason: e.to_string() });
        }
        if outcome.closed {
            debug!("Handoff queue closed, receive activity stopping");
            return Ok(());
        }

        // Let the send activity and cancellation run between datagrams
        tokio::task::yield_now().await;
    }
}

async fn send_activity<T: DatagramTransport>(
    transport: &T,
    outbound: &mut OutboundReceiver,
    stats: &PipelineStats,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Send activity cancelled");
                return Ok(());
            }
            item = outbound.recv() => item,
        };

        let bytes = match item {
            Some(Outbound::Bytes(bytes)) => bytes,
            Some(Outbound::Command { command, time }) => match command.encode(time) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        error = %e,
                        packet_type = command.packet_type(),
                        "Dropping unencodable command"
                    );
                    continue;
                }
            },
            None => {
                debug!("Outbound queue closed, send activity stopping");
                return Ok(());
            }
        };

        match transport.send(&bytes).await {
            Ok(_) => {
                PipelineStats::incr(&stats.packets_sent);
                trace!(len = bytes.len(), "Datagram sent");
            }
            Err(e) if is_transient(&e) => warn!(error = %e, "Transient send error"),
            Err(e) => return Err(SdkError::socket("send", e)),
        }
    }
}

/// Everything the I/O thread needs besides the socket.
pub struct IoThreadConfig {
    pub remote: SocketAddr,
    pub handoff: HandoffSender,
    pub outbound: OutboundReceiver,
    pub stats: Arc<PipelineStats>,
    pub events: broadcast::Sender<DeviceEvent>,
    pub max_datagram_size: usize,
    pub cancel: CancellationToken,
    pub layer: Option<TransportLayer>,
}

impl IoThreadConfig {
    fn into_loop<T: DatagramTransport>(self, transport: T) -> IngestLoop<T> {
        IngestLoop {
            transport,
            handoff: self.handoff,
            outbound: self.outbound,
            stats: self.stats,
            events: self.events,
            max_datagram_size: self.max_datagram_size,
            cancel: self.cancel,
        }
    }
}

/// Spawn the I/O thread around an already bound socket.
///
/// `on_exit` runs on the I/O thread with the loop's result once both
/// activities have stopped.
pub fn spawn_io_thread<F>(
    socket: StdUdpSocket,
    config: IoThreadConfig,
    on_exit: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce(Result<()>) + Send + 'static,
{
    thread::Builder::new().name("cbsdk-io".to_string()).spawn(move || {
        let result = run_io(socket, config);
        on_exit(result);
    })
}

fn run_io(socket: StdUdpSocket, mut config: IoThreadConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SdkError::socket("build io runtime", e))?;

    runtime.block_on(async move {
        let transport = UdpTransport::from_std(socket, config.remote)?;
        match config.layer.take() {
            Some(layer) => config.into_loop(layer(transport)).run().await,
            None => config.into_loop(transport).run().await,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::handoff::handoff;
    use crate::packet::{OwnedPacket, PacketHeader};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted transport: yields queued datagrams, then waits forever.
    struct ScriptedTransport {
        inbound: Mutex<VecDeque<io::Result<Vec<u8>>>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedTransport {
        fn new(inbound: Vec<io::Result<Vec<u8>>>) -> Self {
            Self { inbound: Mutex::new(inbound.into()), sent: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl DatagramTransport for Arc<ScriptedTransport> {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let next = self.inbound.lock().pop_front();
            match next {
                Some(Ok(datagram)) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok(datagram.len())
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }

        async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
            self.sent.lock().push(datagram.to_vec());
            Ok(datagram.len())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    fn ingest_loop(
        transport: Arc<ScriptedTransport>,
        capacity: usize,
    ) -> (
        IngestLoop<Arc<ScriptedTransport>>,
        crossbeam_channel::Receiver<OwnedPacket>,
        OutboundSender,
        Arc<PipelineStats>,
    ) {
        let stats = Arc::new(PipelineStats::new());
        let (handoff_tx, handoff_rx) = handoff(capacity, stats.clone());
        let (out_tx, out_rx) = outbound_queue();
        let (events, _) = broadcast::channel(16);
        let ingest = IngestLoop {
            transport,
            handoff: handoff_tx,
            outbound: out_rx,
            stats: stats.clone(),
            events,
            max_datagram_size: 65_535,
            cancel: CancellationToken::new(),
        };
        (ingest, handoff_rx, out_tx, stats)
    }

    fn datagram(times: &[u32]) -> Vec<u8> {
        times.iter().flat_map(|&t| OwnedPacket::new(t, 5, 0, &[0xAA; 6]).to_bytes()).collect()
    }

    #[test]
    fn ingest_keeps_packets_before_corrupt_tail() {
        let stats = PipelineStats::new();
        let (mut tx, rx) = handoff(16, Arc::new(PipelineStats::new()));
        let mut bytes = datagram(&[1, 2]);
        PacketHeader::new(3, 5, 0, 400).write(&mut bytes);

        let outcome = ingest_datagram(&bytes, &mut tx, &stats);
        assert_eq!(outcome.accepted, 2);
        assert!(matches!(outcome.error, Some(DecodeError::LengthOverrun { .. })));
        assert_eq!(rx.len(), 2);
        assert_eq!(stats.snapshot().decode_errors, 1);
    }

    #[tokio::test]
    async fn wire_order_is_preserved_across_datagrams() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(datagram(&[1, 2, 3])),
            Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            Ok(datagram(&[4])),
            Ok(datagram(&[5, 6])),
        ]));
        let (ingest, rx, _out, stats) = ingest_loop(transport, 64);
        let cancel = ingest.cancel.clone();
        let task = tokio::spawn(ingest.run());

        let mut times = Vec::new();
        while times.len() < 6 {
            match rx.try_recv() {
                Ok(packet) => times.push(packet.header.time),
                Err(_) => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(times, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(stats.snapshot().datagrams, 3);
    }

    #[tokio::test]
    async fn fatal_receive_error_ends_the_loop() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(io::Error::from(
            io::ErrorKind::PermissionDenied,
        ))]));
        let (ingest, rx, _out, _stats) = ingest_loop(transport, 4);

        let err = ingest.run().await.unwrap_err();
        assert!(matches!(err, SdkError::Socket { .. }));
        // Handoff sender was dropped with the loop
        assert!(matches!(rx.recv(), Err(crossbeam_channel::RecvError)));
    }

    #[tokio::test]
    async fn send_activity_encodes_commands() {
        let transport = Arc::new(ScriptedTransport::new(Vec::new()));
        let (ingest, _rx, out, stats) = ingest_loop(transport.clone(), 4);
        let task = tokio::spawn(ingest.run());

        out.send(Outbound::Bytes(vec![1, 2, 3])).unwrap();
        out.send(Outbound::Command { command: Command::RequestConfigAll, time: 7 }).unwrap();
        drop(out);
        task.await.unwrap().unwrap();

        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], vec![1, 2, 3]);
        assert_eq!(sent[1], Command::RequestConfigAll.encode(7).unwrap());
        assert_eq!(stats.snapshot().packets_sent, 2);
    }
}
