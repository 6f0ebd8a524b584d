//! Request/reply correlation on top of the asynchronous pipeline.
//!
//! A caller registers a pending request keyed by `(classifier, key)`, sends
//! its command, and blocks on a single-slot channel. The dispatcher resolves
//! every pending request a reply matches; on timeout the caller removes its
//! own entry, so each request is fulfilled or expired exactly once.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SdkError};
use crate::io::{Outbound, OutboundSender};
use crate::packet::{Command, PacketBody, TypedPacket, types};
use crate::stats::PipelineStats;

/// Expired requests remembered for late-reply accounting
const EXPIRED_HISTORY: usize = 64;

/// Which replies can satisfy a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyClassifier {
    /// System or run-level report. A key selects the reported run level.
    RunLevel,
    /// Closing system report of a configuration dump
    ConfigDump,
    /// System or transport report
    Transport,
    /// Channel reply of the given type. A key selects the channel.
    Channel(u16),
    /// Any configuration packet of the given type
    Custom(u16),
}

impl ReplyClassifier {
    /// Whether `packet` satisfies a request registered with `key`.
    pub fn accepts(&self, key: Option<u32>, packet: &TypedPacket) -> bool {
        let header = &packet.header;
        if !header.is_config() {
            return false;
        }
        let packet_type = header.packet_type;
        match (self, &packet.body) {
            (ReplyClassifier::RunLevel, PacketBody::SysInfo(info)) => {
                (packet_type == types::SYSREP || packet_type == types::SYSREPRUNLEV)
                    && key.is_none_or(|level| info.run_level.as_raw() == level)
            }
            (ReplyClassifier::ConfigDump, PacketBody::SysInfo(_)) => packet_type == types::SYSREP,
            (ReplyClassifier::Transport, PacketBody::SysInfo(_)) => {
                packet_type == types::SYSREP || packet_type == types::SYSREPTRANSPORT
            }
            (ReplyClassifier::Channel(reply), PacketBody::ChannelInfo(info)) => {
                packet_type == *reply && key.is_none_or(|chan| info.chan == chan)
            }
            (ReplyClassifier::Custom(expected), _) => packet_type == *expected,
            _ => false,
        }
    }
}

impl fmt::Display for ReplyClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyClassifier::RunLevel => write!(f, "run level report"),
            ReplyClassifier::ConfigDump => write!(f, "configuration dump"),
            ReplyClassifier::Transport => write!(f, "transport report"),
            ReplyClassifier::Channel(reply) => write!(f, "channel reply {:#04x}", reply),
            ReplyClassifier::Custom(reply) => write!(f, "reply {:#04x}", reply),
        }
    }
}

type RequestKey = (ReplyClassifier, Option<u32>);

struct Pending {
    generation: u64,
    slot: Sender<TypedPacket>,
}

#[derive(Default)]
struct Table {
    next_generation: u64,
    pending: HashMap<RequestKey, Pending>,
    expired: VecDeque<RequestKey>,
}

/// Pending-request table shared by API callers and the dispatcher.
pub struct Coordinator {
    table: Mutex<Table>,
    stats: Arc<PipelineStats>,
}

impl Coordinator {
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self { table: Mutex::new(Table::default()), stats }
    }

    /// Encode and enqueue `command`, then block until a matching reply
    /// arrives or `timeout` elapses.
    ///
    /// Fails with a conflict error if a request with the same classifier and
    /// key is already pending.
    pub fn send_and_wait(
        &self,
        outbound: &OutboundSender,
        command: &Command,
        time: u32,
        classifier: ReplyClassifier,
        key: Option<u32>,
        timeout: Duration,
    ) -> Result<TypedPacket> {
        let bytes = command.encode(time)?;
        let (generation, reply) = self.register(classifier, key)?;

        if outbound.send(Outbound::Bytes(bytes)).is_err() {
            self.remove(classifier, key, generation);
            return Err(SdkError::Disconnected);
        }
        debug!(%classifier, ?key, packet_type = command.packet_type(), "Request sent");

        self.wait(reply, classifier, key, generation, timeout)
    }

    fn register(
        &self,
        classifier: ReplyClassifier,
        key: Option<u32>,
    ) -> Result<(u64, Receiver<TypedPacket>)> {
        let mut table = self.table.lock();
        if table.pending.contains_key(&(classifier, key)) {
            return Err(SdkError::Conflict { classifier: classifier.to_string(), key });
        }
        let generation = table.next_generation;
        table.next_generation += 1;

        let (slot, reply) = bounded(1);
        table.pending.insert((classifier, key), Pending { generation, slot });
        Ok((generation, reply))
    }

    fn wait(
        &self,
        reply: Receiver<TypedPacket>,
        classifier: ReplyClassifier,
        key: Option<u32>,
        generation: u64,
        timeout: Duration,
    ) -> Result<TypedPacket> {
        match reply.recv_timeout(timeout) {
            Ok(packet) => Ok(packet),
            Err(RecvTimeoutError::Timeout) => {
                self.remove(classifier, key, generation);
                // The dispatcher may have filled the slot before the entry was removed
                if let Ok(packet) = reply.try_recv() {
                    return Ok(packet);
                }
                let mut table = self.table.lock();
                if table.expired.len() == EXPIRED_HISTORY {
                    table.expired.pop_front();
                }
                table.expired.push_back((classifier, key));
                drop(table);

                warn!(%classifier, ?key, ?timeout, "Request timed out");
                Err(SdkError::timeout(classifier.to_string(), timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SdkError::Disconnected),
        }
    }

    fn remove(&self, classifier: ReplyClassifier, key: Option<u32>, generation: u64) {
        let mut table = self.table.lock();
        if table.pending.get(&(classifier, key)).is_some_and(|p| p.generation == generation) {
            table.pending.remove(&(classifier, key));
        }
    }

    /// Fulfil every pending request `packet` satisfies.
    ///
    /// Returns the number of requests fulfilled.
    pub fn resolve(&self, packet: &TypedPacket) -> usize {
        if !packet.header.is_config() {
            return 0;
        }
        let mut table = self.table.lock();
        if table.pending.is_empty() && table.expired.is_empty() {
            return 0;
        }

        let matched: Vec<RequestKey> = table
            .pending
            .keys()
            .filter(|(classifier, key)| classifier.accepts(*key, packet))
            .copied()
            .collect();

        for request in &matched {
            if let Some(pending) = table.pending.remove(request) {
                // Capacity 1 and a single send per entry: cannot be full
                let _ = pending.slot.try_send(packet.clone());
                debug!(classifier = %request.0, key = ?request.1, "Request fulfilled");
            }
        }

        if matched.is_empty() {
            let late = table.expired.iter().position(|(c, k)| c.accepts(*k, packet));
            if let Some(pos) = late {
                table.expired.remove(pos);
                PipelineStats::incr(&self.stats.late_replies);
                debug!(packet_type = packet.header.packet_type, "Late reply dropped");
            }
        }
        matched.len()
    }

    /// Fail every pending request with a disconnect error.
    pub fn fail_all(&self) {
        let mut table = self.table.lock();
        let count = table.pending.len();
        // Dropping the slots wakes every waiter with a disconnect
        table.pending.clear();
        table.expired.clear();
        if count > 0 {
            debug!(count, "Pending requests failed");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator").field("pending", &self.pending_count()).finish()
    }
}
