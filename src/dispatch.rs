//! Dispatcher worker: handoff queue → mirror, coordinator, callbacks.
//!
//! Runs on its own OS thread so a slow callback can only back up the
//! handoff queue, never the socket read loop.

use crossbeam_channel::{Receiver, select};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::error::SdkError;
use crate::mirror::{ChannelType, ConfigMirror, MonitorState};
use crate::packet::{
    DecoderTable, LogMessage, OwnedPacket, PacketBody, PacketKey, ProtocolMonitor, TypedPacket,
    types,
};
use crate::registry::CallbackRegistry;
use crate::stats::{DeviceEvent, PipelineStats};

/// Repeat warnings for a recurring condition once per this many occurrences
const WARN_EVERY: u64 = 100;

/// Shared components the dispatcher writes to.
#[derive(Clone)]
pub struct DispatchTargets {
    pub decoders: Arc<DecoderTable>,
    pub mirror: Arc<ConfigMirror>,
    pub registry: Arc<CallbackRegistry>,
    pub coordinator: Arc<Coordinator>,
    pub stats: Arc<PipelineStats>,
    pub events: broadcast::Sender<DeviceEvent>,
}

/// Per-session dispatcher state.
pub struct Dispatcher {
    targets: DispatchTargets,
    /// Packets dispatched this session
    dispatched: u64,
    warned_types: HashSet<u16>,
    unhandled: u64,
    newest_group_time: Option<u32>,
    out_of_order_groups: u64,
}

impl Dispatcher {
    pub fn new(targets: DispatchTargets) -> Self {
        Self {
            targets,
            dispatched: 0,
            warned_types: HashSet::new(),
            unhandled: 0,
            newest_group_time: None,
            out_of_order_groups: 0,
        }
    }

    /// Start the worker thread.
    ///
    /// The worker exits when `stop` fires (discarding whatever is still
    /// queued) or when the handoff queue disconnects and is empty.
    pub fn spawn(
        self,
        packets: Receiver<OwnedPacket>,
        stop: Receiver<()>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("cbsdk-dispatch".to_string())
            .spawn(move || self.run(packets, stop))
    }

    fn run(mut self, packets: Receiver<OwnedPacket>, stop: Receiver<()>) {
        info!("Dispatcher started");
        loop {
            select! {
                recv(packets) -> msg => match msg {
                    // A pending stop wins over queued work
                    Ok(_) if !stop.is_empty() => {
                        self.discard(&packets, 1);
                        break;
                    }
                    Ok(packet) => self.dispatch(packet),
                    Err(_) => {
                        debug!("Handoff queue closed and drained");
                        break;
                    }
                },
                recv(stop) -> _ => {
                    self.discard(&packets, 0);
                    break;
                }
            }
        }
        info!(dispatched = self.dispatched, "Dispatcher stopped");
    }

    fn discard(&self, packets: &Receiver<OwnedPacket>, already_taken: u64) {
        let discarded = already_taken + packets.try_iter().count() as u64;
        PipelineStats::add(&self.targets.stats.discarded_on_stop, discarded);
        debug!(discarded, "Dispatcher stop requested");
    }

    /// Process one packet: decode, update the mirror, resolve pending
    /// requests, invoke callbacks, then run built-in handling.
    pub fn dispatch(&mut self, packet: OwnedPacket) {
        let targets = &self.targets;
        let typed = match targets.decoders.materialize(&packet) {
            Ok(typed) => typed,
            Err(e) => {
                PipelineStats::incr(&targets.stats.materialize_errors);
                warn!(
                    packet_type = packet.header.packet_type,
                    chid = packet.header.chid,
                    error = %e,
                    "Skipping undecodable packet"
                );
                let _ = targets.events.send(DeviceEvent::DecodeFailure {
                    packet_type: Some(packet.header.packet_type),
                    reason: e.to_string(),
                });
                return;
            }
        };

        targets.mirror.apply(&typed);
        targets.coordinator.resolve(&typed);

        let channel_type = if typed.header.is_event() {
            targets.mirror.channel_type(u32::from(typed.header.chid))
        } else {
            ChannelType::Any
        };
        let key = PacketKey::for_header(&typed.header, channel_type);
        for failure in targets.registry.invoke(&key, &typed) {
            PipelineStats::incr(&targets.stats.callback_errors);
            if let SdkError::Callback { key, reason } = failure {
                let _ = targets.events.send(DeviceEvent::CallbackFailure { key, reason });
            }
        }

        PipelineStats::incr(&targets.stats.dispatched);
        self.dispatched += 1;
        self.builtins(&typed, &key);
    }

    fn builtins(&mut self, typed: &TypedPacket, key: &PacketKey) {
        match &typed.body {
            PacketBody::Log(log) => self.forward_log(log),
            PacketBody::ProtocolMonitor(monitor) => self.check_monitor(typed.header.time, monitor),
            PacketBody::SampleGroup(_) => self.check_group_order(typed.header.time),
            PacketBody::Comment(comment) => debug!(
                time_started = comment.time_started,
                charset = comment.charset,
                "Comment: {}",
                comment.text
            ),
            PacketBody::ConfigAll if typed.header.dlen > 0 => {
                warn!(dlen = typed.header.dlen, "Configuration dump echo has unexpected payload")
            }
            PacketBody::Unknown(_) => self.note_unhandled(typed.header.packet_type, key),
            _ => {}
        }
    }

    fn forward_log(&self, log: &LogMessage) {
        match log.mode {
            1 | 5 => error!(source = %log.name, mode = log.mode, "{}", log.desc),
            _ => info!(source = %log.name, mode = log.mode, "{}", log.desc),
        }
        let _ = self.targets.events.send(DeviceEvent::DeviceLog(log.clone()));
    }

    fn check_monitor(&mut self, time: u32, monitor: &ProtocolMonitor) {
        let previous = self.targets.mirror.monitor_state();
        if let Some(last) = previous.counter {
            let expected = last.wrapping_add(1);
            if monitor.counter > expected {
                PipelineStats::incr(&self.targets.stats.monitor_gaps);
                warn!(expected, received = monitor.counter, "Missing protocol monitor packets");
                let _ = self
                    .targets
                    .events
                    .send(DeviceEvent::MonitorGap { expected, received: monitor.counter });
            }
        }

        let ticks = time.wrapping_sub(previous.time);
        let delta = self.dispatched.saturating_sub(previous.packets_received);
        let rate = if ticks > 0 { delta as f64 / ticks as f64 } else { 0.0 };
        debug!(
            counter = monitor.counter,
            sent = monitor.sent_packets,
            received = delta,
            rate_per_tick = rate,
            "Protocol monitor"
        );

        self.targets.mirror.record_monitor(MonitorState {
            counter: Some(monitor.counter),
            time,
            packets_received: self.dispatched,
            received_at: Some(SystemTime::now()),
        });
    }

    fn check_group_order(&mut self, time: u32) {
        match self.newest_group_time {
            Some(newest) if time < newest => {
                self.out_of_order_groups += 1;
                if self.out_of_order_groups % WARN_EVERY == 1 {
                    warn!(
                        time,
                        newest,
                        count = self.out_of_order_groups,
                        "Out-of-order sample group packet"
                    );
                }
            }
            _ => self.newest_group_time = Some(time),
        }
    }

    fn note_unhandled(&mut self, packet_type: u16, key: &PacketKey) {
        if !matches!(key, PacketKey::Config(_))
            || types::KNOWN_UNHANDLED.contains(&packet_type)
            || self.targets.registry.has_subscribers(key)
        {
            return;
        }
        self.unhandled += 1;
        if self.warned_types.insert(packet_type) {
            warn!(
                packet_type = %format!("{:#04x}", packet_type),
                "Unhandled configuration packet type"
            );
        } else if self.unhandled % WARN_EVERY == 0 {
            debug!(
                total = self.unhandled,
                types = self.warned_types.len(),
                "Unhandled configuration packets"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{RunLevel, caps};
    use crate::packet::{CONFIGURATION_CHANNEL, ChannelInfo, SysInfo};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn targets() -> (DispatchTargets, broadcast::Receiver<DeviceEvent>) {
        let stats = Arc::new(PipelineStats::new());
        let (events, rx) = broadcast::channel(64);
        let targets = DispatchTargets {
            decoders: Arc::new(DecoderTable::default()),
            mirror: Arc::new(ConfigMirror::new()),
            registry: Arc::new(CallbackRegistry::new()),
            coordinator: Arc::new(Coordinator::new(stats.clone())),
            stats,
            events,
        };
        (targets, rx)
    }

    fn config(time: u32, packet_type: u16, payload: Vec<u8>) -> OwnedPacket {
        OwnedPacket::new(time, CONFIGURATION_CHANNEL, packet_type, &payload)
    }

    fn sys_report(run_level: RunLevel) -> OwnedPacket {
        let mut payload = Vec::new();
        SysInfo { run_level, ..Default::default() }.write(&mut payload);
        config(10, types::SYSREP, payload)
    }

    #[test]
    fn mirror_is_updated_before_callbacks_run() {
        let (targets, _events) = targets();
        let seen = Arc::new(Mutex::new(None));

        let (mirror, s) = (targets.mirror.clone(), seen.clone());
        targets.registry.register(PacketKey::Config(types::SYSREP), move |_| {
            *s.lock() = mirror.snapshot().run_level;
            Ok(())
        });

        let mut dispatcher = Dispatcher::new(targets.clone());
        dispatcher.dispatch(sys_report(RunLevel::Running));
        assert_eq!(*seen.lock(), Some(RunLevel::Running));
        assert_eq!(targets.stats.snapshot().dispatched, 1);
    }

    #[test]
    fn events_route_by_channel_type() {
        let (targets, _events) = targets();
        let info = ChannelInfo {
            chan: 9,
            chan_caps: caps::ISOLATED | caps::AINP,
            label: "fe9".into(),
            ..Default::default()
        };
        let mut payload = Vec::new();
        info.write(&mut payload);

        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = hits.clone();
        targets.registry.register(PacketKey::Event(ChannelType::FrontEnd), move |p| {
            h.lock().push(p.header.chid);
            Ok(())
        });

        let mut dispatcher = Dispatcher::new(targets);
        // Before classification the event routes to `Any`
        dispatcher.dispatch(OwnedPacket::new(1, 9, 0, &[0; 16]));
        dispatcher.dispatch(config(2, types::CHANREP, payload));
        dispatcher.dispatch(OwnedPacket::new(3, 9, 0, &[0; 16]));
        assert_eq!(*hits.lock(), vec![9]);
    }

    #[test]
    fn failures_are_reported_not_propagated() {
        let (targets, mut events) = targets();
        targets.registry.register(PacketKey::Config(types::SYSREP), |_| anyhow::bail!("nope"));

        let mut dispatcher = Dispatcher::new(targets.clone());
        dispatcher.dispatch(sys_report(RunLevel::Running));
        dispatcher.dispatch(config(11, types::SYSREP, vec![1, 2, 3]));

        let stats = targets.stats.snapshot();
        assert_eq!(stats.callback_errors, 1);
        assert_eq!(stats.materialize_errors, 1);
        assert_eq!(stats.dispatched, 1);

        assert!(matches!(events.try_recv(), Ok(DeviceEvent::CallbackFailure { .. })));
        assert!(matches!(
            events.try_recv(),
            Ok(DeviceEvent::DecodeFailure { packet_type: Some(types::SYSREP), .. })
        ));
    }

    #[test]
    fn monitor_gap_is_counted() {
        let (targets, mut events) = targets();
        let mut dispatcher = Dispatcher::new(targets.clone());

        for (time, counter) in [(100, 1), (200, 2), (300, 5)] {
            let mut payload = Vec::new();
            ProtocolMonitor { sent_packets: 10, counter }.write(&mut payload);
            dispatcher.dispatch(config(time, types::SYSPROTOCOLMONITOR, payload));
        }

        assert_eq!(targets.stats.snapshot().monitor_gaps, 1);
        let gap = events.try_recv().unwrap();
        assert_eq!(gap, DeviceEvent::MonitorGap { expected: 3, received: 5 });

        let state = targets.mirror.monitor_state();
        assert_eq!((state.counter, state.time, state.packets_received), (Some(5), 300, 3));
        assert!(state.received_at.is_some());
    }

    #[test]
    fn device_log_is_published() {
        let (targets, mut events) = targets();
        let log = LogMessage { mode: 5, name: "nsp".into(), desc: "clock drift".into() };
        let mut payload = Vec::new();
        log.write(&mut payload);

        Dispatcher::new(targets).dispatch(config(1, types::LOGREP, payload));
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::DeviceLog(log));
    }

    #[test]
    fn stop_discards_queued_packets() {
        let (targets, _events) = targets();
        let stats = targets.stats.clone();
        let (tx, rx) = crossbeam_channel::bounded(16);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);

        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let g = gate.clone();
        targets.registry.register(PacketKey::Config(types::SYSREP), move |_| {
            drop(g.lock());
            Ok(())
        });

        let handle = Dispatcher::new(targets).spawn(rx, stop_rx).unwrap();
        for _ in 0..5 {
            tx.send(sys_report(RunLevel::Running)).unwrap();
        }
        // First packet is stuck in the callback; request a stop behind it
        while tx.len() > 4 {
            thread::sleep(Duration::from_millis(1));
        }
        stop_tx.send(()).unwrap();
        drop(held);
        handle.join().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dispatched, 1);
        assert_eq!(snapshot.discarded_on_stop, 4);
    }
}
