//! In-process mirror of device configuration and run state.
//!
//! The dispatcher is the only writer during a session; API callers read
//! through [`ConfigMirror::snapshot`], which clones under the read lock and so
//! never observes a half-applied packet.
//!
//! A configuration dump is staged as it arrives and only replaces the live
//! channel records once it completes, so readers keep the previous records
//! while a dump is in flight or after one is lost.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::packet::{ChannelInfo, ChannelScope, PacketBody, ProcInfo, SysInfo, TypedPacket, types};

/// Instrument run level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunLevel {
    Startup,
    HardReset,
    Standby,
    Reset,
    Running,
    Stressed,
    Error,
    Shutdown,
    /// Value outside the documented set
    Other(u32),
}

impl RunLevel {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            10 => RunLevel::Startup,
            20 => RunLevel::HardReset,
            30 => RunLevel::Standby,
            40 => RunLevel::Reset,
            50 => RunLevel::Running,
            60 => RunLevel::Stressed,
            70 => RunLevel::Error,
            80 => RunLevel::Shutdown,
            other => RunLevel::Other(other),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            RunLevel::Startup => 10,
            RunLevel::HardReset => 20,
            RunLevel::Standby => 30,
            RunLevel::Reset => 40,
            RunLevel::Running => 50,
            RunLevel::Stressed => 60,
            RunLevel::Error => 70,
            RunLevel::Shutdown => 80,
            RunLevel::Other(raw) => raw,
        }
    }
}

/// Transport flag bits reported in [`SysInfo::transport`].
pub mod transport {
    pub const CHECK: u16 = 0x0000;
    pub const UDP: u16 = 0x0001;
    pub const TCP: u16 = 0x0002;
    pub const LSL: u16 = 0x0004;
    pub const USB: u16 = 0x0008;
    pub const SERIAL: u16 = 0x000F;
    pub const ALL: u16 = 0xFFFF;
}

/// Capability bits used to classify channels.
pub mod caps {
    pub const EXISTS: u32 = 0x0000_0001;
    pub const CONNECTED: u32 = 0x0000_0002;
    pub const ISOLATED: u32 = 0x0000_0004;
    pub const AINP: u32 = 0x0000_0100;
    pub const AOUT: u32 = 0x0000_0200;
    pub const DINP: u32 = 0x0000_0400;
    pub const DOUT: u32 = 0x0000_0800;

    /// Baud-rate bits in the digital input capabilities
    pub const DINP_SERIAL_MASK: u32 = 0x0000_00FF;
    pub const AOUT_AUDIO: u32 = 0x0000_0001;
}

/// Analog input option bits.
pub mod ainp_opts {
    pub const LNC_MASK: u32 = 0x0000_0007;
    pub const REFELEC_MASK: u32 = 0x0000_0030;
    pub const REFELEC_RAWSTREAM: u32 = 0x0000_0040;
    pub const REFELEC_OFFSETCORRECT: u32 = 0x0000_0100;
}

/// Spike option bits.
pub mod spk_opts {
    pub const EXTRACT: u32 = 0x0000_0001;
    pub const THRAUTO: u32 = 0x0000_0400;
    pub const HOOPSORT: u32 = 0x0001_0000;
    /// Every sorting method bit
    pub const ALLSORT: u32 = 0x001F_F000;
}

/// Channel classification used to route event packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    /// Not yet classified, or no class applies
    Any,
    FrontEnd,
    AnalogIn,
    DigitalIn,
    Serial,
    DigitalOut,
    Audio,
}

impl ChannelType {
    /// Classify a channel from a full channel record.
    pub fn classify(info: &ChannelInfo) -> Self {
        let c = info.chan_caps;
        if c & (caps::ISOLATED | caps::AINP) == caps::ISOLATED | caps::AINP {
            ChannelType::FrontEnd
        } else if c & caps::AINP != 0 {
            ChannelType::AnalogIn
        } else if c & caps::DINP != 0 {
            if info.dinp_caps & caps::DINP_SERIAL_MASK != 0 {
                ChannelType::Serial
            } else {
                ChannelType::DigitalIn
            }
        } else if c & caps::DOUT != 0 {
            ChannelType::DigitalOut
        } else if c & caps::AOUT != 0 && info.aout_caps & caps::AOUT_AUDIO != 0 {
            ChannelType::Audio
        } else {
            ChannelType::Any
        }
    }
}

/// Last-known device configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceConfig {
    pub run_level: Option<RunLevel>,
    /// Bitwise-or of [`transport`] flags
    pub transport: u16,
    pub sys_info: Option<SysInfo>,
    pub proc_info: Option<ProcInfo>,
    /// Channel count announced by the processor
    pub proc_chans: u32,
    pub channel_infos: BTreeMap<u32, ChannelInfo>,
    pub channel_types: BTreeMap<u32, ChannelType>,
    /// Group id → member channels
    pub group_infos: BTreeMap<u32, Vec<u16>>,
    /// Header time of the most recently dispatched packet
    pub device_time: u32,
}

impl DeviceConfig {
    pub fn channel_type(&self, chan: u32) -> ChannelType {
        self.channel_types.get(&chan).copied().unwrap_or(ChannelType::Any)
    }

    /// True when every channel the processor announced has been reported.
    pub fn is_complete(&self) -> bool {
        self.proc_chans != 0 && self.channel_infos.len() == self.proc_chans as usize
    }

    /// Channels of the given type, in id order.
    pub fn channels_of(&self, channel_type: ChannelType) -> Vec<u32> {
        self.channel_types
            .iter()
            .filter(|&(_, &t)| t == channel_type)
            .map(|(&chan, _)| chan)
            .collect()
    }

    fn apply_channel(&mut self, scope: ChannelScope, info: &ChannelInfo) {
        if !within(self.proc_chans, info.chan) {
            debug!(chan = info.chan, proc_chans = self.proc_chans, "Channel record out of range");
            return;
        }
        match self.channel_infos.get_mut(&info.chan) {
            Some(entry) if scope != ChannelScope::Full => merge_scoped(entry, scope, info),
            // A scoped reply for an unseen channel still carries a full record
            _ => {
                self.channel_types.insert(info.chan, ChannelType::classify(info));
                self.channel_infos.insert(info.chan, info.clone());
            }
        }
    }

    fn apply_sys_info(&mut self, packet_type: u16, info: &SysInfo) {
        let general = packet_type == types::SYSREP;
        if general || packet_type == types::SYSREPTRANSPORT {
            self.transport = info.transport;
        }
        if general || packet_type == types::SYSREPRUNLEV {
            self.run_level = Some(info.run_level);
        }
        if general || packet_type == types::SYSREPSPKLEN {
            let current = self.sys_info.get_or_insert(*info);
            current.spike_len = info.spike_len;
            current.spike_pre = info.spike_pre;
        }
        if general {
            self.sys_info = Some(*info);
        }
    }
}

/// Channel ids above the announced count are not real channels.
fn within(proc_chans: u32, chan: u32) -> bool {
    proc_chans == 0 || chan <= proc_chans
}

/// Scoped replies only carry meaningful values for their own fields.
fn merge_scoped(entry: &mut ChannelInfo, scope: ChannelScope, info: &ChannelInfo) {
    match scope {
        ChannelScope::Full => *entry = info.clone(),
        ChannelScope::Label => entry.label = info.label.clone(),
        ChannelScope::AnalogInput => {
            entry.ainp_opts = info.ainp_opts;
            entry.lnc_rate = info.lnc_rate;
            entry.ref_elec_chan = info.ref_elec_chan;
        }
        ChannelScope::Sampling => {
            entry.smp_filter = info.smp_filter;
            entry.smp_group = info.smp_group;
        }
        ChannelScope::Spike => {
            entry.spk_opts = info.spk_opts;
            entry.spk_filter = info.spk_filter;
        }
        ChannelScope::RejectAmplitude => {
            entry.spk_opts = info.spk_opts;
            entry.ampl_rej_pos = info.ampl_rej_pos;
            entry.ampl_rej_neg = info.ampl_rej_neg;
        }
        ChannelScope::AutoThreshold => entry.spk_opts = info.spk_opts,
        ChannelScope::SpikeThreshold => entry.spk_thr_level = info.spk_thr_level,
        ChannelScope::Hoops => entry.spk_hoops = info.spk_hoops,
    }
}

/// Outcome of the most recently committed configuration dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DumpSummary {
    /// Increments with every committed dump
    pub sequence: u64,
    pub received: usize,
    pub expected: usize,
}

impl DumpSummary {
    pub fn is_complete(&self) -> bool {
        self.expected != 0 && self.received == self.expected
    }
}

/// Link-health state from the most recent protocol monitor packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorState {
    /// Counter of the last monitor packet, `None` before the first
    pub counter: Option<u32>,
    /// Header time of the last monitor packet
    pub time: u32,
    /// Packets dispatched this session, up to and including the last monitor packet
    pub packets_received: u64,
    /// Host clock when the last monitor packet was dispatched
    pub received_at: Option<SystemTime>,
}

/// Records of a dump in flight.
#[derive(Debug, Default)]
struct StagedDump {
    proc_info: Option<ProcInfo>,
    channel_infos: BTreeMap<u32, ChannelInfo>,
}

impl StagedDump {
    fn expected(&self) -> Option<u32> {
        self.proc_info.as_ref().map(|p| p.chan_count)
    }

    fn is_complete(&self) -> bool {
        self.expected().is_some_and(|n| n != 0 && self.channel_infos.len() == n as usize)
    }
}

#[derive(Debug, Default)]
struct MirrorState {
    config: DeviceConfig,
    dump: Option<StagedDump>,
    last_dump: Option<DumpSummary>,
    dumps: u64,
    monitor: MonitorState,
}

impl MirrorState {
    fn begin_dump(&mut self) {
        if self.dump.is_some() {
            warn!("Configuration dump restarted before the previous one finished");
        }
        self.dump = Some(StagedDump::default());
    }

    fn apply_proc_info(&mut self, info: &ProcInfo) {
        match self.dump.as_mut() {
            Some(dump) => dump.proc_info = Some(info.clone()),
            None => {
                self.config.proc_chans = info.chan_count;
                self.config.proc_info = Some(info.clone());
            }
        }
    }

    fn apply_channel(&mut self, packet_type: u16, info: &ChannelInfo) {
        let scope = ChannelScope::from_reply_type(packet_type).unwrap_or(ChannelScope::Full);
        if let Some(dump) = self.dump.as_mut() {
            if scope == ChannelScope::Full {
                let limit = dump.expected().unwrap_or(self.config.proc_chans);
                if within(limit, info.chan) {
                    dump.channel_infos.insert(info.chan, info.clone());
                }
                if dump.is_complete() {
                    self.commit_dump();
                }
                return;
            }
            // Keep a staged copy current so the commit does not revert the write
            if let Some(staged) = dump.channel_infos.get_mut(&info.chan) {
                merge_scoped(staged, scope, info);
            }
        }
        self.config.apply_channel(scope, info);
    }

    /// Fold the staged dump into the live configuration.
    ///
    /// A complete dump replaces every channel record; a partial one only
    /// overwrites the channels it carried.
    fn commit_dump(&mut self) {
        let Some(dump) = self.dump.take() else {
            return;
        };
        let complete = dump.is_complete();
        let config = &mut self.config;
        if let Some(proc) = dump.proc_info {
            config.proc_chans = proc.chan_count;
            config.proc_info = Some(proc);
        }
        if complete {
            config.channel_infos.clear();
            config.channel_types.clear();
        } else {
            let proc_chans = config.proc_chans;
            config.channel_infos.retain(|&chan, _| within(proc_chans, chan));
            config.channel_types.retain(|&chan, _| within(proc_chans, chan));
        }

        let received = dump.channel_infos.len();
        for (chan, info) in dump.channel_infos {
            config.channel_types.insert(chan, ChannelType::classify(&info));
            config.channel_infos.insert(chan, info);
        }
        self.dumps += 1;
        let summary =
            DumpSummary { sequence: self.dumps, received, expected: config.proc_chans as usize };
        debug!(received, expected = summary.expected, complete, "Configuration dump committed");
        self.last_dump = Some(summary);
    }
}

/// Guarded [`DeviceConfig`] with snapshot reads.
#[derive(Debug, Default)]
pub struct ConfigMirror {
    state: RwLock<MirrorState>,
}

impl ConfigMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent copy of the current configuration.
    pub fn snapshot(&self) -> DeviceConfig {
        self.state.read().config.clone()
    }

    /// Run `f` against the current state under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&DeviceConfig) -> R) -> R {
        f(&self.state.read().config)
    }

    pub fn channel_type(&self, chan: u32) -> ChannelType {
        self.state.read().config.channel_type(chan)
    }

    pub fn device_time(&self) -> u32 {
        self.state.read().config.device_time
    }

    /// Summary of the last committed configuration dump.
    pub fn last_dump(&self) -> Option<DumpSummary> {
        self.state.read().last_dump
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.state.read().monitor
    }

    pub fn record_monitor(&self, monitor: MonitorState) {
        self.state.write().monitor = monitor;
    }

    /// Fold a dispatched packet into the mirror.
    ///
    /// Returns whether the packet was state-relevant.
    pub fn apply(&self, packet: &TypedPacket) -> bool {
        let packet_type = packet.header.packet_type;
        let mut state = self.state.write();
        state.config.device_time = packet.header.time;

        match &packet.body {
            PacketBody::ConfigAll => {
                state.begin_dump();
                debug!("Configuration dump started");
            }
            PacketBody::SysInfo(info) => {
                state.config.apply_sys_info(packet_type, info);
                // The general report closes a dump
                if packet_type == types::SYSREP {
                    state.commit_dump();
                }
                debug!(
                    packet_type,
                    run_level = ?info.run_level,
                    transport = info.transport,
                    "System info applied"
                );
            }
            PacketBody::ProcInfo(info) => {
                state.apply_proc_info(info);
                debug!(
                    chan_count = info.chan_count,
                    version = %info.protocol_version(),
                    "Processor info applied"
                );
            }
            PacketBody::ChannelInfo(info) => state.apply_channel(packet_type, info),
            PacketBody::GroupInfo(info) => {
                state.config.group_infos.insert(info.group, info.channels.clone());
            }
            _ => return false,
        }
        true
    }

    /// Reset to the empty state.
    pub fn clear(&self) {
        *self.state.write() = MirrorState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CONFIGURATION_CHANNEL, GroupInfo, PacketHeader};

    fn config_packet(time: u32, packet_type: u16, body: PacketBody) -> TypedPacket {
        TypedPacket::new(PacketHeader::new(time, CONFIGURATION_CHANNEL, packet_type, 0), body)
    }

    fn front_end(chan: u32) -> ChannelInfo {
        ChannelInfo {
            chan,
            chan_caps: caps::EXISTS | caps::CONNECTED | caps::ISOLATED | caps::AINP,
            label: format!("chan{}", chan),
            smp_group: 5,
            ..Default::default()
        }
    }

    #[test]
    fn run_level_raw_values() {
        for raw in [10, 20, 30, 40, 50, 60, 70, 80, 99] {
            assert_eq!(RunLevel::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(RunLevel::from_raw(50), RunLevel::Running);
        assert_eq!(RunLevel::from_raw(99), RunLevel::Other(99));
    }

    #[test]
    fn channel_classification() {
        assert_eq!(ChannelType::classify(&front_end(1)), ChannelType::FrontEnd);

        let analog = ChannelInfo { chan_caps: caps::AINP, ..Default::default() };
        assert_eq!(ChannelType::classify(&analog), ChannelType::AnalogIn);

        let serial = ChannelInfo { chan_caps: caps::DINP, dinp_caps: 0x20, ..Default::default() };
        assert_eq!(ChannelType::classify(&serial), ChannelType::Serial);

        let digital = ChannelInfo { chan_caps: caps::DINP, dinp_caps: 0x100, ..Default::default() };
        assert_eq!(ChannelType::classify(&digital), ChannelType::DigitalIn);

        let audio = ChannelInfo { chan_caps: caps::AOUT, aout_caps: 1, ..Default::default() };
        assert_eq!(ChannelType::classify(&audio), ChannelType::Audio);

        let plain_aout = ChannelInfo { chan_caps: caps::AOUT, ..Default::default() };
        assert_eq!(ChannelType::classify(&plain_aout), ChannelType::Any);
    }

    #[test]
    fn sys_info_scope_follows_reply_type() {
        let mirror = ConfigMirror::new();
        let info = SysInfo { run_level: RunLevel::Standby, transport: 0x3, ..Default::default() };

        mirror.apply(&config_packet(1, types::SYSREPRUNLEV, PacketBody::SysInfo(info)));
        let snapshot = mirror.snapshot();
        assert_eq!(snapshot.run_level, Some(RunLevel::Standby));
        assert_eq!(snapshot.transport, 0);

        mirror.apply(&config_packet(2, types::SYSREP, PacketBody::SysInfo(info)));
        let snapshot = mirror.snapshot();
        assert_eq!(snapshot.transport, 0x3);
        assert_eq!(snapshot.sys_info, Some(info));
        assert_eq!(snapshot.device_time, 2);
    }

    #[test]
    fn scoped_channel_reply_only_touches_its_fields() {
        let mirror = ConfigMirror::new();
        mirror.apply(&config_packet(1, types::CHANREP, PacketBody::ChannelInfo(front_end(4))));

        // Sampling reply with garbage outside its scope
        let scoped =
            ChannelInfo { chan: 4, smp_group: 2, label: "junk".into(), ..Default::default() };
        mirror.apply(&config_packet(2, types::CHANREPSMP, PacketBody::ChannelInfo(scoped)));

        let snapshot = mirror.snapshot();
        let entry = &snapshot.channel_infos[&4];
        assert_eq!(entry.smp_group, 2);
        assert_eq!(entry.label, "chan4");
        assert_eq!(snapshot.channel_type(4), ChannelType::FrontEnd);
    }

    fn dump(mirror: &ConfigMirror, chan_count: u32, chans: &[u32], close: bool) {
        let proc = ProcInfo { chan_count, ..Default::default() };
        mirror.apply(&config_packet(1, types::REPCONFIGALL, PacketBody::ConfigAll));
        mirror.apply(&config_packet(1, types::PROCREP, PacketBody::ProcInfo(proc)));
        for &chan in chans {
            let record = PacketBody::ChannelInfo(front_end(chan));
            mirror.apply(&config_packet(1, types::CHANREP, record));
        }
        if close {
            let sys = SysInfo::default();
            mirror.apply(&config_packet(1, types::SYSREP, PacketBody::SysInfo(sys)));
        }
    }

    #[test]
    fn completeness_and_clear() {
        let mirror = ConfigMirror::new();
        let proc = ProcInfo { chan_count: 2, ..Default::default() };
        mirror.apply(&config_packet(1, types::PROCREP, PacketBody::ProcInfo(proc)));
        mirror.apply(&config_packet(1, types::CHANREP, PacketBody::ChannelInfo(front_end(1))));
        assert!(!mirror.snapshot().is_complete());

        mirror.apply(&config_packet(1, types::CHANREP, PacketBody::ChannelInfo(front_end(2))));
        assert!(mirror.snapshot().is_complete());
        assert_eq!(mirror.snapshot().channels_of(ChannelType::FrontEnd), vec![1, 2]);

        mirror.clear();
        assert_eq!(mirror.snapshot(), DeviceConfig::default());
        assert_eq!(mirror.last_dump(), None);
    }

    #[test]
    fn dump_in_flight_keeps_previous_records() {
        let mirror = ConfigMirror::new();
        dump(&mirror, 3, &[1, 2, 3], false);
        let summary = mirror.last_dump().unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.sequence, 1);

        let group = GroupInfo { group: 5, channels: vec![1, 2], ..Default::default() };
        mirror.apply(&config_packet(1, types::GROUPREP, PacketBody::GroupInfo(group)));

        // Second dump stalls after one channel
        dump(&mirror, 3, &[1], false);
        let snapshot = mirror.snapshot();
        assert_eq!(snapshot.channel_infos.len(), 3);
        assert_eq!(snapshot.group_infos[&5], vec![1, 2]);
        assert_eq!(mirror.last_dump().unwrap().sequence, 1);

        // A scoped write during the dump lands live and survives the commit
        let scoped = ChannelInfo { chan: 1, label: "renamed".into(), ..Default::default() };
        mirror.apply(&config_packet(2, types::CHANREPLABEL, PacketBody::ChannelInfo(scoped)));
        assert_eq!(mirror.snapshot().channel_infos[&1].label, "renamed");

        for chan in [2, 3] {
            let record = PacketBody::ChannelInfo(front_end(chan));
            mirror.apply(&config_packet(3, types::CHANREP, record));
        }
        assert_eq!(mirror.last_dump().unwrap().sequence, 2);
        assert_eq!(mirror.snapshot().channel_infos[&1].label, "renamed");
    }

    #[test]
    fn partial_dump_overlays_live_records() {
        let mirror = ConfigMirror::new();
        dump(&mirror, 4, &[1, 2, 3, 4], true);

        // Shrunk processor, one record lost, closed by the system report
        dump(&mirror, 3, &[1, 3], true);
        let summary = mirror.last_dump().unwrap();
        assert_eq!((summary.received, summary.expected), (2, 3));
        assert!(!summary.is_complete());

        let snapshot = mirror.snapshot();
        assert_eq!(snapshot.proc_chans, 3);
        assert_eq!(snapshot.channel_infos.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(snapshot.channel_types.len(), 3);
    }

    #[test]
    fn channels_beyond_processor_count_are_ignored() {
        let mirror = ConfigMirror::new();
        dump(&mirror, 2, &[1, 2, 7], true);
        assert_eq!(mirror.snapshot().channel_infos.len(), 2);

        mirror.apply(&config_packet(2, types::CHANREP, PacketBody::ChannelInfo(front_end(9))));
        let snapshot = mirror.snapshot();
        assert!(!snapshot.channel_infos.contains_key(&9));
        assert_eq!(snapshot.channel_type(9), ChannelType::Any);
    }

    #[test]
    fn snapshots_never_mix_packets() {
        let mirror = std::sync::Arc::new(ConfigMirror::new());
        let writer = {
            let mirror = mirror.clone();
            std::thread::spawn(move || {
                for time in 1..100_000u32 {
                    let info = SysInfo { transport: time as u16, ..Default::default() };
                    mirror.apply(&config_packet(
                        time,
                        types::SYSREPTRANSPORT,
                        PacketBody::SysInfo(info),
                    ));
                }
            })
        };
        while !writer.is_finished() {
            let snap = mirror.snapshot();
            assert_eq!(snap.transport, snap.device_time as u16);
        }
        writer.join().unwrap();
        assert_eq!(mirror.device_time(), 99_999);
    }

    #[test]
    fn non_state_packets_only_advance_time() {
        let mirror = ConfigMirror::new();
        let heartbeat = config_packet(77, types::SYSHEARTBEAT, PacketBody::Heartbeat);
        assert!(!mirror.apply(&heartbeat));
        assert_eq!(mirror.device_time(), 77);
        assert_eq!(mirror.snapshot(), mirror.snapshot());
    }

    #[test]
    fn monitor_state_is_reset_with_the_mirror() {
        let mirror = ConfigMirror::new();
        let monitor = MonitorState {
            counter: Some(4),
            time: 300,
            packets_received: 12,
            received_at: Some(SystemTime::now()),
        };
        mirror.record_monitor(monitor);
        assert_eq!(mirror.monitor_state(), monitor);

        mirror.clear();
        assert_eq!(mirror.monitor_state(), MonitorState::default());
    }
}
