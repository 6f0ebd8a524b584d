//! Test utilities: packet builders and a loopback fake instrument.
//!
//! The fake instrument answers the configuration traffic a real one does
//! (run level changes, configuration dumps, channel and transport writes,
//! comments) so device-level behavior can be exercised over a real UDP
//! socket.

#![cfg(any(test, feature = "benchmark"))]

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::mirror::{RunLevel, caps};
use crate::packet::typed::decode_channel_info;
use crate::packet::{
    CONFIGURATION_CHANNEL, ChannelInfo, GROUP_CHANNEL, GroupInfo, LogMessage, OwnedPacket,
    PacketBody, PacketHeader, ProcInfo, ProtocolMonitor, SysInfo, decode_generic, split, types,
};

/// Largest datagram the fake instrument sends
const FAKE_MTU: usize = 1472;

/// Encode one packet.
pub fn packet(time: u32, chid: u16, packet_type: u16, payload: &[u8]) -> Vec<u8> {
    OwnedPacket::new(time, chid, packet_type, payload).to_bytes()
}

pub fn config_packet(time: u32, packet_type: u16, payload: &[u8]) -> Vec<u8> {
    packet(time, CONFIGURATION_CHANNEL, packet_type, payload)
}

pub fn sys_info_packet(time: u32, packet_type: u16, info: &SysInfo) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SysInfo::SIZE);
    info.write(&mut payload);
    config_packet(time, packet_type, &payload)
}

pub fn run_level_packet(time: u32, run_level: RunLevel) -> Vec<u8> {
    sys_info_packet(time, types::SYSREPRUNLEV, &SysInfo { run_level, ..SysInfo::default() })
}

pub fn channel_info_packet(time: u32, packet_type: u16, info: &ChannelInfo) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ChannelInfo::SIZE);
    info.write(&mut payload);
    config_packet(time, packet_type, &payload)
}

pub fn proc_info_packet(time: u32, chan_count: u32) -> Vec<u8> {
    let info = ProcInfo {
        proc: 1,
        ident: "fake instrument".to_string(),
        chan_base: 1,
        chan_count,
        group_count: 6,
        version: (4 << 16) | 1,
        ..ProcInfo::default()
    };
    let mut payload = Vec::with_capacity(ProcInfo::SIZE);
    info.write(&mut payload);
    config_packet(time, types::PROCREP, &payload)
}

pub fn group_info_packet(time: u32, group: u32, channels: Vec<u16>) -> Vec<u8> {
    let info = GroupInfo { proc: 1, group, label: format!("group{}", group), period: 1, channels };
    let mut payload = Vec::new();
    info.write(&mut payload);
    config_packet(time, types::GROUPREP, &payload)
}

pub fn monitor_packet(time: u32, counter: u32, sent_packets: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ProtocolMonitor::SIZE);
    ProtocolMonitor { sent_packets, counter }.write(&mut payload);
    config_packet(time, types::SYSPROTOCOLMONITOR, &payload)
}

pub fn log_packet(time: u32, mode: u16, name: &str, desc: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    LogMessage { mode, name: name.to_string(), desc: desc.to_string() }.write(&mut payload);
    config_packet(time, types::LOGREP, &payload)
}

/// Sample-group packet carrying `samples` for group `group`.
pub fn group_packet(time: u32, group: u16, samples: &[i16]) -> Vec<u8> {
    let payload: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    packet(time, GROUP_CHANNEL, group, &payload)
}

/// Spike event from `chan` with a 48-sample waveform.
pub fn spike_packet(time: u32, chan: u16, unit: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    for value in [0.5f32, -0.25, 0.125] {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    payload.extend_from_slice(&120i16.to_le_bytes());
    payload.extend_from_slice(&(-80i16).to_le_bytes());
    for i in 0..48i16 {
        payload.extend_from_slice(&(i * 3 - 60).to_le_bytes());
    }
    packet(time, chan, unit, &payload)
}

/// Datagram of `packets` sample-group packets with `channels` samples each.
pub fn sample_datagram(first_time: u32, packets: usize, channels: usize) -> Vec<u8> {
    let samples: Vec<i16> = (0..channels as i16).collect();
    (0..packets)
        .flat_map(|i| group_packet(first_time.wrapping_add(i as u32), 5, &samples))
        .collect()
}

/// Front-end channel record as a fresh instrument reports it.
pub fn front_end_channel(chan: u32) -> ChannelInfo {
    ChannelInfo {
        chan,
        chan_caps: caps::EXISTS | caps::CONNECTED | caps::ISOLATED | caps::AINP,
        label: format!("chan{}", chan),
        smp_group: 5,
        spk_thr_level: -65,
        ref_elec_chan: 0,
        ..ChannelInfo::default()
    }
}

/// Pack encoded packets into datagrams no larger than `mtu`.
pub fn pack_datagrams(packets: &[Vec<u8>], mtu: usize) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    let mut current = Vec::new();
    for packet in packets {
        if !current.is_empty() && current.len() + packet.len() > mtu {
            datagrams.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(packet);
    }
    if !current.is_empty() {
        datagrams.push(current);
    }
    datagrams
}

/// Initial state of a [`FakeInstrument`].
#[derive(Debug, Clone)]
pub struct FakeConfig {
    pub run_level: RunLevel,
    /// Channels announced in the processor record
    pub channels: u32,
    /// Channel records left out of every configuration dump
    pub missing_channels: u32,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self { run_level: RunLevel::Running, channels: 4, missing_channels: 0 }
    }
}

#[derive(Debug)]
struct FakeState {
    run_level: RunLevel,
    transport: u16,
    announced: u32,
    missing: u32,
    channels: BTreeMap<u32, ChannelInfo>,
}

#[derive(Debug)]
struct FakeShared {
    socket: UdpSocket,
    stop: AtomicBool,
    silent: AtomicBool,
    ignored: Mutex<HashSet<u16>>,
    clock: AtomicU32,
    client: Mutex<Option<SocketAddr>>,
    state: Mutex<FakeState>,
    received: Mutex<Vec<PacketHeader>>,
}

/// Loopback stand-in for the instrument.
#[derive(Debug)]
pub struct FakeInstrument {
    shared: Arc<FakeShared>,
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl FakeInstrument {
    pub fn spawn(config: FakeConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.set_read_timeout(Some(Duration::from_millis(5)))?;
        let addr = socket.local_addr()?;

        let channels = (1..=config.channels).map(|chan| (chan, front_end_channel(chan))).collect();
        let shared = Arc::new(FakeShared {
            socket,
            stop: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            ignored: Mutex::new(HashSet::new()),
            clock: AtomicU32::new(1),
            client: Mutex::new(None),
            state: Mutex::new(FakeState {
                run_level: config.run_level,
                transport: 0,
                announced: config.channels,
                missing: config.missing_channels,
                channels,
            }),
            received: Mutex::new(Vec::new()),
        });

        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("fake-instrument".to_string())
            .spawn(move || worker.run())?;
        Ok(Self { shared, addr, thread: Some(thread) })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop answering requests.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::Release);
    }

    /// Record but never answer packets of `packet_type`.
    pub fn ignore(&self, packet_type: u16) {
        self.shared.ignored.lock().insert(packet_type);
    }

    pub fn run_level(&self) -> RunLevel {
        self.shared.state.lock().run_level
    }

    pub fn channel(&self, chan: u32) -> Option<ChannelInfo> {
        self.shared.state.lock().channels.get(&chan).cloned()
    }

    /// Headers of every packet received so far, in arrival order.
    pub fn received(&self) -> Vec<PacketHeader> {
        self.shared.received.lock().clone()
    }

    /// Send a raw datagram to the last client that spoke to us.
    pub fn inject(&self, datagram: &[u8]) -> io::Result<()> {
        let client = *self.shared.client.lock();
        let client = client.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        self.shared.socket.send_to(datagram, client)?;
        Ok(())
    }

    /// Current fake clock, advanced once per packet sent.
    pub fn time(&self) -> u32 {
        self.shared.clock.load(Ordering::Acquire)
    }
}

impl Drop for FakeInstrument {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl FakeShared {
    fn run(&self) {
        let mut buf = vec![0u8; 65_535];
        while !self.stop.load(Ordering::Acquire) {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(_) => break,
            };
            *self.client.lock() = Some(from);

            let replies = self.handle_datagram(&buf[..len]);
            if self.silent.load(Ordering::Acquire) {
                continue;
            }
            for datagram in pack_datagrams(&replies, FAKE_MTU) {
                let _ = self.socket.send_to(&datagram, from);
            }
        }
    }

    fn tick(&self) -> u32 {
        self.clock.fetch_add(1, Ordering::AcqRel)
    }

    fn handle_datagram(&self, datagram: &[u8]) -> Vec<Vec<u8>> {
        let mut replies = Vec::new();
        for slice in split(datagram) {
            let Ok(generic) = slice.and_then(decode_generic) else {
                break;
            };
            self.received.lock().push(generic.header);
            if self.ignored.lock().contains(&generic.header.packet_type) {
                continue;
            }
            if generic.header.is_config() {
                self.handle_config(&generic.header, generic.payload, &mut replies);
            }
        }
        replies
    }

    fn handle_config(&self, header: &PacketHeader, payload: &[u8], replies: &mut Vec<Vec<u8>>) {
        let mut state = self.state.lock();
        match header.packet_type {
            types::SYSSETRUNLEV => {
                let requested = payload
                    .get(16..20)
                    .and_then(|b| b.try_into().ok())
                    .map(|b| RunLevel::from_raw(u32::from_le_bytes(b)))
                    .unwrap_or(RunLevel::Running);
                match requested {
                    RunLevel::HardReset => {
                        replies.push(run_level_packet(self.tick(), RunLevel::HardReset));
                        state.run_level = RunLevel::Standby;
                    }
                    RunLevel::Reset => {
                        replies.push(run_level_packet(self.tick(), RunLevel::Reset));
                        state.run_level = RunLevel::Running;
                    }
                    // Running is only reached through a reset
                    RunLevel::Running => {}
                    other => state.run_level = other,
                }
                replies.push(run_level_packet(self.tick(), state.run_level));
            }
            types::SYSSETTRANSPORT => {
                if let Some(b) = payload.get(24..26) {
                    state.transport = u16::from_le_bytes([b[0], b[1]]);
                }
                let info = SysInfo {
                    run_level: state.run_level,
                    transport: state.transport,
                    ..SysInfo::default()
                };
                replies.push(sys_info_packet(self.tick(), types::SYSREPTRANSPORT, &info));
            }
            types::REQCONFIGALL => {
                replies.push(config_packet(self.tick(), types::REPCONFIGALL, &[]));
                replies.push(proc_info_packet(self.tick(), state.announced));
                let reported = state.channels.len().saturating_sub(state.missing as usize);
                for info in state.channels.values().take(reported) {
                    replies.push(channel_info_packet(self.tick(), types::CHANREP, info));
                }
                let members = state.channels.keys().map(|&chan| chan as u16).collect();
                replies.push(group_info_packet(self.tick(), 5, members));
                let info = SysInfo {
                    run_level: state.run_level,
                    transport: state.transport,
                    ..SysInfo::default()
                };
                replies.push(sys_info_packet(self.tick(), types::SYSREP, &info));
            }
            set if (types::CHANSET..=types::CHANSETAUTOTHRESHOLD).contains(&set) => {
                let Ok(PacketBody::ChannelInfo(info)) = decode_channel_info(header, payload) else {
                    return;
                };
                let reply = types::reply_for(set);
                state.channels.insert(info.chan, info.clone());
                replies.push(channel_info_packet(self.tick(), reply, &info));
            }
            types::COMMENTSET => {
                replies.push(config_packet(self.tick(), types::COMMENTREP, payload));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_respect_the_mtu() {
        let packets: Vec<Vec<u8>> = (0..10).map(|t| config_packet(t, 0x10, &[0u8; 290])).collect();
        let datagrams = pack_datagrams(&packets, 1000);
        assert_eq!(datagrams.len(), 4);
        assert!(datagrams.iter().all(|d| d.len() <= 1000));
        assert_eq!(datagrams.iter().map(Vec::len).sum::<usize>(), 3000);
    }

    #[test]
    fn sample_datagram_splits_into_packets() {
        let datagram = sample_datagram(10, 8, 32);
        assert_eq!(split(&datagram).count(), 8);
    }
}
