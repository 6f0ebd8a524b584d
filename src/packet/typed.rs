//! Typed packet variants and their payload decoders.
//!
//! Configuration decoders have the [`DecoderFn`](super::DecoderFn) signature and
//! are registered in the default [`DecoderTable`](super::DecoderTable). Sample
//! group and event decoding cannot fail and is selected by channel instead.
//! Payload layouts are little-endian and packed; fixed-width strings are NUL
//! padded.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::header::PacketHeader;
use crate::error::DecodeError;
use crate::mirror::RunLevel;

/// Fully decoded packet: the header plus a type-specific body.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedPacket {
    pub header: PacketHeader,
    pub body: PacketBody,
}

impl TypedPacket {
    pub fn new(header: PacketHeader, body: PacketBody) -> Self {
        Self { header, body }
    }

    /// Header type code.
    pub fn packet_type(&self) -> u16 {
        self.header.packet_type
    }
}

/// One variant per known protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Heartbeat,
    ProtocolMonitor(ProtocolMonitor),
    SysInfo(SysInfo),
    /// Echo of a configuration dump request; opens the dump
    ConfigAll,
    ProcInfo(ProcInfo),
    ChannelInfo(ChannelInfo),
    GroupInfo(GroupInfo),
    Log(LogMessage),
    Comment(Comment),
    SampleGroup(SampleGroup),
    Event(ChannelEvent),
    /// Valid header with a type code no decoder is registered for
    Unknown(Arc<[u8]>),
}

impl PacketBody {
    /// Short variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PacketBody::Heartbeat => "heartbeat",
            PacketBody::ProtocolMonitor(_) => "protocol_monitor",
            PacketBody::SysInfo(_) => "sys_info",
            PacketBody::ConfigAll => "config_all",
            PacketBody::ProcInfo(_) => "proc_info",
            PacketBody::ChannelInfo(_) => "channel_info",
            PacketBody::GroupInfo(_) => "group_info",
            PacketBody::Log(_) => "log",
            PacketBody::Comment(_) => "comment",
            PacketBody::SampleGroup(_) => "sample_group",
            PacketBody::Event(_) => "event",
            PacketBody::Unknown(_) => "unknown",
        }
    }
}

/// Bounds-checked little-endian cursor over a payload.
struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    packet_type: u16,
}

impl<'a> PayloadReader<'a> {
    fn new(bytes: &'a [u8], packet_type: u16, expected: usize) -> Result<Self, DecodeError> {
        if bytes.len() < expected {
            return Err(DecodeError::PayloadTooShort {
                packet_type,
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes, pos: 0, packet_type })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(DecodeError::PayloadTooShort {
                packet_type: self.packet_type,
                expected: end,
                actual: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn fixed_str(&mut self, n: usize) -> Result<String, DecodeError> {
        Ok(nul_terminated(self.take(n)?))
    }

    fn hoops(&mut self) -> Result<HoopTable, DecodeError> {
        let mut table = HoopTable::default();
        for hoop in table.iter_mut().flatten() {
            *hoop = Hoop { valid: self.u16()?, time: self.i16()?, min: self.i16()?, max: self.i16()? };
        }
        Ok(table)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        slice
    }
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_fixed_str(out: &mut Vec<u8>, value: &str, n: usize) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(n);
    out.extend_from_slice(&bytes[..len]);
    out.resize(out.len() + (n - len), 0);
}

fn i16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect()
}

/// Periodic link-health report from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMonitor {
    /// Packets sent since the previous monitor packet (inclusive)
    pub sent_packets: u32,
    /// Running count of monitor packets
    pub counter: u32,
}

impl ProtocolMonitor {
    pub const SIZE: usize = 8;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sent_packets.to_le_bytes());
        out.extend_from_slice(&self.counter.to_le_bytes());
    }
}

/// System information: run level, clock and transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysInfo {
    /// System clock frequency in Hz
    pub sysfreq: u32,
    pub spike_len: u32,
    pub spike_pre: u32,
    pub reset_queue: u32,
    pub run_level: RunLevel,
    pub run_flags: u32,
    /// Bitwise-or of transport flags
    pub transport: u16,
}

impl SysInfo {
    pub const SIZE: usize = 28;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sysfreq.to_le_bytes());
        out.extend_from_slice(&self.spike_len.to_le_bytes());
        out.extend_from_slice(&self.spike_pre.to_le_bytes());
        out.extend_from_slice(&self.reset_queue.to_le_bytes());
        out.extend_from_slice(&self.run_level.as_raw().to_le_bytes());
        out.extend_from_slice(&self.run_flags.to_le_bytes());
        out.extend_from_slice(&self.transport.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
    }
}

impl Default for SysInfo {
    fn default() -> Self {
        Self {
            sysfreq: 30_000,
            spike_len: 48,
            spike_pre: 10,
            reset_queue: 0,
            run_level: RunLevel::Startup,
            run_flags: 0,
            transport: 0,
        }
    }
}

/// Signal processor description, sent at the start of a configuration dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcInfo {
    pub proc: u32,
    pub id_code: u32,
    pub ident: String,
    pub chan_base: u32,
    /// Number of channel records the processor will report
    pub chan_count: u32,
    pub bank_count: u32,
    pub group_count: u32,
    pub filt_count: u32,
    pub sort_count: u32,
    pub unit_count: u32,
    pub hoop_count: u32,
    pub sort_method: u32,
    /// Protocol version, major in the high half-word
    pub version: u32,
}

impl ProcInfo {
    pub const SIZE: usize = 112;
    const IDENT_LEN: usize = 64;

    /// `major.minor` protocol version string.
    pub fn protocol_version(&self) -> String {
        format!("{}.{}", self.version >> 16, self.version & 0xFFFF)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.proc.to_le_bytes());
        out.extend_from_slice(&self.id_code.to_le_bytes());
        write_fixed_str(out, &self.ident, Self::IDENT_LEN);
        for value in [
            self.chan_base,
            self.chan_count,
            self.bank_count,
            self.group_count,
            self.filt_count,
            self.sort_count,
            self.unit_count,
            self.hoop_count,
            self.sort_method,
            self.version,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Sorting units per channel.
pub const MAX_UNITS: usize = 5;
/// Hoops per sorting unit.
pub const MAX_HOOPS: usize = 4;

/// Manual sorting window: a waveform belongs to a unit when it passes
/// between `min` and `max` at sample `time` of every valid hoop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hoop {
    pub valid: u16,
    pub time: i16,
    pub min: i16,
    pub max: i16,
}

impl Hoop {
    pub const SIZE: usize = 8;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.valid.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.min.to_le_bytes());
        out.extend_from_slice(&self.max.to_le_bytes());
    }
}

/// Hoops indexed by `[unit][hoop]`, both 0-based.
pub type HoopTable = [[Hoop; MAX_HOOPS]; MAX_UNITS];

/// Per-channel configuration record.
///
/// Scoped replies (label, sampling, spike, ...) carry the full record but
/// only the fields in their scope are meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// 1-based channel id
    pub chan: u32,
    pub chan_caps: u32,
    pub dinp_caps: u32,
    pub aout_caps: u32,
    pub label: String,
    pub ainp_opts: u32,
    pub lnc_rate: u32,
    pub smp_filter: u32,
    pub smp_group: u32,
    pub spk_filter: u32,
    pub spk_opts: u32,
    pub spk_thr_level: i32,
    pub ampl_rej_pos: i16,
    pub ampl_rej_neg: i16,
    pub ref_elec_chan: u32,
    pub spk_hoops: HoopTable,
}

impl ChannelInfo {
    pub const SIZE: usize = 68 + MAX_UNITS * MAX_HOOPS * Hoop::SIZE;
    const LABEL_LEN: usize = 16;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.chan.to_le_bytes());
        out.extend_from_slice(&self.chan_caps.to_le_bytes());
        out.extend_from_slice(&self.dinp_caps.to_le_bytes());
        out.extend_from_slice(&self.aout_caps.to_le_bytes());
        write_fixed_str(out, &self.label, Self::LABEL_LEN);
        for value in [
            self.ainp_opts,
            self.lnc_rate,
            self.smp_filter,
            self.smp_group,
            self.spk_filter,
            self.spk_opts,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.extend_from_slice(&self.spk_thr_level.to_le_bytes());
        out.extend_from_slice(&self.ampl_rej_pos.to_le_bytes());
        out.extend_from_slice(&self.ampl_rej_neg.to_le_bytes());
        out.extend_from_slice(&self.ref_elec_chan.to_le_bytes());
        for hoop in self.spk_hoops.iter().flatten() {
            hoop.write(out);
        }
    }
}

/// Sampling group membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub proc: u32,
    pub group: u32,
    pub label: String,
    /// Sampling period in device clock ticks
    pub period: u32,
    pub channels: Vec<u16>,
}

impl GroupInfo {
    /// Size of the fixed part preceding the channel list
    pub const FIXED_SIZE: usize = 32;
    const LABEL_LEN: usize = 16;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.proc.to_le_bytes());
        out.extend_from_slice(&self.group.to_le_bytes());
        write_fixed_str(out, &self.label, Self::LABEL_LEN);
        out.extend_from_slice(&self.period.to_le_bytes());
        out.extend_from_slice(&(self.channels.len() as u32).to_le_bytes());
        for chan in &self.channels {
            out.extend_from_slice(&chan.to_le_bytes());
        }
    }
}

/// Log line emitted by the device or a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub mode: u16,
    pub name: String,
    pub desc: String,
}

impl LogMessage {
    pub const MIN_SIZE: usize = 18;
    const NAME_LEN: usize = 16;

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mode.to_le_bytes());
        write_fixed_str(out, &self.name, Self::NAME_LEN);
        out.extend_from_slice(self.desc.as_bytes());
    }
}

/// Operator comment stamped with the device time it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// 0 for ANSI, 1 for UTF-16, 255 for NeuroMotive ANSI
    pub charset: u8,
    pub time_started: u64,
    pub rgba: u32,
    pub text: String,
}

impl Comment {
    /// Size of the fixed part preceding the text
    pub const MIN_SIZE: usize = 16;
    /// Longest text the device stores, in bytes
    pub const MAX_LEN: usize = 128;

    /// Text is cut at [`Self::MAX_LEN`] bytes and the payload NUL padded to a
    /// whole number of words.
    pub fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.push(self.charset);
        out.extend_from_slice(&[0; 3]);
        out.extend_from_slice(&self.time_started.to_le_bytes());
        out.extend_from_slice(&self.rgba.to_le_bytes());
        let mut end = self.text.len().min(Self::MAX_LEN);
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        out.extend_from_slice(&self.text.as_bytes()[..end]);
        let written = out.len() - start;
        out.resize(start + written.next_multiple_of(4), 0);
    }
}

/// Continuous samples for every channel of one sampling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleGroup {
    pub group: u16,
    pub samples: Vec<i16>,
}

/// Event from a single channel. The payload layout depends on the channel
/// type, so it is kept raw; front-end channels can be viewed as a [`Spike`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub channel: u16,
    /// Sorted unit id for spikes, event type otherwise
    pub unit: u16,
    pub payload: Arc<[u8]>,
}

impl ChannelEvent {
    /// Decode the payload as a spike waveform.
    pub fn spike(&self) -> Result<Spike, DecodeError> {
        let mut reader = PayloadReader::new(&self.payload, self.unit, Spike::MIN_SIZE)?;
        let pattern = [reader.f32()?, reader.f32()?, reader.f32()?];
        let peak = reader.i16()?;
        let valley = reader.i16()?;
        let waveform = i16_samples(reader.rest());
        Ok(Spike { pattern, peak, valley, waveform })
    }
}

/// Spike waveform view of a front-end channel event.
#[derive(Debug, Clone, PartialEq)]
pub struct Spike {
    pub pattern: [f32; 3],
    pub peak: i16,
    pub valley: i16,
    pub waveform: Vec<i16>,
}

impl Spike {
    pub const MIN_SIZE: usize = 16;
}

// Built-in decoders

pub fn decode_heartbeat(
    _header: &PacketHeader,
    _payload: &[u8],
) -> Result<PacketBody, DecodeError> {
    Ok(PacketBody::Heartbeat)
}

pub fn decode_config_all(
    _header: &PacketHeader,
    _payload: &[u8],
) -> Result<PacketBody, DecodeError> {
    Ok(PacketBody::ConfigAll)
}

pub fn decode_protocol_monitor(
    header: &PacketHeader,
    payload: &[u8],
) -> Result<PacketBody, DecodeError> {
    let mut r = PayloadReader::new(payload, header.packet_type, ProtocolMonitor::SIZE)?;
    Ok(PacketBody::ProtocolMonitor(ProtocolMonitor { sent_packets: r.u32()?, counter: r.u32()? }))
}

pub fn decode_sys_info(header: &PacketHeader, payload: &[u8]) -> Result<PacketBody, DecodeError> {
    let mut r = PayloadReader::new(payload, header.packet_type, SysInfo::SIZE)?;
    Ok(PacketBody::SysInfo(SysInfo {
        sysfreq: r.u32()?,
        spike_len: r.u32()?,
        spike_pre: r.u32()?,
        reset_queue: r.u32()?,
        run_level: RunLevel::from_raw(r.u32()?),
        run_flags: r.u32()?,
        transport: r.u16()?,
    }))
}

pub fn decode_proc_info(header: &PacketHeader, payload: &[u8]) -> Result<PacketBody, DecodeError> {
    let mut r = PayloadReader::new(payload, header.packet_type, ProcInfo::SIZE)?;
    Ok(PacketBody::ProcInfo(ProcInfo {
        proc: r.u32()?,
        id_code: r.u32()?,
        ident: r.fixed_str(ProcInfo::IDENT_LEN)?,
        chan_base: r.u32()?,
        chan_count: r.u32()?,
        bank_count: r.u32()?,
        group_count: r.u32()?,
        filt_count: r.u32()?,
        sort_count: r.u32()?,
        unit_count: r.u32()?,
        hoop_count: r.u32()?,
        sort_method: r.u32()?,
        version: r.u32()?,
    }))
}

pub fn decode_channel_info(
    header: &PacketHeader,
    payload: &[u8],
) -> Result<PacketBody, DecodeError> {
    let mut r = PayloadReader::new(payload, header.packet_type, ChannelInfo::SIZE)?;
    let info = ChannelInfo {
        chan: r.u32()?,
        chan_caps: r.u32()?,
        dinp_caps: r.u32()?,
        aout_caps: r.u32()?,
        label: r.fixed_str(ChannelInfo::LABEL_LEN)?,
        ainp_opts: r.u32()?,
        lnc_rate: r.u32()?,
        smp_filter: r.u32()?,
        smp_group: r.u32()?,
        spk_filter: r.u32()?,
        spk_opts: r.u32()?,
        spk_thr_level: r.i32()?,
        ampl_rej_pos: r.i16()?,
        ampl_rej_neg: r.i16()?,
        ref_elec_chan: r.u32()?,
        spk_hoops: r.hoops()?,
    };
    if info.chan == 0 {
        return Err(DecodeError::InvalidField {
            packet_type: header.packet_type,
            field: "chan",
            details: "channel ids are 1-based".to_string(),
        });
    }
    Ok(PacketBody::ChannelInfo(info))
}

pub fn decode_group_info(
    header: &PacketHeader,
    payload: &[u8],
) -> Result<PacketBody, DecodeError> {
    let mut r = PayloadReader::new(payload, header.packet_type, GroupInfo::FIXED_SIZE)?;
    let proc = r.u32()?;
    let group = r.u32()?;
    let label = r.fixed_str(GroupInfo::LABEL_LEN)?;
    let period = r.u32()?;
    let length = r.u32()? as usize;
    let list = r.take(length * 2)?;
    Ok(PacketBody::GroupInfo(GroupInfo {
        proc,
        group,
        label,
        period,
        channels: list.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect(),
    }))
}

pub fn decode_log(header: &PacketHeader, payload: &[u8]) -> Result<PacketBody, DecodeError> {
    let mut r = PayloadReader::new(payload, header.packet_type, LogMessage::MIN_SIZE)?;
    let mode = r.u16()?;
    let name = r.fixed_str(LogMessage::NAME_LEN)?;
    let desc = nul_terminated(r.rest());
    Ok(PacketBody::Log(LogMessage { mode, name, desc }))
}

pub fn decode_comment(header: &PacketHeader, payload: &[u8]) -> Result<PacketBody, DecodeError> {
    let mut r = PayloadReader::new(payload, header.packet_type, Comment::MIN_SIZE)?;
    let charset = r.u8()?;
    r.take(3)?;
    let time_started = r.u64()?;
    let rgba = r.u32()?;
    let text = nul_terminated(r.rest());
    Ok(PacketBody::Comment(Comment { charset, time_started, rgba, text }))
}

pub fn decode_sample_group(header: &PacketHeader, payload: &[u8]) -> PacketBody {
    PacketBody::SampleGroup(SampleGroup {
        group: header.packet_type,
        samples: i16_samples(payload),
    })
}

pub fn decode_event(header: &PacketHeader, payload: &[u8]) -> PacketBody {
    PacketBody::Event(ChannelEvent {
        channel: header.chid,
        unit: header.packet_type,
        payload: Arc::from(payload),
    })
}
