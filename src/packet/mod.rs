//! Packet codec: header parsing, datagram slicing, typed decoding and
//! command encoding.
//!
//! # Wire Layout
//!
//! Every packet is a fixed 10-byte little-endian header followed by a
//! variable-length payload:
//!
//! ```text
//! ┌───────────┬──────────┬──────────┬──────────────┬────────────────┐
//! │ time (u32)│ chid(u16)│ type(u16)│ dlen (u16)   │ payload (dlen) │
//! └───────────┴──────────┴──────────┴──────────────┴────────────────┘
//! ```
//!
//! One UDP datagram may carry many packets back to back. [`split`] walks a
//! datagram, [`decode_generic`] reads the header of one slice, and
//! [`materialize`] turns an owned generic packet into a [`TypedPacket`].

pub mod codec;
pub mod command;
pub mod header;
pub mod typed;

pub use codec::{
    DecoderFn, DecoderTable, GenericPacket, OwnedPacket, Slices, decode_generic, materialize,
    split,
};
pub use command::{ChannelScope, Command};
pub use header::{HEADER_SIZE, PacketHeader};
pub use typed::{
    ChannelEvent, ChannelInfo, Comment, GroupInfo, Hoop, HoopTable, LogMessage, MAX_HOOPS,
    MAX_UNITS, PacketBody, ProcInfo, ProtocolMonitor, SampleGroup, Spike, SysInfo, TypedPacket,
};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::mirror::ChannelType;

/// Channel id carried by sample-group packets.
pub const GROUP_CHANNEL: u16 = 0x0000;

/// Bit set in the channel id of every configuration packet.
pub const CONFIGURATION_CHANNEL: u16 = 0x8000;

/// Configuration packet type codes.
///
/// Reply ("REP") codes have the high bit clear; the matching "SET" code is
/// the reply code with `0x80` set.
pub mod types {
    pub const SYSHEARTBEAT: u16 = 0x00;
    pub const SYSPROTOCOLMONITOR: u16 = 0x01;
    pub const REPCONFIGALL: u16 = 0x08;
    pub const REQCONFIGALL: u16 = 0x88;
    pub const SYSREP: u16 = 0x10;
    pub const SYSSET: u16 = 0x90;
    pub const SYSREPSPKLEN: u16 = 0x11;
    pub const SYSREPRUNLEV: u16 = 0x12;
    pub const SYSSETRUNLEV: u16 = 0x92;
    pub const SYSREPTRANSPORT: u16 = 0x13;
    pub const SYSSETTRANSPORT: u16 = 0x93;
    pub const PROCREP: u16 = 0x21;
    pub const BANKREP: u16 = 0x22;
    pub const FILTREP: u16 = 0x23;
    pub const ADAPTFILTREP: u16 = 0x25;
    pub const REFELECFILTREP: u16 = 0x26;
    pub const REPNTRODEINFO: u16 = 0x27;
    pub const LNCREP: u16 = 0x28;
    pub const GROUPREP: u16 = 0x30;
    pub const COMMENTREP: u16 = 0x31;
    pub const COMMENTSET: u16 = 0xB1;
    pub const CHANREP: u16 = 0x40;
    pub const CHANSET: u16 = 0xC0;
    pub const CHANREPLABEL: u16 = 0x41;
    pub const CHANSETLABEL: u16 = 0xC1;
    pub const CHANREPAINP: u16 = 0x47;
    pub const CHANSETAINP: u16 = 0xC7;
    pub const CHANREPSMP: u16 = 0x48;
    pub const CHANSETSMP: u16 = 0xC8;
    pub const CHANREPSPK: u16 = 0x49;
    pub const CHANSETSPK: u16 = 0xC9;
    pub const CHANREPSPKTHR: u16 = 0x4A;
    pub const CHANSETSPKTHR: u16 = 0xCA;
    pub const CHANREPSPKHPS: u16 = 0x4B;
    pub const CHANSETSPKHPS: u16 = 0xCB;
    pub const CHANREPREJECTAMPLITUDE: u16 = 0x4E;
    pub const CHANSETREJECTAMPLITUDE: u16 = 0xCE;
    pub const CHANREPAUTOTHRESHOLD: u16 = 0x4F;
    pub const CHANSETAUTOTHRESHOLD: u16 = 0xCF;
    pub const SS_MODELREP: u16 = 0x51;
    pub const SS_DETECTREP: u16 = 0x52;
    pub const SS_ARTIF_REJECTREP: u16 = 0x53;
    pub const SS_NOISE_BOUNDARYREP: u16 = 0x54;
    pub const SS_STATISTICSREP: u16 = 0x55;
    pub const SS_STATUSREP: u16 = 0x57;
    pub const NPLAYREP: u16 = 0x5C;
    pub const REPFILECFG: u16 = 0x61;
    pub const LOGREP: u16 = 0x63;

    /// Reply code the instrument answers a SET packet with.
    pub const fn reply_for(set_type: u16) -> u16 {
        set_type & !0x80
    }

    /// Types the device emits routinely that have no built-in handling.
    ///
    /// These are accepted quietly instead of being reported as unhandled.
    pub const KNOWN_UNHANDLED: &[u16] = &[
        SYSHEARTBEAT,
        SS_MODELREP,
        SS_DETECTREP,
        ADAPTFILTREP,
        SS_ARTIF_REJECTREP,
        LNCREP,
        SS_NOISE_BOUNDARYREP,
        SS_STATISTICSREP,
        REPFILECFG,
        SS_STATUSREP,
        FILTREP,
        BANKREP,
        REPNTRODEINFO,
        REFELECFILTREP,
        NPLAYREP,
    ];
}

/// Routing key used by the callback registry.
///
/// The header type code means different things depending on the channel id,
/// so callbacks are keyed by the packet family as well as the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKey {
    /// Configuration packet with the given type code.
    Config(u16),
    /// Sample-group packet for the given group id (1..=6).
    Group(u16),
    /// Per-channel event packet from a channel of the given type.
    Event(ChannelType),
}

impl PacketKey {
    /// Derive the routing key for a header, given the channel type the
    /// mirror currently knows for its channel.
    pub fn for_header(header: &PacketHeader, channel_type: ChannelType) -> Self {
        if header.is_config() {
            PacketKey::Config(header.packet_type)
        } else if header.is_group() {
            PacketKey::Group(header.packet_type)
        } else {
            PacketKey::Event(channel_type)
        }
    }
}

impl fmt::Display for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKey::Config(code) => write!(f, "config {:#04x}", code),
            PacketKey::Group(group) => write!(f, "group {}", group),
            PacketKey::Event(channel_type) => write!(f, "event {:?}", channel_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes_strip_set_bit() {
        assert_eq!(types::reply_for(types::CHANSETSMP), types::CHANREPSMP);
        assert_eq!(types::reply_for(types::SYSSETRUNLEV), types::SYSREPRUNLEV);
        assert_eq!(types::reply_for(types::REQCONFIGALL), types::REPCONFIGALL);
        assert_eq!(types::reply_for(types::CHANSETSPKHPS), types::CHANREPSPKHPS);
        assert_eq!(types::reply_for(types::COMMENTSET), types::COMMENTREP);
    }

    #[test]
    fn routing_key_depends_on_channel_family() {
        let config = PacketHeader::new(7, CONFIGURATION_CHANNEL, types::SYSREP, 0);
        let group = PacketHeader::new(7, GROUP_CHANNEL, 5, 0);
        let event = PacketHeader::new(7, 12, 1, 0);

        assert_eq!(PacketKey::for_header(&config, ChannelType::Any), PacketKey::Config(0x10));
        assert_eq!(PacketKey::for_header(&group, ChannelType::Any), PacketKey::Group(5));
        assert_eq!(
            PacketKey::for_header(&event, ChannelType::FrontEnd),
            PacketKey::Event(ChannelType::FrontEnd)
        );
    }
}
