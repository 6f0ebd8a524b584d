//! Outbound command packets.

use serde::{Deserialize, Serialize};

use super::header::{MAX_PAYLOAD, PacketHeader};
use super::typed::{ChannelInfo, Comment, SysInfo};
use super::{CONFIGURATION_CHANNEL, types};
use crate::error::{Result, SdkError};
use crate::mirror::RunLevel;

/// Which part of a channel record a channel SET packet writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelScope {
    /// Whole record
    Full,
    Label,
    AnalogInput,
    Sampling,
    Spike,
    RejectAmplitude,
    AutoThreshold,
    SpikeThreshold,
    /// Manual sorting hoops
    Hoops,
}

impl ChannelScope {
    pub const ALL: [ChannelScope; 9] = [
        ChannelScope::Full,
        ChannelScope::Label,
        ChannelScope::AnalogInput,
        ChannelScope::Sampling,
        ChannelScope::Spike,
        ChannelScope::RejectAmplitude,
        ChannelScope::AutoThreshold,
        ChannelScope::SpikeThreshold,
        ChannelScope::Hoops,
    ];

    pub fn set_type(self) -> u16 {
        match self {
            ChannelScope::Full => types::CHANSET,
            ChannelScope::Label => types::CHANSETLABEL,
            ChannelScope::AnalogInput => types::CHANSETAINP,
            ChannelScope::Sampling => types::CHANSETSMP,
            ChannelScope::Spike => types::CHANSETSPK,
            ChannelScope::RejectAmplitude => types::CHANSETREJECTAMPLITUDE,
            ChannelScope::AutoThreshold => types::CHANSETAUTOTHRESHOLD,
            ChannelScope::SpikeThreshold => types::CHANSETSPKTHR,
            ChannelScope::Hoops => types::CHANSETSPKHPS,
        }
    }

    /// Reply type the instrument echoes a write of this scope with.
    pub fn reply_type(self) -> u16 {
        types::reply_for(self.set_type())
    }

    pub fn from_reply_type(packet_type: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|scope| scope.reply_type() == packet_type)
    }
}

/// Outbound request to the instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetRunLevel { run_level: RunLevel, reset_queue: u32, run_flags: u32 },
    /// Replace the transport flags. `0` (check) only asks for a report.
    SetTransport { transport: u16 },
    /// Ask for a full configuration dump
    RequestConfigAll,
    SetChannel { scope: ChannelScope, info: ChannelInfo },
    /// Annotate the recording; the instrument echoes it to every client
    Comment(Comment),
    /// Pre-built payload with an arbitrary header
    Raw { chid: u16, packet_type: u16, payload: Vec<u8> },
}

impl Command {
    pub fn set_run_level(run_level: RunLevel) -> Self {
        Command::SetRunLevel { run_level, reset_queue: 0, run_flags: 0 }
    }

    pub fn chid(&self) -> u16 {
        match self {
            Command::Raw { chid, .. } => *chid,
            _ => CONFIGURATION_CHANNEL,
        }
    }

    pub fn packet_type(&self) -> u16 {
        match self {
            Command::SetRunLevel { .. } => types::SYSSETRUNLEV,
            Command::SetTransport { .. } => types::SYSSETTRANSPORT,
            Command::RequestConfigAll => types::REQCONFIGALL,
            Command::SetChannel { scope, .. } => scope.set_type(),
            Command::Comment(_) => types::COMMENTSET,
            Command::Raw { packet_type, .. } => *packet_type,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Command::SetRunLevel { run_level, reset_queue, run_flags } => SysInfo {
                run_level: *run_level,
                reset_queue: *reset_queue,
                run_flags: *run_flags,
                ..SysInfo::default()
            }
            .write(&mut out),
            Command::SetTransport { transport } => {
                SysInfo { transport: *transport, ..SysInfo::default() }.write(&mut out)
            }
            Command::RequestConfigAll => {}
            Command::SetChannel { info, .. } => info.write(&mut out),
            Command::Comment(comment) => comment.write(&mut out),
            Command::Raw { payload, .. } => out.extend_from_slice(payload),
        }
        out
    }

    /// Encode header and payload with the given header timestamp.
    pub fn encode(&self, time: u32) -> Result<Vec<u8>> {
        let payload = self.payload();
        if payload.len() > MAX_PAYLOAD {
            return Err(SdkError::Encode {
                details: format!(
                    "payload of {} bytes exceeds the {} byte limit",
                    payload.len(),
                    MAX_PAYLOAD
                ),
            });
        }

        let header = PacketHeader::new(time, self.chid(), self.packet_type(), payload.len() as u16);
        let mut out = Vec::with_capacity(header.packet_len());
        header.write(&mut out);
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketBody, decode_generic, typed};
    use proptest::prelude::*;

    #[test]
    fn scoped_replies_map_back() {
        for scope in ChannelScope::ALL {
            assert_eq!(ChannelScope::from_reply_type(scope.reply_type()), Some(scope));
            assert_eq!(scope.set_type() & 0x80, 0x80);
        }
        assert_eq!(ChannelScope::from_reply_type(types::SYSREP), None);
    }

    #[test]
    fn run_level_command_carries_sys_info() {
        let bytes = Command::set_run_level(RunLevel::HardReset).encode(1).unwrap();
        let generic = decode_generic(&bytes).unwrap();
        assert_eq!(generic.header.chid, CONFIGURATION_CHANNEL);
        assert_eq!(generic.header.packet_type, types::SYSSETRUNLEV);

        let body = typed::decode_sys_info(&generic.header, generic.payload).unwrap();
        let PacketBody::SysInfo(info) = body else { panic!("expected sys info") };
        assert_eq!(info.run_level, RunLevel::HardReset);
    }

    #[test]
    fn config_request_has_empty_payload() {
        let bytes = Command::RequestConfigAll.encode(1).unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(decode_generic(&bytes).unwrap().header.dlen, 0);
    }

    #[test]
    fn oversized_raw_payload_is_rejected() {
        let command = Command::Raw { chid: 1, packet_type: 2, payload: vec![0; MAX_PAYLOAD + 1] };
        assert!(matches!(command.encode(0), Err(SdkError::Encode { .. })));
    }

    #[test]
    fn built_in_commands_are_word_aligned() {
        let commands = [
            Command::set_run_level(RunLevel::Running),
            Command::SetTransport { transport: 1 },
            Command::SetChannel { scope: ChannelScope::Label, info: ChannelInfo::default() },
            Command::Comment(Comment {
                charset: 0,
                time_started: 7,
                rgba: 0,
                text: "odd".to_string(),
            }),
        ];
        for command in commands {
            let payload_len = command.encode(0).unwrap().len() - 10;
            assert_eq!(payload_len % 4, 0, "{:?}", command);
        }
    }

    fn arb_command() -> impl Strategy<Value = Command> {
        let run_level = prop_oneof![
            Just(RunLevel::Running),
            Just(RunLevel::HardReset),
            Just(RunLevel::Reset),
            Just(RunLevel::Standby),
        ];
        let scope = prop::sample::select(ChannelScope::ALL.to_vec());
        prop_oneof![
            (run_level, any::<u32>(), any::<u32>()).prop_map(|(run_level, reset_queue, run_flags)| {
                Command::SetRunLevel { run_level, reset_queue, run_flags }
            }),
            any::<u16>().prop_map(|transport| Command::SetTransport { transport }),
            Just(Command::RequestConfigAll),
            (scope, 1u32..1024, "[a-z0-9]{0,16}").prop_map(|(scope, chan, label)| {
                let info = ChannelInfo { chan, label, ..Default::default() };
                Command::SetChannel { scope, info }
            }),
            (any::<u64>(), any::<u32>(), "[ -~]{0,140}").prop_map(|(time_started, rgba, text)| {
                Command::Comment(Comment { charset: 0, time_started, rgba, text })
            }),
            (any::<u16>(), any::<u16>(), prop::collection::vec(any::<u8>(), 0..128)).prop_map(
                |(chid, packet_type, payload)| Command::Raw { chid, packet_type, payload }
            ),
        ]
    }

    proptest! {
        #[test]
        fn encoded_commands_decode_to_same_fields(command in arb_command(), time: u32) {
            let bytes = command.encode(time).unwrap();
            let generic = decode_generic(&bytes).unwrap();

            prop_assert_eq!(generic.header.time, time);
            prop_assert_eq!(generic.header.chid, command.chid());
            prop_assert_eq!(generic.header.packet_type, command.packet_type());
            prop_assert_eq!(generic.header.dlen as usize, bytes.len() - 10);
            prop_assert_eq!(generic.payload, &command.payload()[..]);
        }
    }
}
