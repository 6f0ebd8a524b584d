//! Datagram slicing, generic decoding and typed materialization.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use super::header::{HEADER_SIZE, PacketHeader};
use super::typed::{self, PacketBody, TypedPacket};
use super::types;
use crate::error::DecodeError;

/// Per-type payload decoder for configuration packets.
pub type DecoderFn = fn(&PacketHeader, &[u8]) -> Result<PacketBody, DecodeError>;

/// Walk `buffer` from offset 0 and yield one slice per packet.
///
/// Each slice covers a header and exactly `dlen` payload bytes. A truncated
/// header or an overrunning length ends the walk with one `Err` item; slices
/// yielded before it are unaffected and the corrupt tail is discarded.
pub fn split(buffer: &[u8]) -> Slices<'_> {
    Slices { buffer, offset: 0, failed: false }
}

/// Iterator returned by [`split`].
#[derive(Debug, Clone)]
pub struct Slices<'a> {
    buffer: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Slices<'a> {
    /// Offset of the next unread byte.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for Slices<'a> {
    type Item = Result<&'a [u8], DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buffer.len() {
            return None;
        }

        let rest = &self.buffer[self.offset..];
        let header = match PacketHeader::parse(rest, self.offset) {
            Ok(header) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let len = header.packet_len();
        if len > rest.len() {
            self.failed = true;
            return Some(Err(DecodeError::LengthOverrun {
                offset: self.offset,
                declared: header.dlen as usize,
                remaining: rest.len() - HEADER_SIZE,
            }));
        }

        self.offset += len;
        Some(Ok(&rest[..len]))
    }
}

impl std::iter::FusedIterator for Slices<'_> {}

/// Header plus a payload borrowed from the datagram buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericPacket<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl GenericPacket<'_> {
    /// Copy the payload out of the datagram buffer so the packet can cross
    /// the handoff queue.
    pub fn into_owned(self) -> OwnedPacket {
        OwnedPacket { header: self.header, payload: Arc::from(self.payload) }
    }
}

/// Parse the header of one slice and borrow its payload.
pub fn decode_generic(slice: &[u8]) -> Result<GenericPacket<'_>, DecodeError> {
    let header = PacketHeader::parse(slice, 0)?;
    let end = header.packet_len();
    if end > slice.len() {
        return Err(DecodeError::LengthOverrun {
            offset: 0,
            declared: header.dlen as usize,
            remaining: slice.len() - HEADER_SIZE,
        });
    }
    Ok(GenericPacket { header, payload: &slice[HEADER_SIZE..end] })
}

/// Generic packet with an owned, cheaply clonable payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedPacket {
    pub header: PacketHeader,
    pub payload: Arc<[u8]>,
}

impl OwnedPacket {
    /// Build a packet, deriving `dlen` from the payload.
    ///
    /// Payloads longer than `u16::MAX` are truncated.
    pub fn new(time: u32, chid: u16, packet_type: u16, payload: &[u8]) -> Self {
        let payload = &payload[..payload.len().min(super::header::MAX_PAYLOAD)];
        Self {
            header: PacketHeader::new(time, chid, packet_type, payload.len() as u16),
            payload: Arc::from(payload),
        }
    }

    /// Wire bytes: header followed by the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.write(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Type code → decoder table for configuration packets.
///
/// Sample-group and event packets are decoded by channel family and never
/// consult the table.
#[derive(Clone)]
pub struct DecoderTable {
    decoders: HashMap<u16, DecoderFn>,
}

impl DecoderTable {
    /// Table with no decoders; every configuration packet becomes
    /// [`PacketBody::Unknown`].
    pub fn empty() -> Self {
        Self { decoders: HashMap::new() }
    }

    /// Register or replace the decoder for `packet_type`.
    pub fn register(&mut self, packet_type: u16, decoder: DecoderFn) -> Option<DecoderFn> {
        self.decoders.insert(packet_type, decoder)
    }

    pub fn contains(&self, packet_type: u16) -> bool {
        self.decoders.contains_key(&packet_type)
    }

    /// Decode an owned generic packet into a typed packet.
    pub fn materialize(&self, packet: &OwnedPacket) -> Result<TypedPacket, DecodeError> {
        let header = packet.header;
        let body = if header.is_config() {
            match self.decoders.get(&header.packet_type) {
                Some(decode) => decode(&header, &packet.payload)?,
                None => PacketBody::Unknown(packet.payload.clone()),
            }
        } else if header.is_group() {
            typed::decode_sample_group(&header, &packet.payload)
        } else {
            typed::decode_event(&header, &packet.payload)
        };
        Ok(TypedPacket::new(header, body))
    }
}

impl Default for DecoderTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.register(types::SYSHEARTBEAT, typed::decode_heartbeat);
        table.register(types::SYSPROTOCOLMONITOR, typed::decode_protocol_monitor);
        table.register(types::REPCONFIGALL, typed::decode_config_all);
        for code in
            [types::SYSREP, types::SYSREPSPKLEN, types::SYSREPRUNLEV, types::SYSREPTRANSPORT]
        {
            table.register(code, typed::decode_sys_info);
        }
        table.register(types::PROCREP, typed::decode_proc_info);
        table.register(types::GROUPREP, typed::decode_group_info);
        for code in [
            types::CHANREP,
            types::CHANREPLABEL,
            types::CHANREPAINP,
            types::CHANREPSMP,
            types::CHANREPSPK,
            types::CHANREPREJECTAMPLITUDE,
            types::CHANREPAUTOTHRESHOLD,
            types::CHANREPSPKTHR,
            types::CHANREPSPKHPS,
        ] {
            table.register(code, typed::decode_channel_info);
        }
        table.register(types::LOGREP, typed::decode_log);
        table.register(types::COMMENTREP, typed::decode_comment);
        table
    }
}

impl std::fmt::Debug for DecoderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<_> = self.decoders.keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("DecoderTable").field("types", &codes).finish()
    }
}

static BUILTIN: LazyLock<DecoderTable> = LazyLock::new(DecoderTable::default);

/// Materialize with the built-in decoder table.
pub fn materialize(packet: &OwnedPacket) -> Result<TypedPacket, DecodeError> {
    BUILTIN.materialize(packet)
}
