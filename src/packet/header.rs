//! Fixed packet header
//!
//! ```text
//! offset  size  field
//!      0     4  time   device clock ticks at packet creation
//!      4     2  chid   source channel / group identifier
//!      6     2  type   selects decoder / variant
//!      8     2  dlen   payload bytes following the header
//! ```
//!
//! All fields are little-endian. `dlen` never includes the header itself.

use serde::{Deserialize, Serialize};

use super::{CONFIGURATION_CHANNEL, GROUP_CHANNEL};
use crate::error::DecodeError;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 10;

/// Largest payload a header can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Device clock ticks at packet creation
    pub time: u32,
    /// Source channel or group identifier
    pub chid: u16,
    /// Type code
    pub packet_type: u16,
    /// Payload length in bytes
    pub dlen: u16,
}

impl PacketHeader {
    pub fn new(time: u32, chid: u16, packet_type: u16, dlen: u16) -> Self {
        Self { time, chid, packet_type, dlen }
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// `offset` is only used to annotate the error.
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::TruncatedHeader {
                offset,
                remaining: bytes.len(),
                needed: HEADER_SIZE,
            });
        }

        Ok(Self {
            time: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            chid: u16::from_le_bytes([bytes[4], bytes[5]]),
            packet_type: u16::from_le_bytes([bytes[6], bytes[7]]),
            dlen: u16::from_le_bytes([bytes[8], bytes[9]]),
        })
    }

    /// Append the encoded header to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.chid.to_le_bytes());
        out.extend_from_slice(&self.packet_type.to_le_bytes());
        out.extend_from_slice(&self.dlen.to_le_bytes());
    }

    /// Encoded header bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.time.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.chid.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.packet_type.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.dlen.to_le_bytes());
        bytes
    }

    /// Header plus payload length.
    pub fn packet_len(&self) -> usize {
        HEADER_SIZE + self.dlen as usize
    }

    /// Configuration packets have the configuration bit set in `chid`.
    pub fn is_config(&self) -> bool {
        self.chid & CONFIGURATION_CHANNEL != 0
    }

    /// Sample-group packets use channel 0; `packet_type` is the group id.
    pub fn is_group(&self) -> bool {
        self.chid == GROUP_CHANNEL
    }

    /// Per-channel event packets (spikes, digital events).
    pub fn is_event(&self) -> bool {
        !self.is_config() && !self.is_group()
    }
}
