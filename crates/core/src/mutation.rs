//! Mutations and the serialized message-block format.
//!
//! A commit proxy hands the log server one serialized block per storage
//! team and version: a fixed header followed by `(subsequence, mutation)`
//! messages. The log server treats the message bytes as opaque for
//! routing, but the codec lives here because recovery, peeks and the
//! checksum validator all need to traverse blocks.

use bytes::Bytes;
use ledgerd_primitives::buf::{BufReader, BufWriter, DecodeError};
use ledgerd_primitives::{Subsequence, Version};

use crate::acs::AcsState;

/// Marker key carried by accumulative-checksum mutations.
pub const ACS_MUTATION_KEY: &[u8] = b"\xff/accumulativeChecksum";

/// Fixed header of a serialized team block: `u32 payload_len | u32 count`.
///
/// The commit path strips this before buffering; only the message bytes
/// are retained, spilled, and served to consumers.
pub const TEAM_BLOCK_HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MutationType {
    SetValue = 0,
    ClearRange = 1,
    AddValue = 2,
    BitAnd = 3,
    BitOr = 4,
    BitXor = 5,
    Max = 6,
    Min = 7,
    CompareAndClear = 8,
    /// Carries a rolled-up [`AcsState`] in `param2`; see [`crate::acs`].
    AccumulativeChecksum = 9,
}

impl MutationType {
    fn from_u8(raw: u8) -> Result<Self, DecodeError> {
        use MutationType::*;
        Ok(match raw {
            0 => SetValue,
            1 => ClearRange,
            2 => AddValue,
            3 => BitAnd,
            4 => BitOr,
            5 => BitXor,
            6 => Max,
            7 => Min,
            8 => CompareAndClear,
            9 => AccumulativeChecksum,
            tag => {
                return Err(DecodeError::InvalidTag {
                    tag,
                    kind: "mutation type",
                })
            }
        })
    }
}

const FLAG_CHECKSUM: u8 = 0x01;
const FLAG_ACS_INDEX: u8 = 0x02;

/// One mutation: `(type, param1, param2)` plus optional integrity fields.
///
/// Single-key mutations use `param1` only; range mutations cover
/// `[param1, param2)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub mutation_type: MutationType,
    pub param1: Bytes,
    pub param2: Bytes,
    /// Checksum of `(type, param1, param2)`, populated by the producer.
    pub checksum: Option<u32>,
    /// Identifies the producer for accumulative checksumming.
    pub acs_index: Option<u16>,
}

impl Mutation {
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            mutation_type: MutationType::SetValue,
            param1: key.into(),
            param2: value.into(),
            checksum: None,
            acs_index: None,
        }
    }

    pub fn clear_range(begin: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            mutation_type: MutationType::ClearRange,
            param1: begin.into(),
            param2: end.into(),
            checksum: None,
            acs_index: None,
        }
    }

    /// The special mutation carrying a rolled-up checksum state.
    pub fn accumulative_checksum(state: AcsState) -> Self {
        let mut mutation = Self {
            mutation_type: MutationType::AccumulativeChecksum,
            param1: Bytes::from_static(ACS_MUTATION_KEY),
            param2: Bytes::from(state.to_value()),
            checksum: None,
            acs_index: Some(state.acs_index),
        };
        mutation.populate_checksum();
        mutation
    }

    /// If this is an accumulative-checksum mutation, decode its state.
    pub fn as_acs_state(&self) -> Option<AcsState> {
        if self.mutation_type != MutationType::AccumulativeChecksum {
            return None;
        }
        AcsState::from_value(&self.param2).ok()
    }

    pub fn is_acs(&self) -> bool {
        self.mutation_type == MutationType::AccumulativeChecksum
    }

    /// Checksum over the mutation body (not the optional fields).
    pub fn compute_checksum(&self) -> u32 {
        let mut crc = crc32c::crc32c(&[self.mutation_type as u8]);
        crc = crc32c::crc32c_append(crc, &self.param1);
        crc32c::crc32c_append(crc, &self.param2)
    }

    pub fn populate_checksum(&mut self) {
        self.checksum = Some(self.compute_checksum());
    }

    /// `true` if no checksum is present, or it matches the body.
    pub fn validate_checksum(&self) -> bool {
        self.checksum.map_or(true, |sum| sum == self.compute_checksum())
    }

    pub fn encode<W: BufWriter>(&self, writer: &mut W) {
        writer.put_u8(self.mutation_type as u8);
        let mut flags = 0u8;
        if self.checksum.is_some() {
            flags |= FLAG_CHECKSUM;
        }
        if self.acs_index.is_some() {
            flags |= FLAG_ACS_INDEX;
        }
        writer.put_u8(flags);
        writer.put_u32(self.param1.len() as u32);
        writer.put_slice(&self.param1);
        writer.put_u32(self.param2.len() as u32);
        writer.put_slice(&self.param2);
        if let Some(sum) = self.checksum {
            writer.put_u32(sum);
        }
        if let Some(idx) = self.acs_index {
            writer.put_u16(idx);
        }
    }

    pub fn decode<'a, R: BufReader<'a>>(reader: &mut R) -> Result<Self, DecodeError> {
        let mutation_type = MutationType::from_u8(reader.get_u8()?)?;
        let flags = reader.get_u8()?;
        let p1_len = reader.get_u32()? as usize;
        let param1 = Bytes::copy_from_slice(reader.get_slice(p1_len)?);
        let p2_len = reader.get_u32()? as usize;
        let param2 = Bytes::copy_from_slice(reader.get_slice(p2_len)?);
        let checksum = if flags & FLAG_CHECKSUM != 0 {
            Some(reader.get_u32()?)
        } else {
            None
        };
        let acs_index = if flags & FLAG_ACS_INDEX != 0 {
            Some(reader.get_u16()?)
        } else {
            None
        };
        Ok(Self {
            mutation_type,
            param1,
            param2,
            checksum,
            acs_index,
        })
    }
}

/// One message of a team block: a mutation at an intra-version position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub subsequence: Subsequence,
    pub mutation: Mutation,
}

impl Message {
    pub fn encode<W: BufWriter>(&self, writer: &mut W) {
        writer.put_u32(self.subsequence);
        self.mutation.encode(writer);
    }

    pub fn decode<'a, R: BufReader<'a>>(reader: &mut R) -> Result<Self, DecodeError> {
        let subsequence = reader.get_u32()?;
        let mutation = Mutation::decode(reader)?;
        Ok(Self { subsequence, mutation })
    }
}

/// Serialize one team block for a commit request: header plus messages.
pub fn encode_team_block(messages: &[Message]) -> Bytes {
    let mut payload = Vec::new();
    for message in messages {
        message.encode(&mut payload);
    }
    let mut block = Vec::with_capacity(TEAM_BLOCK_HEADER_LEN + payload.len());
    block.put_u32(payload.len() as u32);
    block.put_u32(messages.len() as u32);
    block.extend_from_slice(&payload);
    Bytes::from(block)
}

/// Parse the messages of a header-stripped block, as stored in the team
/// buffer and in spilled rows.
pub fn decode_messages(block: &[u8]) -> Result<Vec<Message>, DecodeError> {
    let mut reader = block;
    let mut messages = Vec::new();
    while reader.remaining() > 0 {
        messages.push(Message::decode(&mut reader)?);
    }
    Ok(messages)
}

/// The reply payload of a peek: a sequence of per-version frames,
/// `u64 version | u32 len | messages`.
pub fn append_version_block(out: &mut Vec<u8>, version: Version, block: &[u8]) {
    out.put_u64(version);
    out.put_u32(block.len() as u32);
    out.extend_from_slice(block);
}

/// Parse a peek reply payload back into `(version, messages-bytes)` pairs.
pub fn decode_version_blocks(mut data: &[u8]) -> Result<Vec<(Version, Bytes)>, DecodeError> {
    let mut blocks = Vec::new();
    while data.remaining() > 0 {
        let version = data.get_u64()?;
        let len = data.get_u32()? as usize;
        let block = Bytes::copy_from_slice(data.get_slice(len)?);
        blocks.push((version, block));
    }
    Ok(blocks)
}
