//! Transaction identifiers, validation outcomes, and the per-slot status
//! snapshot exchanged between nodes.

use std::cmp::Ordering;
use std::fmt;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::codec::{checksum, put_u32, put_u64, put_u8, read_u32_at, read_u64_at, read_u8_at};

/// Version byte written at the start of a stored status.
const STATUS_FORMAT_VERSION: u8 = 1;

/// Issuer of a transaction id: the node name plus the generation of the
/// sequence manager instance that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionOrigin {
    pub node: String,
    pub generation: u64,
}

/// Identifier of a distributed transaction.
///
/// `(position, sequence)` names the logical transaction; the origin tells who
/// issued it. Equality includes the origin, so two issuers racing for the same
/// slot produce different ids for the same logical transaction. Ids reported
/// as missing carry no origin.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    pub origin: Option<TransactionOrigin>,
    pub position: u32,
    pub sequence: u64,
}

impl TransactionId {
    pub fn new(node: impl Into<String>, generation: u64, position: u32, sequence: u64) -> Self {
        Self {
            origin: Some(TransactionOrigin {
                node: node.into(),
                generation,
            }),
            position,
            sequence,
        }
    }

    /// Id of a transaction known only by its slot coordinates.
    pub const fn missing(position: u32, sequence: u64) -> Self {
        Self {
            origin: None,
            position,
            sequence,
        }
    }

    /// Whether both ids name the same logical transaction, regardless of issuer.
    pub fn same_transaction(&self, other: &Self) -> bool {
        self.position == other.position && self.sequence == other.sequence
    }
}

impl Ord for TransactionId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.position, self.sequence, &self.origin).cmp(&(
            other.position,
            other.sequence,
            &other.origin,
        ))
    }
}

impl PartialOrd for TransactionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(
                f,
                "{}.{}:{}:{}",
                origin.node, origin.generation, self.position, self.sequence
            ),
            None => write!(f, "*:{}:{}", self.position, self.sequence),
        }
    }
}

/// Classification of an incoming transaction id against local slot state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationResult {
    /// Next expected sequence for the slot; the id now holds the slot.
    Valid,
    /// Earlier sequences for the slot have not been seen yet.
    MissingPrevious,
    /// The sequence was already confirmed.
    AlreadyPresent,
    /// Another id holds the slot until it is confirmed or released.
    AlreadyPromised,
}

/// Highest contiguously committed sequence per slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSequenceStatus {
    pub sequences: Vec<u64>,
}

impl TransactionSequenceStatus {
    pub fn new(sequences: Vec<u64>) -> Self {
        Self { sequences }
    }

    pub fn slot_count(&self) -> usize {
        self.sequences.len()
    }

    pub fn get(&self, position: u32) -> Option<u64> {
        self.sequences.get(position as usize).copied()
    }

    /// Serialize as: version (u8), slot count (u32), one u64 per slot, then a
    /// CRC32 of everything before it. Integers are big-endian.
    pub fn store(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + self.sequences.len() * 8 + 4);
        put_u8(&mut buf, STATUS_FORMAT_VERSION);
        put_u32(&mut buf, self.sequences.len() as u32);
        for sequence in &self.sequences {
            put_u64(&mut buf, *sequence);
        }
        let crc = checksum(&buf);
        put_u32(&mut buf, crc);
        buf
    }

    pub fn read(data: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(data.len() >= 4, "sequence status too short");
        let (body, trailer) = data.split_at(data.len() - 4);
        let mut offset = 0;
        let expected = read_u32_at(trailer, &mut offset)?;
        anyhow::ensure!(checksum(body) == expected, "sequence status checksum mismatch");

        let mut offset = 0;
        let version = read_u8_at(body, &mut offset)?;
        anyhow::ensure!(
            version == STATUS_FORMAT_VERSION,
            "unsupported sequence status version {version}"
        );
        let count = read_u32_at(body, &mut offset)? as usize;
        anyhow::ensure!(
            body.len() == offset + count * 8,
            "sequence status length does not match slot count {count}"
        );
        let mut sequences = Vec::with_capacity(count);
        for slot in 0..count {
            let sequence =
                read_u64_at(body, &mut offset).with_context(|| format!("read slot {slot}"))?;
            sequences.push(sequence);
        }
        Ok(Self { sequences })
    }
}
