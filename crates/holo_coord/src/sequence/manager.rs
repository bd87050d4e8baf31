//! Per-node transaction sequence bookkeeping.
//!
//! Every node keeps a fixed table of sequence slots. A slot records the highest
//! sequence confirmed without gaps, the id currently holding the slot (the
//! pending promise), and sequences confirmed ahead of a gap. Comparing slot
//! tables between nodes tells a replica exactly which transactions it has not
//! seen.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::{TransactionId, TransactionSequenceStatus, ValidationResult};

/// Default number of sequence slots per node.
pub const DEFAULT_SLOT_COUNT: usize = 1000;

/// Most missing ids reported for one slot in a single comparison.
pub const MAX_MISSING_PER_SLOT: usize = 4096;

/// Clock-derived nonce so a restarted node issues ids from a fresh generation.
fn initial_generation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

#[derive(Debug, Default)]
struct Slot {
    /// Highest sequence confirmed without gaps.
    last: u64,
    /// Id holding the slot between validation and confirmation/release.
    promised: Option<TransactionId>,
    /// Sequences above `last + 1` already confirmed.
    ahead: BTreeSet<u64>,
}

impl Slot {
    fn is_present(&self, sequence: u64) -> bool {
        sequence <= self.last || self.ahead.contains(&sequence)
    }

    /// Advance `last` over sequences that were confirmed ahead of a gap.
    fn drain_ahead(&mut self) {
        while let Some(next) = self.last.checked_add(1) {
            if !self.ahead.remove(&next) {
                break;
            }
            self.last = next;
        }
        let last = self.last;
        self.ahead.retain(|sequence| *sequence > last);
    }

    /// Drop the promise once its sequence has been confirmed.
    fn release_settled_promise(&mut self) {
        let settled = self
            .promised
            .as_ref()
            .is_some_and(|holder| self.is_present(holder.sequence));
        if settled {
            self.promised = None;
        }
    }

    /// Unconfirmed sequences in `last + 1..=upper`, at most
    /// `MAX_MISSING_PER_SLOT` of them.
    fn missing_through(&self, position: u32, upper: u64) -> Vec<TransactionId> {
        let Some(first) = self.last.checked_add(1) else {
            return Vec::new();
        };
        if first > upper {
            return Vec::new();
        }
        let missing: Vec<_> = (first..=upper)
            .filter(|sequence| !self.ahead.contains(sequence))
            .take(MAX_MISSING_PER_SLOT)
            .map(|sequence| TransactionId::missing(position, sequence))
            .collect();
        if missing.len() == MAX_MISSING_PER_SLOT {
            tracing::warn!(
                position,
                last = self.last,
                upper,
                limit = MAX_MISSING_PER_SLOT,
                "missing transaction list truncated"
            );
        }
        missing
    }
}

/// Slot table of one node.
#[derive(Debug)]
pub struct TransactionSequenceManager {
    node: String,
    generation: u64,
    slots: Vec<Slot>,
    /// Round-robin cursor for `next`.
    cursor: usize,
}

impl TransactionSequenceManager {
    pub fn new(node: impl Into<String>, slot_count: usize) -> Self {
        Self::with_generation(node, initial_generation(), slot_count)
    }

    pub fn with_generation(node: impl Into<String>, generation: u64, slot_count: usize) -> Self {
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, Slot::default);
        Self {
            node: node.into(),
            generation,
            slots,
            cursor: 0,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently held by a promise.
    pub fn pending_promises(&self) -> usize {
        self.slots.iter().filter(|slot| slot.promised.is_some()).count()
    }

    /// Promise the next sequence of the first free slot after the cursor.
    ///
    /// Returns `None` when every slot is promised; callers should back off.
    pub fn next(&mut self) -> Option<TransactionId> {
        let count = self.slots.len();
        for step in 0..count {
            let position = (self.cursor + step) % count;
            if self.slots[position].promised.is_none() {
                self.cursor = (position + 1) % count;
                return self.promise(position);
            }
        }
        None
    }

    /// Promise the next sequence of a specific slot.
    pub fn next_at(&mut self, position: u32) -> Option<TransactionId> {
        let slot = self.slots.get(position as usize)?;
        if slot.promised.is_some() {
            return None;
        }
        self.promise(position as usize)
    }

    fn promise(&mut self, position: usize) -> Option<TransactionId> {
        let slot = self.slots.get_mut(position)?;
        let id = TransactionId::new(
            self.node.clone(),
            self.generation,
            position as u32,
            slot.last.checked_add(1)?,
        );
        slot.promised = Some(id.clone());
        Some(id)
    }

    fn slot_mut(&mut self, position: u32) -> anyhow::Result<&mut Slot> {
        let count = self.slots.len();
        self.slots.get_mut(position as usize).ok_or_else(|| {
            anyhow::anyhow!("transaction position {position} out of range ({count} slots)")
        })
    }

    /// Classify an incoming id against the local slot state.
    ///
    /// A `Valid` or `MissingPrevious` id becomes the slot's promise; repeated
    /// validation of the holder is idempotent.
    pub fn validate_transaction_id(
        &mut self,
        id: &TransactionId,
    ) -> anyhow::Result<ValidationResult> {
        let slot = self.slot_mut(id.position)?;
        if slot.is_present(id.sequence) {
            return Ok(ValidationResult::AlreadyPresent);
        }
        if let Some(holder) = &slot.promised {
            if holder != id {
                return Ok(ValidationResult::AlreadyPromised);
            }
        }
        slot.promised = Some(id.clone());
        if slot.last.checked_add(1) == Some(id.sequence) {
            Ok(ValidationResult::Valid)
        } else {
            Ok(ValidationResult::MissingPrevious)
        }
    }

    /// Confirm a committed transaction.
    ///
    /// Returns the ids between the contiguous prefix and `id` that have not
    /// been confirmed yet; an empty list means no gap.
    pub fn notify_success(&mut self, id: &TransactionId) -> anyhow::Result<Vec<TransactionId>> {
        let slot = self.slot_mut(id.position)?;
        if slot.promised.as_ref() == Some(id) {
            slot.promised = None;
        }
        if slot.is_present(id.sequence) {
            return Ok(Vec::new());
        }
        if slot.last.checked_add(1) == Some(id.sequence) {
            slot.last = id.sequence;
            slot.drain_ahead();
            slot.release_settled_promise();
            return Ok(Vec::new());
        }
        let missing = slot.missing_through(id.position, id.sequence - 1);
        slot.ahead.insert(id.sequence);
        slot.release_settled_promise();
        Ok(missing)
    }

    /// Release the slot if `id` still holds it.
    pub fn notify_failure(&mut self, id: &TransactionId) -> bool {
        let Some(slot) = self.slots.get_mut(id.position as usize) else {
            return false;
        };
        if slot.promised.as_ref() == Some(id) {
            slot.promised = None;
            true
        } else {
            false
        }
    }

    pub fn current_status(&self) -> TransactionSequenceStatus {
        TransactionSequenceStatus::new(self.slots.iter().map(|slot| slot.last).collect())
    }

    /// Ids this node is missing relative to a remote status.
    ///
    /// Only the slots both tables have are compared.
    pub fn check_self_status(&self, remote: &TransactionSequenceStatus) -> Vec<TransactionId> {
        if remote.slot_count() != self.slots.len() {
            tracing::warn!(
                local_slots = self.slots.len(),
                remote_slots = remote.slot_count(),
                "sequence status slot count mismatch"
            );
        }
        let mut missing = Vec::new();
        for (position, (slot, remote_last)) in self.slots.iter().zip(&remote.sequences).enumerate()
        {
            if *remote_last > slot.last {
                missing.extend(slot.missing_through(position as u32, *remote_last));
            }
        }
        missing
    }

    /// Overwrite the slot table from a restored snapshot.
    pub fn fill(&mut self, status: &TransactionSequenceStatus) -> anyhow::Result<()> {
        anyhow::ensure!(
            status.slot_count() == self.slots.len(),
            "cannot fill {} slots from a status with {} slots",
            self.slots.len(),
            status.slot_count()
        );
        for (slot, last) in self.slots.iter_mut().zip(&status.sequences) {
            slot.last = *last;
            slot.drain_ahead();
            slot.release_settled_promise();
        }
        Ok(())
    }
}
