//! Operation log contract and the sequencing rules shared by its
//! implementations.
//!
//! The leader appends with `log`; followers append with `log_received`, which
//! rejects entries that would leave a gap or contradict the term of the
//! previous entry. `memory` keeps entries in memory only, `file` persists them
//! as checksummed records.

mod file;
mod memory;

use std::collections::VecDeque;

use crate::coord::{LogId, NodeRequest};

pub use file::{FileOpLog, SyncMode};
pub use memory::MemoryOpLog;

/// One operation log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpLogEntry {
    pub log_id: LogId,
    pub request: NodeRequest,
}

/// Outcome of `remove_after`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogIdStatus {
    /// The entry is in the log; everything after it was removed.
    Present,
    /// The id is beyond the end of the log; nothing changed.
    Future,
    /// The id is older than the oldest retained entry; the log was cleared and
    /// restarts right after it.
    TooOld,
    /// The log holds a different term at that sequence; nothing changed.
    Invalid,
}

/// Append-only per-database operation log.
pub trait OperationLog: Send + Sync + 'static {
    /// Leader append in the current term.
    fn log(&self, request: &NodeRequest) -> anyhow::Result<LogId>;

    /// Follower append. `Ok(false)` means the entry does not follow the local
    /// log and the follower is out of sync.
    fn log_received(&self, log_id: LogId, request: &NodeRequest) -> anyhow::Result<bool>;

    fn last_persistent_log(&self) -> anyhow::Result<Option<LogId>>;

    /// Entries with sequences in `from..=to` that are still retained.
    fn iterate(&self, from: u64, to: u64) -> anyhow::Result<Vec<OpLogEntry>>;

    /// Entries a follower whose log ends at `log_id` needs, or `None` when it
    /// has to resync from scratch.
    fn search_from(&self, log_id: LogId) -> anyhow::Result<Option<Vec<OpLogEntry>>>;

    fn remove_after(&self, log_id: LogId) -> anyhow::Result<LogIdStatus>;

    fn set_leader(&self, leader: bool, term: u64) -> anyhow::Result<()>;

    /// Drop retained entries up to `sequence`, always keeping the newest one.
    fn prune_until(&self, sequence: u64) -> anyhow::Result<usize>;
}

/// Storage work needed after a core operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Change {
    Unchanged,
    /// One entry was added at the tail.
    Appended,
    /// Entries were removed; storage must be rebuilt from the core.
    Rewritten,
}

impl Change {
    fn merge(self, other: Change) -> Change {
        match (self, other) {
            (Change::Rewritten, _) | (_, Change::Rewritten) => Change::Rewritten,
            (Change::Appended, _) | (_, Change::Appended) => Change::Appended,
            _ => Change::Unchanged,
        }
    }
}

/// In-memory view of a log: retained entries are contiguous and start at
/// `floor`.
#[derive(Debug, Default)]
pub(crate) struct LogCore {
    entries: VecDeque<OpLogEntry>,
    /// Sequence of the oldest retained entry, or the next sequence when empty.
    floor: u64,
    leader: bool,
    term: u64,
}

impl LogCore {
    pub(crate) fn restore(floor: u64, entries: Vec<OpLogEntry>) -> Self {
        let term = entries.last().map(|entry| entry.log_id.term).unwrap_or(0);
        Self {
            entries: entries.into(),
            floor,
            leader: false,
            term,
        }
    }

    pub(crate) fn floor(&self) -> u64 {
        self.floor
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &OpLogEntry> {
        self.entries.iter()
    }

    pub(crate) fn tail(&self) -> Option<&OpLogEntry> {
        self.entries.back()
    }

    pub(crate) fn term(&self) -> u64 {
        self.term
    }

    /// Take back the entry added by the last `Appended` change and restore
    /// the term the log had before it.
    pub(crate) fn undo_append(&mut self, term: u64) {
        self.entries.pop_back();
        self.term = term;
    }

    fn next_sequence(&self) -> u64 {
        self.floor + self.entries.len() as u64
    }

    fn entry(&self, sequence: u64) -> Option<&OpLogEntry> {
        let index = sequence.checked_sub(self.floor)?;
        self.entries.get(usize::try_from(index).ok()?)
    }

    pub(crate) fn last(&self) -> Option<LogId> {
        self.entries.back().map(|entry| entry.log_id)
    }

    /// Remove every entry with a sequence `>= sequence`.
    fn truncate_from(&mut self, sequence: u64) -> bool {
        let keep = sequence.saturating_sub(self.floor) as usize;
        if keep >= self.entries.len() {
            return false;
        }
        self.entries.truncate(keep);
        true
    }

    pub(crate) fn log(&mut self, request: &NodeRequest) -> anyhow::Result<(LogId, Change)> {
        anyhow::ensure!(self.leader, "operation log is not in leader mode");
        let prev_term = self.last().map(|last| last.term);
        let log_id = LogId::new(self.next_sequence(), self.term, prev_term);
        self.entries.push_back(OpLogEntry {
            log_id,
            request: request.clone(),
        });
        Ok((log_id, Change::Appended))
    }

    pub(crate) fn log_received(
        &mut self,
        log_id: LogId,
        request: &NodeRequest,
    ) -> anyhow::Result<(bool, Change)> {
        anyhow::ensure!(!self.leader, "operation log is in leader mode");
        let next = self.next_sequence();
        if log_id.sequence > next {
            return Ok((false, Change::Unchanged));
        }
        if log_id.sequence < self.floor {
            return Ok((true, Change::Unchanged));
        }

        let mut change = Change::Unchanged;
        if let Some(existing) = self.entry(log_id.sequence) {
            if existing.log_id.term == log_id.term {
                return Ok((true, Change::Unchanged));
            }
            self.truncate_from(log_id.sequence);
            change = Change::Rewritten;
        }

        if let (Some(prev_term), Some(last)) = (log_id.prev_term, self.last()) {
            if prev_term != last.term {
                if last.term < prev_term {
                    // The head belongs to a superseded term; drop it so the
                    // leader's resend of the previous entry can replace it.
                    self.entries.pop_back();
                    change = Change::Rewritten;
                }
                return Ok((false, change));
            }
        }

        self.entries.push_back(OpLogEntry {
            log_id,
            request: request.clone(),
        });
        self.term = log_id.term;
        Ok((true, change.merge(Change::Appended)))
    }

    pub(crate) fn iterate(&self, from: u64, to: u64) -> Vec<OpLogEntry> {
        let Some(last) = self.last() else {
            return Vec::new();
        };
        let from = from.max(self.floor);
        let to = to.min(last.sequence);
        if from > to {
            return Vec::new();
        }
        (from..=to)
            .filter_map(|sequence| self.entry(sequence).cloned())
            .collect()
    }

    pub(crate) fn search_from(&self, log_id: LogId) -> Option<Vec<OpLogEntry>> {
        let last = self.last()?;
        if log_id.sequence > last.sequence || log_id.sequence < self.floor {
            return None;
        }
        let matching = self.entry(log_id.sequence)?;
        if matching.log_id.term == log_id.term {
            return Some(self.iterate(log_id.sequence, last.sequence));
        }
        let resume = (self.floor..=log_id.sequence)
            .rev()
            .find(|sequence| {
                self.entry(*sequence)
                    .is_some_and(|entry| entry.log_id.term <= log_id.term)
            })?;
        Some(self.iterate(resume, last.sequence))
    }

    pub(crate) fn remove_after(&mut self, log_id: LogId) -> (LogIdStatus, Change) {
        if log_id.sequence >= self.next_sequence() {
            return (LogIdStatus::Future, Change::Unchanged);
        }
        if self.entries.is_empty() || log_id.sequence < self.floor {
            self.entries.clear();
            self.floor = log_id.sequence + 1;
            return (LogIdStatus::TooOld, Change::Rewritten);
        }
        match self.entry(log_id.sequence) {
            Some(entry) if entry.log_id.term == log_id.term => {
                if self.truncate_from(log_id.sequence + 1) {
                    (LogIdStatus::Present, Change::Rewritten)
                } else {
                    (LogIdStatus::Present, Change::Unchanged)
                }
            }
            _ => (LogIdStatus::Invalid, Change::Unchanged),
        }
    }

    pub(crate) fn set_leader(&mut self, leader: bool, term: u64) {
        self.leader = leader;
        self.term = term;
    }

    pub(crate) fn prune_until(&mut self, sequence: u64) -> (usize, Change) {
        let mut removed = 0;
        while self.entries.len() > 1 {
            match self.entries.front() {
                Some(entry) if entry.log_id.sequence <= sequence => {
                    self.entries.pop_front();
                    self.floor += 1;
                    removed += 1;
                }
                _ => break,
            }
        }
        let change = if removed > 0 {
            Change::Rewritten
        } else {
            Change::Unchanged
        };
        (removed, change)
    }
}
