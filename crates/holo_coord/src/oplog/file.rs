//! File-backed operation log.
//!
//! Entries are appended to `oplog.log` as `len (u32) | crc32 (u32) | payload`
//! records. Operations that remove entries rewrite the file through a
//! temporary file and a rename. `oplog.meta` keeps the sequence the log starts
//! at, which matters once the log was pruned or reset. On open, a torn or
//! corrupt tail (partial write before a crash) is discarded.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::{env, str::FromStr};

use anyhow::Context;

use super::{Change, LogCore, LogIdStatus, OpLogEntry, OperationLog};
use crate::codec::{checksum, put_bytes, put_u32, put_u64, read_bytes_at, read_u32_at, read_u64_at};
use crate::coord::{
    decode_node_request, encode_node_request, read_log_id, put_log_id, LogId, NodeRequest,
};

/// File name of the entry log within the log directory.
const OPLOG_FILE: &str = "oplog.log";
/// File name of the floor metadata within the log directory.
const OPLOG_META_FILE: &str = "oplog.meta";
/// Suffix of files written before being renamed into place.
const TMP_SUFFIX: &str = ".tmp";
/// Env var selecting the sync mode (`none`, `data`, `all`).
const SYNC_MODE_ENV: &str = "HOLO_COORD_OPLOG_SYNC";
/// Size of the `len | crc` record header.
const RECORD_HEADER_LEN: usize = 8;

/// How appended records are flushed to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Rely on OS buffering.
    None,
    /// `sync_data` after each write.
    Data,
    /// `sync_all` after each write.
    All,
}

impl SyncMode {
    /// Sync mode requested through `HOLO_COORD_OPLOG_SYNC`.
    pub fn from_env() -> Self {
        parse_sync_mode(env::var(SYNC_MODE_ENV).ok().as_deref())
    }
}

impl FromStr for SyncMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "none" | "buffer" => Ok(SyncMode::None),
            "data" | "sync_data" => Ok(SyncMode::Data),
            "all" | "sync_all" => Ok(SyncMode::All),
            other => anyhow::bail!("unknown operation log sync mode {other:?}"),
        }
    }
}

/// Parse the requested sync mode from a string.
fn parse_sync_mode(value: Option<&str>) -> SyncMode {
    match value {
        // Unknown strings default to the safest mode.
        Some(value) => SyncMode::from_str(value).unwrap_or(SyncMode::All),
        None => SyncMode::Data,
    }
}

struct FileState {
    core: LogCore,
    file: File,
    /// Set when the files could not be brought in line with `core`.
    poisoned: bool,
    #[cfg(test)]
    fail_writes: bool,
}

/// Operation log persisted under one directory.
pub struct FileOpLog {
    dir: PathBuf,
    sync: SyncMode,
    state: Mutex<FileState>,
}

impl FileOpLog {
    /// Open (or create) a log directory with the sync mode from the environment.
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::open_with_sync(dir, SyncMode::from_env())
    }

    pub fn open_with_sync(dir: impl AsRef<Path>, sync: SyncMode) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create operation log dir {}", dir.display()))?;
        let log_path = dir.join(OPLOG_FILE);
        let meta_floor = read_meta(&dir.join(OPLOG_META_FILE))?;
        let (mut entries, mut clean) = read_records(&log_path)?;

        let floor = entries
            .first()
            .map(|entry| entry.log_id.sequence)
            .unwrap_or(meta_floor);
        // Retained entries must be contiguous; anything after a hole is dropped.
        let contiguous = entries
            .iter()
            .enumerate()
            .take_while(|(index, entry)| entry.log_id.sequence == floor + *index as u64)
            .count();
        if contiguous < entries.len() {
            entries.truncate(contiguous);
            clean = false;
        }

        let core = LogCore::restore(floor, entries);
        if !clean {
            tracing::warn!(
                dir = %dir.display(),
                retained = core.entries().count(),
                "discarding damaged operation log tail"
            );
            rewrite_files(&dir, &core, sync)?;
        }
        let file = open_append(&log_path)?;
        Ok(Self {
            dir,
            sync,
            state: Mutex::new(FileState {
                core,
                file,
                poisoned: false,
                #[cfg(test)]
                fail_writes: false,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut FileState) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("operation log lock poisoned"))?;
        anyhow::ensure!(
            !state.poisoned,
            "operation log {} is out of step with its files; reopen it",
            self.dir.display()
        );
        f(&mut state)
    }

    /// Bring the files in line with the core after an operation.
    ///
    /// `term` is the core's term before the operation. A failed append is
    /// taken back from both the core and the file; a failed rewrite poisons
    /// the log until it is reopened from disk.
    fn persist(&self, state: &mut FileState, change: Change, term: u64) -> anyhow::Result<()> {
        match change {
            Change::Unchanged => Ok(()),
            Change::Appended => {
                let len = match state.file.metadata() {
                    Ok(metadata) => metadata.len(),
                    Err(err) => {
                        state.core.undo_append(term);
                        return Err(err).context("stat operation log");
                    }
                };
                let Err(err) = self.append_tail(state) else {
                    return Ok(());
                };
                state.core.undo_append(term);
                if let Err(truncate) = state.file.set_len(len) {
                    tracing::error!(
                        dir = %self.dir.display(),
                        error = ?truncate,
                        "cannot truncate operation log after failed append"
                    );
                    state.poisoned = true;
                }
                Err(err)
            }
            Change::Rewritten => {
                let rewritten = self.rewrite(state);
                if rewritten.is_err() {
                    tracing::error!(dir = %self.dir.display(), "operation log rewrite failed");
                    state.poisoned = true;
                }
                rewritten
            }
        }
    }

    fn append_tail(&self, state: &mut FileState) -> anyhow::Result<()> {
        let entry = state
            .core
            .tail()
            .ok_or_else(|| anyhow::anyhow!("appended entry missing from log"))?;
        let payload = encode_record(entry);
        #[cfg(test)]
        if state.fail_writes {
            // Half a record, as an interrupted write leaves it.
            state.file.write_all(&payload[..payload.len() / 2])?;
            anyhow::bail!("append operation log: injected failure");
        }
        write_record(&mut state.file, &payload).context("append operation log")?;
        sync_file(&state.file, self.sync)
    }

    fn rewrite(&self, state: &mut FileState) -> anyhow::Result<()> {
        #[cfg(test)]
        if state.fail_writes {
            anyhow::bail!("rewrite operation log: injected failure");
        }
        rewrite_files(&self.dir, &state.core, self.sync)?;
        state.file = open_append(&self.dir.join(OPLOG_FILE))?;
        Ok(())
    }
}

impl OperationLog for FileOpLog {
    fn log(&self, request: &NodeRequest) -> anyhow::Result<LogId> {
        self.with_state(|state| {
            let term = state.core.term();
            let (log_id, change) = state.core.log(request)?;
            self.persist(state, change, term)?;
            Ok(log_id)
        })
    }

    fn log_received(&self, log_id: LogId, request: &NodeRequest) -> anyhow::Result<bool> {
        self.with_state(|state| {
            let term = state.core.term();
            let (accepted, change) = state.core.log_received(log_id, request)?;
            self.persist(state, change, term)?;
            Ok(accepted)
        })
    }

    fn last_persistent_log(&self) -> anyhow::Result<Option<LogId>> {
        self.with_state(|state| Ok(state.core.last()))
    }

    fn iterate(&self, from: u64, to: u64) -> anyhow::Result<Vec<OpLogEntry>> {
        self.with_state(|state| Ok(state.core.iterate(from, to)))
    }

    fn search_from(&self, log_id: LogId) -> anyhow::Result<Option<Vec<OpLogEntry>>> {
        self.with_state(|state| Ok(state.core.search_from(log_id)))
    }

    fn remove_after(&self, log_id: LogId) -> anyhow::Result<LogIdStatus> {
        self.with_state(|state| {
            let term = state.core.term();
            let (status, change) = state.core.remove_after(log_id);
            self.persist(state, change, term)?;
            Ok(status)
        })
    }

    fn set_leader(&self, leader: bool, term: u64) -> anyhow::Result<()> {
        self.with_state(|state| {
            state.core.set_leader(leader, term);
            Ok(())
        })
    }

    fn prune_until(&self, sequence: u64) -> anyhow::Result<usize> {
        self.with_state(|state| {
            let term = state.core.term();
            let (removed, change) = state.core.prune_until(sequence);
            self.persist(state, change, term)?;
            Ok(removed)
        })
    }
}

fn encode_record(entry: &OpLogEntry) -> Vec<u8> {
    let mut buf = Vec::new();
    put_log_id(&mut buf, &entry.log_id);
    put_bytes(&mut buf, &encode_node_request(&entry.request));
    buf
}

fn decode_record(payload: &[u8]) -> anyhow::Result<OpLogEntry> {
    let mut offset = 0;
    let log_id = read_log_id(payload, &mut offset)?;
    let request = decode_node_request(&read_bytes_at(payload, &mut offset)?)?;
    anyhow::ensure!(offset == payload.len(), "operation log record has trailing bytes");
    Ok(OpLogEntry { log_id, request })
}

/// Append one length-prefixed, checksummed record.
fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    put_u32(&mut record, payload.len() as u32);
    put_u32(&mut record, checksum(payload));
    record.extend_from_slice(payload);
    file.write_all(&record)
}

/// Read every intact record. The flag is false when a damaged tail was found.
fn read_records(path: &Path) -> anyhow::Result<(Vec<OpLogEntry>, bool)> {
    let data = match fs::read(path) {
        Ok(data) => data,
        // Missing log means nothing to restore.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), true)),
        Err(err) => {
            return Err(err).with_context(|| format!("read operation log {}", path.display()))
        }
    };
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        if data.len() - offset < RECORD_HEADER_LEN {
            return Ok((entries, false));
        }
        let len = read_u32_at(&data, &mut offset)? as usize;
        let expected_crc = read_u32_at(&data, &mut offset)?;
        if data.len() - offset < len {
            return Ok((entries, false));
        }
        let payload = &data[offset..offset + len];
        offset += len;
        if checksum(payload) != expected_crc {
            return Ok((entries, false));
        }
        match decode_record(payload) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::warn!(error = ?err, "undecodable operation log record");
                return Ok((entries, false));
            }
        }
    }
    Ok((entries, true))
}

fn read_meta(path: &Path) -> anyhow::Result<u64> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let mut offset = 0;
    let floor = read_u64_at(&data, &mut offset).context("operation log meta")?;
    let expected = read_u32_at(&data, &mut offset).context("operation log meta")?;
    anyhow::ensure!(
        checksum(&data[..8]) == expected,
        "operation log meta checksum mismatch"
    );
    Ok(floor)
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open operation log {}", path.display()))
}

fn sync_file(file: &File, mode: SyncMode) -> anyhow::Result<()> {
    match mode {
        SyncMode::None => Ok(()),
        SyncMode::Data => file.sync_data().context("sync operation log"),
        SyncMode::All => file.sync_all().context("sync operation log"),
    }
}

/// Write `data` next to `path` and rename it into place.
fn replace_file(path: &Path, data: &[u8], sync: SyncMode) -> anyhow::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp_name);
    let mut file = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    file.write_all(data)
        .with_context(|| format!("write {}", tmp.display()))?;
    sync_file(&file, sync)?;
    fs::rename(&tmp, path).with_context(|| format!("rename {}", tmp.display()))?;
    Ok(())
}

/// Rebuild both files from the in-memory log.
fn rewrite_files(dir: &Path, core: &LogCore, sync: SyncMode) -> anyhow::Result<()> {
    let mut log = Vec::new();
    for entry in core.entries() {
        let payload = encode_record(entry);
        put_u32(&mut log, payload.len() as u32);
        put_u32(&mut log, checksum(&payload));
        log.extend_from_slice(&payload);
    }
    replace_file(&dir.join(OPLOG_FILE), &log, sync)?;

    let mut meta = Vec::with_capacity(12);
    put_u64(&mut meta, core.floor());
    let crc = checksum(&meta);
    put_u32(&mut meta, crc);
    replace_file(&dir.join(OPLOG_META_FILE), &meta, sync)
}
