//! Aggregate Journal
//!
//! Append-only binary log of transfer snapshots backing [`JournalStateStore`].
//!
//! - 20-byte little-endian header per entry
//! - CRC32 checksum of the payload
//! - bincode-encoded [`TransferAggregate`] payloads
//! - `fsync` after every append (the durable write barrier)
//!
//! # Header Layout (20 bytes)
//!
//! ```text
//! ┌────────────┬───────────┬────────────────────────────────────┐
//! │ payload_len│ 4 bytes   │ Payload size                       │
//! │ entry_type │ 1 byte    │ Entry type (Snapshot)              │
//! │ version    │ 1 byte    │ Payload format version             │
//! │ reserved   │ 2 bytes   │ Zero                               │
//! │ seq_id     │ 8 bytes   │ Monotonic sequence                 │
//! │ checksum   │ 4 bytes   │ CRC32 of payload                   │
//! └────────────┴───────────┴────────────────────────────────────┘
//! ```
//!
//! Replay keeps the highest version per transfer. A torn final entry (crash
//! mid-append) is ignored; a checksum mismatch anywhere is an error. A failed
//! append truncates back to where its frame started, so later appends never
//! land behind a partial frame.

use async_trait::async_trait;
use crc32fast::Hasher;
use dashmap::DashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use super::error::StoreError;
use super::store::{StateStore, check_successor};
use super::types::{TransferAggregate, TransferRef};

/// Journal header size in bytes
pub const JOURNAL_HEADER_SIZE: usize = 20;

/// Current payload format version
const PAYLOAD_VERSION: u8 = 1;

/// Upper bound on a single snapshot payload
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// Journal entry types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntryType {
    Snapshot = 1,
}

impl TryFrom<u8> for JournalEntryType {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Snapshot),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown JournalEntryType: {}", value),
            )),
        }
    }
}

/// Journal entry header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub payload_len: u32,
    pub entry_type: u8,
    pub version: u8,
    pub seq_id: u64,
    pub checksum: u32,
}

impl JournalHeader {
    pub fn new(entry_type: JournalEntryType, seq_id: u64, payload: &[u8]) -> Self {
        Self {
            payload_len: payload.len() as u32,
            entry_type: entry_type as u8,
            version: PAYLOAD_VERSION,
            seq_id,
            checksum: crc32_checksum(payload),
        }
    }

    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[4] = self.entry_type;
        buf[5] = self.version;
        buf[8..16].copy_from_slice(&self.seq_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; JOURNAL_HEADER_SIZE]) -> Self {
        Self {
            payload_len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            entry_type: buf[4],
            version: buf[5],
            seq_id: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            checksum: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        }
    }

    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == crc32_checksum(payload)
    }
}

#[inline]
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

// ============================================================
// WRITER / READER
// ============================================================

/// File-like target of a [`JournalWriter`]
pub trait JournalSink: Write + Seek {
    fn set_len(&self, len: u64) -> io::Result<()>;
    fn sync_data(&self) -> io::Result<()>;
}

impl JournalSink for File {
    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }
}

/// Appends entries and syncs them to disk
pub struct JournalWriter<S: JournalSink = File> {
    sink: S,
    next_seq: u64,
    /// A failed append could not be rolled back; refuse writes until reopen
    broken: bool,
}

impl<S: JournalSink> JournalWriter<S> {
    pub fn new(sink: S, next_seq: u64) -> Self {
        Self {
            sink,
            next_seq,
            broken: false,
        }
    }

    /// Append one entry and `fsync`; returns its sequence number
    ///
    /// On error the sink is cut back to its length before the call and the
    /// sequence number is not consumed.
    pub fn append(&mut self, entry_type: JournalEntryType, payload: &[u8]) -> io::Result<u64> {
        if self.broken {
            return Err(io::Error::other(
                "journal tail unknown after failed rollback, reopen to recover",
            ));
        }

        let seq_id = self.next_seq;
        let header = JournalHeader::new(entry_type, seq_id, payload);
        let offset = self.sink.stream_position()?;

        let mut frame = Vec::with_capacity(JOURNAL_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        if let Err(e) = self.write_frame(&frame) {
            self.rollback(offset, seq_id);
            return Err(e);
        }

        self.next_seq += 1;
        Ok(seq_id)
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.sink.write_all(frame)?;
        self.sink.sync_data()
    }

    fn rollback(&mut self, offset: u64, seq_id: u64) {
        let rewound = self
            .sink
            .set_len(offset)
            .and_then(|()| self.sink.seek(SeekFrom::Start(offset)));
        match rewound {
            Ok(_) => warn!(offset, seq_id, "Journal append failed, partial frame removed"),
            Err(e) => {
                error!(offset, seq_id, error = %e, "Journal rollback failed, writer disabled");
                self.broken = true;
            }
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

/// A single journal entry (header + payload)
#[derive(Debug)]
pub struct JournalEntry {
    pub header: JournalHeader,
    pub payload: Vec<u8>,
}

/// Reads entries sequentially
pub struct JournalReader<R: Read> {
    reader: R,
    /// Bytes consumed by complete, verified entries
    consumed: u64,
}

impl<R: Read> JournalReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            consumed: 0,
        }
    }

    /// Read the next entry; `None` at EOF or at a torn final entry
    pub fn read_entry(&mut self) -> io::Result<Option<JournalEntry>> {
        let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
        match self.reader.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let header = JournalHeader::from_bytes(&header_buf);
        if header.payload_len > MAX_PAYLOAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "payload_len {} exceeds limit at seq_id={}",
                    header.payload_len, header.seq_id
                ),
            ));
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        match self.reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        if !header.verify_checksum(&payload) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "CRC32 checksum mismatch at seq_id={}, expected={}, got={}",
                    header.seq_id,
                    header.checksum,
                    crc32_checksum(&payload)
                ),
            ));
        }

        self.consumed += (JOURNAL_HEADER_SIZE + payload.len()) as u64;
        Ok(Some(JournalEntry { header, payload }))
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

// ============================================================
// JOURNAL-BACKED STATE STORE
// ============================================================

/// Durable [`StateStore`] over a single journal file
///
/// The in-memory index holds every version; the journal is the source of
/// truth and is replayed on open.
pub struct JournalStateStore {
    path: PathBuf,
    writer: Arc<Mutex<JournalWriter>>,
    versions: Arc<DashMap<TransferRef, Vec<TransferAggregate>>>,
}

impl JournalStateStore {
    /// Open (or create) the journal at `path` and replay it
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        let versions: DashMap<TransferRef, Vec<TransferAggregate>> = DashMap::new();
        let mut next_seq = 1;
        let mut valid_len = 0;

        if path.exists() {
            let mut reader = JournalReader::new(BufReader::new(File::open(&path)?));
            while let Some(entry) = reader.read_entry()? {
                JournalEntryType::try_from(entry.header.entry_type)?;
                let snapshot: TransferAggregate = bincode::deserialize(&entry.payload)?;
                versions
                    .entry(snapshot.transfer_ref)
                    .or_default()
                    .push(snapshot);
                next_seq = entry.header.seq_id + 1;
            }
            valid_len = reader.consumed();
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            warn!(
                path = %path.display(),
                torn_bytes = file_len - valid_len,
                "Truncating torn journal tail"
            );
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        for mut entry in versions.iter_mut() {
            entry.value_mut().sort_by_key(|t| t.version);
        }

        info!(
            path = %path.display(),
            transfers = versions.len(),
            next_seq = next_seq,
            "Journal replayed"
        );

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(JournalWriter::new(file, next_seq))),
            versions: Arc::new(versions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn latest_where(&self, pred: impl Fn(&TransferAggregate) -> bool) -> Vec<TransferAggregate> {
        let mut found: Vec<TransferAggregate> = self
            .versions
            .iter()
            .filter_map(|entry| entry.value().last().filter(|t| pred(t)).cloned())
            .collect();
        found.sort_by_key(|t| t.transfer_ref);
        found
    }
}

#[async_trait]
impl StateStore for JournalStateStore {
    async fn save(&self, snapshot: &TransferAggregate) -> Result<(), StoreError> {
        let payload = bincode::serialize(snapshot)?;
        let snapshot = snapshot.clone();
        let writer = Arc::clone(&self.writer);
        let versions = Arc::clone(&self.versions);

        // fsync blocks; the writer lock serializes check + append + index update
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut writer = writer
                .lock()
                .map_err(|_| StoreError::Unavailable("journal writer poisoned".into()))?;

            check_successor(
                versions
                    .get(&snapshot.transfer_ref)
                    .as_ref()
                    .and_then(|h| h.value().last()),
                &snapshot,
            )?;

            writer.append(JournalEntryType::Snapshot, &payload)?;
            versions
                .entry(snapshot.transfer_ref)
                .or_default()
                .push(snapshot);
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("journal write task failed: {e}")))?
    }

    async fn load(&self, transfer_ref: TransferRef) -> Result<Option<TransferAggregate>, StoreError> {
        Ok(self
            .versions
            .get(&transfer_ref)
            .and_then(|h| h.value().last().cloned()))
    }

    async fn find_incomplete(&self) -> Result<Vec<TransferAggregate>, StoreError> {
        Ok(self.latest_where(|t| !t.status.is_terminal()))
    }

    async fn find_reconciliation_required(&self) -> Result<Vec<TransferAggregate>, StoreError> {
        Ok(self.latest_where(|t| t.reconciliation_required))
    }

    async fn find_latest(&self) -> Result<Vec<TransferAggregate>, StoreError> {
        Ok(self.latest_where(|_| true))
    }

    async fn history(&self, transfer_ref: TransferRef) -> Result<Vec<TransferAggregate>, StoreError> {
        Ok(self
            .versions
            .get(&transfer_ref)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use crate::transfer::state::TransferStatus;
    use crate::transfer::types::{AccountId, LedgerTxId, StepName, TransferRequest};
    use rust_decimal::Decimal;
    use std::io::Cursor;

    fn new_aggregate() -> TransferAggregate {
        let req = TransferRequest::new(
            "client-7",
            AccountId::from("acc-a"),
            AccountId::from("acc-b"),
            Decimal::new(30050, 2),
            Currency::new("EUR").unwrap(),
        );
        TransferAggregate::new(TransferRef::new(), &req)
    }

    #[test]
    fn test_header_layout() {
        let payload = b"snapshot bytes";
        let header = JournalHeader::new(JournalEntryType::Snapshot, 42, payload);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), JOURNAL_HEADER_SIZE);
        assert_eq!(JournalHeader::from_bytes(&bytes), header);
        assert!(header.verify_checksum(payload));
        assert!(!header.verify_checksum(b"other bytes"));
    }

    #[test]
    fn test_reader_stops_at_torn_tail() {
        let payload = b"complete";
        let header = JournalHeader::new(JournalEntryType::Snapshot, 1, payload);
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(payload);
        // second entry cut mid-payload
        let header2 = JournalHeader::new(JournalEntryType::Snapshot, 2, b"never finished");
        buf.extend_from_slice(&header2.to_bytes());
        buf.extend_from_slice(b"never");

        let mut reader = JournalReader::new(Cursor::new(buf));
        let first = reader.read_entry().unwrap().unwrap();
        assert_eq!(first.payload, payload);
        assert!(reader.read_entry().unwrap().is_none());
        assert_eq!(reader.consumed(), (JOURNAL_HEADER_SIZE + payload.len()) as u64);
    }

    #[test]
    fn test_reader_detects_corruption() {
        let payload = b"test data";
        let header = JournalHeader::new(JournalEntryType::Snapshot, 1, payload);
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf[JOURNAL_HEADER_SIZE] ^= 0xFF;

        let mut reader = JournalReader::new(Cursor::new(buf));
        let err = reader.read_entry().unwrap_err();
        assert!(err.to_string().contains("CRC32 checksum mismatch"));
    }

    #[tokio::test]
    async fn test_replay_restores_latest_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.journal");

        let v0 = new_aggregate();
        let v1 = v0.transition(TransferStatus::Validating).unwrap();
        let v2 = v1.transition(TransferStatus::Validated).unwrap();
        let v3 = v2
            .transition(TransferStatus::DebitPending)
            .unwrap()
            .with_step_tx(StepName::Debit, LedgerTxId("ltx-9".into()));

        {
            let store = JournalStateStore::open(&path).unwrap();
            for v in [&v0, &v1, &v2, &v3] {
                store.save(v).await.unwrap();
            }
        }

        let reopened = JournalStateStore::open(&path).unwrap();
        let latest = reopened.load(v0.transfer_ref).await.unwrap().unwrap();
        assert_eq!(latest, v3);
        assert_eq!(latest.amount, Decimal::new(30050, 2));
        assert_eq!(reopened.history(v0.transfer_ref).await.unwrap().len(), 4);
        assert_eq!(reopened.find_incomplete().await.unwrap(), vec![v3.clone()]);

        // CAS continues from the replayed version
        let v4 = v3.transition(TransferStatus::DebitCompleted).unwrap();
        reopened.save(&v4).await.unwrap();
        assert!(reopened.save(&v4).await.is_err());
    }

    /// Disk that accepts `budget` more bytes, then reports ENOSPC
    struct FullDisk {
        file: File,
        budget: Option<usize>,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.budget {
                Some(0) => Err(io::Error::from_raw_os_error(28)),
                Some(left) => {
                    let n = self.file.write(&buf[..buf.len().min(left)])?;
                    self.budget = Some(left - n);
                    Ok(n)
                }
                None => self.file.write(buf),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl Seek for FullDisk {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.file.seek(pos)
        }
    }

    impl JournalSink for FullDisk {
        fn set_len(&self, len: u64) -> io::Result<()> {
            self.file.set_len(len)
        }

        fn sync_data(&self) -> io::Result<()> {
            self.file.sync_data()
        }
    }

    #[tokio::test]
    async fn test_failed_append_leaves_no_partial_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.journal");
        let v0 = new_aggregate();
        let v1 = v0.transition(TransferStatus::Validating).unwrap();

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        let mut writer = JournalWriter::new(FullDisk { file, budget: None }, 1);
        let first = bincode::serialize(&v0).unwrap();
        assert_eq!(writer.append(JournalEntryType::Snapshot, &first).unwrap(), 1);
        let good_len = std::fs::metadata(&path).unwrap().len();

        // header plus a few payload bytes reach the disk, then it fills up
        let second = bincode::serialize(&v1).unwrap();
        writer.get_mut().budget = Some(JOURNAL_HEADER_SIZE + 3);
        assert!(writer.append(JournalEntryType::Snapshot, &second).is_err());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(writer.next_seq(), 2);

        writer.get_mut().budget = None;
        assert_eq!(writer.append(JournalEntryType::Snapshot, &second).unwrap(), 2);
        drop(writer);

        let store = JournalStateStore::open(&path).unwrap();
        assert_eq!(store.load(v0.transfer_ref).await.unwrap(), Some(v1.clone()));
        assert_eq!(store.history(v0.transfer_ref).await.unwrap(), vec![v0, v1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_saves_keep_one_successor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.journal");
        let store = Arc::new(JournalStateStore::open(&path).unwrap());
        let v0 = new_aggregate();
        store.save(&v0).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let v1 = v0.transition(TransferStatus::Validating).unwrap();
                tokio::spawn(async move { store.save(&v1).await })
            })
            .collect();
        let mut won = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
        drop(store);

        let reopened = JournalStateStore::open(&path).unwrap();
        assert_eq!(reopened.history(v0.transfer_ref).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_torn_tail_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.journal");

        let v0 = new_aggregate();
        {
            let store = JournalStateStore::open(&path).unwrap();
            store.save(&v0).await.unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 11]).unwrap();
        }

        let store = JournalStateStore::open(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        let v1 = v0.transition(TransferStatus::Validating).unwrap();
        store.save(&v1).await.unwrap();
        drop(store);

        let store = JournalStateStore::open(&path).unwrap();
        assert_eq!(store.load(v0.transfer_ref).await.unwrap(), Some(v1));
    }
}
