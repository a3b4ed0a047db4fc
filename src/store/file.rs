//! File-backed redo store
//!
//! Records live in an append-only file. Each change is one frame:
//! - 4-byte little-endian body length
//! - first 4 bytes of the body's SHA-256
//! - bincode-encoded [`StoreEntry`]
//!
//! Opening the file replays every frame into an in-memory index. A torn frame at
//! the end of the file (short, or failing its checksum) is the remains of a write
//! interrupted by a crash: it is logged and cut off.
//!
//! A write that fails is cut back to the last intact frame before the error is
//! returned, so the file never holds a frame the caller was told failed, and
//! later frames never land behind a broken one.
//!
//! Deleted and replaced records leave dead frames behind. Once enough have
//! accumulated the live records are written to a temporary file in the same
//! directory, which then atomically replaces the redo file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{EtxError, Result};
use crate::etx::Redo;
use super::RedoStore;

const HEADER_LEN: usize = 8;

/// Configuration for the file redo store
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// fsync after every write. Turning this off gives up durability across
    /// power loss, keeping it only across process crashes.
    pub sync_writes: bool,
    /// Rewrite the file once this many dead frames have accumulated
    /// (and they outnumber the live records)
    pub compact_after_dead: usize,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            sync_writes: true,
            compact_after_dead: 1024,
        }
    }
}

impl FileStoreConfig {
    /// No fsync, for tests and scratch data
    pub fn volatile() -> Self {
        Self {
            sync_writes: false,
            ..Default::default()
        }
    }
}

/// One frame of the redo file
#[derive(Debug, Clone, Serialize, Deserialize)]
enum StoreEntry {
    Put(Redo),
    Delete(i64),
}

struct FileState {
    file: File,
    records: BTreeMap<i64, Redo>,
    dead_frames: usize,
    /// File length up to the last frame written without error
    valid_len: u64,
    /// Set when a failed write could not be cut back; the store refuses
    /// further writes
    broken: bool,
    #[cfg(test)]
    fault: Fault,
}

/// Failure to inject into the next append
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    /// Only half of the frame reaches the file
    ShortWrite,
    /// The whole frame is written, then the sync fails
    Sync,
}

/// Durable redo store in a single append-only file
pub struct FileRedoStore {
    path: PathBuf,
    config: FileStoreConfig,
    state: Mutex<FileState>,
}

impl FileRedoStore {
    /// Open or create the redo file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(path, FileStoreConfig::default())
    }

    pub fn open_with_config(path: impl Into<PathBuf>, config: FileStoreConfig) -> Result<Self> {
        let path = path.into();

        let replay = if path.exists() {
            read_log(&fs::read(&path)?)
        } else {
            Replay::default()
        };

        if path.exists() && fs::metadata(&path)?.len() > replay.valid_len {
            log::warn!(
                "Cutting torn tail from redo file {} at byte {}",
                path.display(),
                replay.valid_len
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!(
            "Opened redo file {}: {} pending records",
            path.display(),
            replay.records.len()
        );

        Ok(Self {
            path,
            config,
            state: Mutex::new(FileState {
                file,
                records: replay.records,
                dead_frames: replay.dead_frames,
                valid_len: replay.valid_len,
                broken: false,
                #[cfg(test)]
                fault: Fault::None,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of pending records
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Rewrite the file with only the live records
    pub fn compact(&self) -> Result<()> {
        let mut state = self.lock();
        self.compact_locked(&mut state)
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, state: &mut FileState, entry: &StoreEntry) -> Result<()> {
        if state.broken {
            return Err(EtxError::Store(format!(
                "redo file {} is unusable after a failed write",
                self.path.display()
            )));
        }

        let frame = encode_frame(entry)?;
        match write_frame(state, &frame, self.config.sync_writes) {
            Ok(()) => {
                state.valid_len += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "Write to redo file {} failed, cutting back to byte {}: {}",
                    self.path.display(),
                    state.valid_len,
                    e
                );
                if let Err(cut) = cut_back(&mut state.file, state.valid_len) {
                    log::error!(
                        "Cannot cut back redo file {}: {}",
                        self.path.display(),
                        cut
                    );
                    state.broken = true;
                }
                Err(e.into())
            }
        }
    }

    fn maybe_compact(&self, state: &mut FileState) {
        if state.dead_frames >= self.config.compact_after_dead
            && state.dead_frames > state.records.len()
        {
            if let Err(e) = self.compact_locked(state) {
                // the old file is still intact, try again after more writes
                log::warn!("Redo file compaction failed for {}: {}", self.path.display(), e);
            }
        }
    }

    fn compact_locked(&self, state: &mut FileState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut tmp = NamedTempFile::new_in(&dir)?;
        let mut len = 0u64;
        for redo in state.records.values() {
            let frame = encode_frame(&StoreEntry::Put(redo.clone()))?;
            tmp.write_all(&frame)?;
            len += frame.len() as u64;
        }
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        // the handle moves with the rename, so there is no reopen to fail,
        // and its position is already at the end of the frames just written
        state.file = tmp.persist(&self.path)?;
        state.valid_len = len;
        state.broken = false;
        log::debug!(
            "Compacted redo file {}: dropped {} dead frames, {} records kept",
            self.path.display(),
            state.dead_frames,
            state.records.len()
        );
        state.dead_frames = 0;
        Ok(())
    }
}

impl RedoStore for FileRedoStore {
    fn all(&self) -> Result<Vec<Redo>> {
        Ok(self.lock().records.values().cloned().collect())
    }

    fn delete_id(&self, id: i64) -> Result<()> {
        let mut state = self.lock();
        if !state.records.contains_key(&id) {
            return Ok(());
        }
        self.append(&mut state, &StoreEntry::Delete(id))?;
        state.records.remove(&id);
        // the record's put frame and this delete frame
        state.dead_frames += 2;
        self.maybe_compact(&mut state);
        Ok(())
    }

    fn for_manager(&self, manager: &str, before: i64) -> Result<Vec<Redo>> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|r| r.manager == manager && r.tx < before)
            .cloned()
            .collect())
    }

    fn get_if(&self, id: i64) -> Result<Option<Redo>> {
        Ok(self.lock().records.get(&id).cloned())
    }

    fn insert(&self, redo: &Redo) -> Result<()> {
        let mut state = self.lock();
        if state.records.contains_key(&redo.id) {
            return Err(EtxError::duplicate_record(redo.id));
        }
        self.append(&mut state, &StoreEntry::Put(redo.clone()))?;
        state.records.insert(redo.id, redo.clone());
        Ok(())
    }

    fn update(&self, redo: &Redo) -> Result<()> {
        let mut state = self.lock();
        if !state.records.contains_key(&redo.id) {
            return Err(EtxError::missing_record(redo.id));
        }
        self.append(&mut state, &StoreEntry::Put(redo.clone()))?;
        state.records.insert(redo.id, redo.clone());
        state.dead_frames += 1;
        self.maybe_compact(&mut state);
        Ok(())
    }
}

/// Write one frame, then flush and optionally sync it
fn write_frame(state: &mut FileState, frame: &[u8], sync: bool) -> io::Result<()> {
    #[cfg(test)]
    {
        match std::mem::replace(&mut state.fault, Fault::None) {
            Fault::None => {}
            Fault::ShortWrite => {
                state.file.write_all(&frame[..frame.len() / 2])?;
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
            }
            Fault::Sync => {
                state.file.write_all(frame)?;
                return Err(io::Error::new(io::ErrorKind::Other, "sync failed"));
            }
        }
    }

    state.file.write_all(frame)?;
    state.file.flush()?;
    if sync {
        state.file.sync_data()?;
    }
    Ok(())
}

/// Truncate the file to `len` and put the write position there
fn cut_back(file: &mut File, len: u64) -> io::Result<()> {
    file.set_len(len)?;
    file.seek(SeekFrom::Start(len))?;
    file.sync_data()
}

#[derive(Default)]
struct Replay {
    records: BTreeMap<i64, Redo>,
    dead_frames: usize,
    /// Length of the file up to the last intact frame
    valid_len: u64,
}

fn checksum(body: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(body);
    [digest[0], digest[1], digest[2], digest[3]]
}

fn encode_frame(entry: &StoreEntry) -> Result<Bytes> {
    let body = bincode::serialize(entry)?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_u32_le(body.len() as u32);
    frame.put_slice(&checksum(&body));
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Replay the frames of a redo file
fn read_log(data: &[u8]) -> Replay {
    let mut replay = Replay::default();
    let mut offset = 0usize;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_LEN {
            log::warn!("Redo file ends with a partial frame header at byte {}", offset);
            break;
        }

        let mut header = &rest[..HEADER_LEN];
        let len = header.get_u32_le() as usize;
        let mut sum = [0u8; 4];
        header.copy_to_slice(&mut sum);

        if rest.len() < HEADER_LEN + len {
            log::warn!("Redo file ends with a partial frame at byte {}", offset);
            break;
        }
        let body = &rest[HEADER_LEN..HEADER_LEN + len];
        if checksum(body) != sum {
            log::warn!("Redo frame at byte {} fails its checksum", offset);
            break;
        }
        offset += HEADER_LEN + len;
        replay.valid_len = offset as u64;

        let entry: StoreEntry = match bincode::deserialize(body) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Skipping malformed redo frame: {}", e);
                replay.dead_frames += 1;
                continue;
            }
        };

        match entry {
            StoreEntry::Put(redo) => {
                if replay.records.insert(redo.id, redo).is_some() {
                    replay.dead_frames += 1;
                }
            }
            StoreEntry::Delete(id) => {
                replay.dead_frames += if replay.records.remove(&id).is_some() { 2 } else { 1 };
            }
        }
    }

    replay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etx::RedoKind;
    use tempfile::tempdir;

    fn redo(id: i64, tx: i64, manager: &str) -> Redo {
        Redo {
            id,
            tx,
            manager: manager.to_string(),
            kind: RedoKind::Timed,
            delay: 60,
            op_type: 3,
            operation: format!(r#"{{"n":{}}}"#, id).into_bytes(),
        }
    }

    #[test]
    fn test_file_store_config_default() {
        let config = FileStoreConfig::default();
        assert!(config.sync_writes);
        assert_eq!(config.compact_after_dead, 1024);
        assert!(!FileStoreConfig::volatile().sync_writes);
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");

        {
            let store = FileRedoStore::open(&path).unwrap();
            store.insert(&redo(1, 100, "uploader")).unwrap();
            store.insert(&redo(2, 100, "uploader")).unwrap();
            store.insert(&redo(3, 200, "users")).unwrap();
            store.delete_id(2).unwrap();
        }

        let store = FileRedoStore::open(&path).unwrap();
        let ids: Vec<i64> = store.all().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(store.get_if(3).unwrap(), Some(redo(3, 200, "users")));
    }

    #[test]
    fn test_update_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");

        {
            let store = FileRedoStore::open(&path).unwrap();
            store.insert(&redo(1, 100, "uploader")).unwrap();
            let mut changed = redo(1, 100, "uploader");
            changed.delay = 5;
            store.update(&changed).unwrap();
            assert!(store.update(&redo(9, 100, "uploader")).is_err());
        }

        let store = FileRedoStore::open(&path).unwrap();
        assert_eq!(store.get_if(1).unwrap().unwrap().delay, 5);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let temp_dir = tempdir().unwrap();
        let store = FileRedoStore::open(temp_dir.path().join("etx.redo")).unwrap();
        store.insert(&redo(1, 100, "a")).unwrap();
        assert!(store.insert(&redo(1, 100, "a")).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_missing_writes_nothing() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");
        let store = FileRedoStore::open(&path).unwrap();
        store.delete_id(42).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_torn_tail_is_cut() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");

        {
            let store = FileRedoStore::open(&path).unwrap();
            store.insert(&redo(1, 100, "a")).unwrap();
            store.insert(&redo(2, 100, "a")).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();

        // half of a third frame, as left by a crash mid-write
        let frame = encode_frame(&StoreEntry::Put(redo(3, 100, "a"))).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let store = FileRedoStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        // the store keeps working after the cut
        store.insert(&redo(3, 100, "a")).unwrap();
        drop(store);
        assert_eq!(FileRedoStore::open(&path).unwrap().len(), 3);
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");

        {
            let store = FileRedoStore::open(&path).unwrap();
            store.insert(&redo(1, 100, "a")).unwrap();
            store.insert(&redo(2, 100, "a")).unwrap();
        }

        // flip a byte in the last frame's body
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let store = FileRedoStore::open(&path).unwrap();
        let ids: Vec<i64> = store.all().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_compaction_keeps_live_records() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");
        let config = FileStoreConfig {
            sync_writes: false,
            compact_after_dead: 8,
        };

        {
            let store = FileRedoStore::open_with_config(&path, config.clone()).unwrap();
            for id in 1..=20 {
                store.insert(&redo(id, 100, "a")).unwrap();
            }
            for id in 1..=18 {
                store.delete_id(id).unwrap();
            }
            assert_eq!(store.len(), 2);
        }

        // 20 puts and 18 deletes uncompacted would be 38 frames
        let data = fs::read(&path).unwrap();
        let frame_len = encode_frame(&StoreEntry::Put(redo(19, 100, "a"))).unwrap().len();
        assert!(data.len() < 10 * frame_len);

        let store = FileRedoStore::open_with_config(&path, config).unwrap();
        let ids: Vec<i64> = store.all().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![19, 20]);
    }

    #[test]
    fn test_explicit_compact() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");
        let store = FileRedoStore::open(&path).unwrap();
        store.insert(&redo(1, 100, "a")).unwrap();
        store.insert(&redo(2, 100, "a")).unwrap();
        store.delete_id(1).unwrap();

        store.compact().unwrap();
        let single = encode_frame(&StoreEntry::Put(redo(2, 100, "a"))).unwrap().len() as u64;
        assert_eq!(fs::metadata(&path).unwrap().len(), single);

        store.insert(&redo(3, 100, "a")).unwrap();
        drop(store);
        assert_eq!(FileRedoStore::open(&path).unwrap().len(), 2);
    }

    fn ids(store: &FileRedoStore) -> Vec<i64> {
        store.all().unwrap().iter().map(|r| r.id).collect()
    }

    fn inject(store: &FileRedoStore, fault: Fault) {
        store.lock().fault = fault;
    }

    #[test]
    fn test_short_write_is_cut_back() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");

        {
            let store = FileRedoStore::open(&path).unwrap();
            store.insert(&redo(1, 100, "a")).unwrap();

            inject(&store, Fault::ShortWrite);
            assert!(store.insert(&redo(2, 100, "a")).is_err());
            assert_eq!(store.get_if(2).unwrap(), None);

            // later writes land after the last intact frame
            store.insert(&redo(3, 100, "a")).unwrap();
            store.insert(&redo(4, 100, "a")).unwrap();
        }

        let store = FileRedoStore::open(&path).unwrap();
        assert_eq!(ids(&store), vec![1, 3, 4]);
    }

    #[test]
    fn test_failed_sync_leaves_no_frame() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");

        {
            let store = FileRedoStore::open(&path).unwrap();
            store.insert(&redo(1, 100, "a")).unwrap();
            let intact = fs::metadata(&path).unwrap().len();

            inject(&store, Fault::Sync);
            assert!(store.insert(&redo(2, 100, "a")).is_err());
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);

            // a delete that reported failure must not take effect either
            inject(&store, Fault::Sync);
            assert!(store.delete_id(1).is_err());
            assert!(store.get_if(1).unwrap().is_some());
        }

        let store = FileRedoStore::open(&path).unwrap();
        assert_eq!(ids(&store), vec![1]);
    }

    #[test]
    fn test_writes_after_compaction_reach_the_new_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("etx.redo");

        {
            let store = FileRedoStore::open(&path).unwrap();
            for id in 1..=4 {
                store.insert(&redo(id, 100, "a")).unwrap();
            }
            store.delete_id(1).unwrap();
            store.delete_id(2).unwrap();
            store.compact().unwrap();

            store.insert(&redo(5, 100, "a")).unwrap();
            inject(&store, Fault::ShortWrite);
            assert!(store.insert(&redo(6, 100, "a")).is_err());
            store.delete_id(3).unwrap();
        }

        let store = FileRedoStore::open(&path).unwrap();
        assert_eq!(ids(&store), vec![4, 5]);
    }

    #[test]
    fn test_for_manager() {
        let temp_dir = tempdir().unwrap();
        let store = FileRedoStore::open(temp_dir.path().join("etx.redo")).unwrap();
        store.insert(&redo(1, 100, "uploader")).unwrap();
        store.insert(&redo(2, 300, "uploader")).unwrap();
        store.insert(&redo(3, 100, "users")).unwrap();

        let aged = store.for_manager("uploader", 200).unwrap();
        assert_eq!(aged.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);
    }
}
