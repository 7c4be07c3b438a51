use crate::engine::TransitionArtifact;
use crate::error::{CustodyError, Result};
use crate::id::Txid;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

// [u64 LE length][blake3 checksum][bincode entry]
const LEN_BYTES: usize = 8;
const CHECKSUM_BYTES: usize = 32;

/// Entry type in the broadcast journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// An artifact was accepted into the queue
    Enqueued(TransitionArtifact),

    /// The network answered for an artifact
    Resolved { txid: Txid, accepted: bool },
}

/// Append-only log backing the broadcast queue
pub trait QueueJournal: Send + Sync {
    /// Durably append one entry
    fn append(&self, entry: &JournalEntry) -> Result<()>;

    /// Every readable entry, oldest first
    fn entries(&self) -> Result<Vec<JournalEntry>>;

    /// Replace the whole log with `entries`
    fn rewrite(&self, entries: &[JournalEntry]) -> Result<()>;

    fn clear(&self) -> Result<()> {
        self.rewrite(&[])
    }
}

/// Artifacts enqueued and not yet resolved, in queue order
pub fn unresolved(entries: &[JournalEntry]) -> Vec<TransitionArtifact> {
    let mut pending: Vec<TransitionArtifact> = Vec::new();
    for entry in entries {
        match entry {
            JournalEntry::Enqueued(artifact) => {
                if !pending.iter().any(|a| a.txid == artifact.txid) {
                    pending.push(artifact.clone());
                }
            }
            JournalEntry::Resolved { txid, .. } => pending.retain(|a| a.txid != *txid),
        }
    }
    pending
}

/// Load the unresolved artifacts and compact the journal down to them
pub fn replay(journal: &dyn QueueJournal) -> Result<Vec<TransitionArtifact>> {
    let entries = journal.entries()?;
    let pending = unresolved(&entries);

    let compacted: Vec<JournalEntry> = pending
        .iter()
        .cloned()
        .map(JournalEntry::Enqueued)
        .collect();
    if compacted.len() != entries.len() {
        journal.rewrite(&compacted)?;
        debug!(
            "Compacted broadcast journal from {} to {} entries",
            entries.len(),
            compacted.len()
        );
    }
    Ok(pending)
}

fn lock_error<T>(e: std::sync::PoisonError<T>) -> CustodyError {
    CustodyError::Journal(format!("Failed to acquire lock: {}", e))
}

fn encode_frame(entry: &JournalEntry) -> Result<Vec<u8>> {
    let serialized = bincode::serialize(entry)?;
    let mut frame = Vec::with_capacity(LEN_BYTES + CHECKSUM_BYTES + serialized.len());
    frame.extend_from_slice(&(serialized.len() as u64).to_le_bytes());
    frame.extend_from_slice(blake3::hash(&serialized).as_bytes());
    frame.extend_from_slice(&serialized);
    Ok(frame)
}

/// Decode frames until the data runs out or stops making sense
fn decode_frames(data: &[u8], path: &Path) -> Vec<JournalEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let header_end = offset + LEN_BYTES + CHECKSUM_BYTES;
        let Some(header) = data.get(offset..header_end) else {
            break;
        };
        let mut len_buf = [0u8; LEN_BYTES];
        len_buf.copy_from_slice(&header[..LEN_BYTES]);
        let entry_len = u64::from_le_bytes(len_buf) as usize;

        let Some(body) = header_end
            .checked_add(entry_len)
            .and_then(|end| data.get(header_end..end))
        else {
            break;
        };
        if blake3::hash(body).as_bytes()[..] != header[LEN_BYTES..] {
            break;
        }
        match bincode::deserialize::<JournalEntry>(body) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        offset = header_end + entry_len;
    }

    if offset < data.len() {
        warn!(
            "Discarding {} trailing bytes of broadcast journal {}",
            data.len() - offset,
            path.display()
        );
    }
    entries
}

/// A file-based broadcast journal
pub struct FileQueueJournal {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl FileQueueJournal {
    /// Open or create the journal at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = Self::open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(|e| CustodyError::Journal(format!("Failed to open journal file: {}", e)))
    }
}

impl QueueJournal for FileQueueJournal {
    fn append(&self, entry: &JournalEntry) -> Result<()> {
        let frame = encode_frame(entry)?;
        let mut file = self.file.lock().map_err(lock_error)?;
        file.write_all(&frame)?;
        file.flush()?;
        file.get_ref().sync_data()?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<JournalEntry>> {
        // hold the writer so nothing is appended mid-read
        let _file = self.file.lock().map_err(lock_error)?;
        let mut data = Vec::new();
        File::open(&self.path)?.read_to_end(&mut data)?;
        Ok(decode_frames(&data, &self.path))
    }

    fn rewrite(&self, entries: &[JournalEntry]) -> Result<()> {
        let mut file = self.file.lock().map_err(lock_error)?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for entry in entries {
                tmp.write_all(&encode_frame(entry)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        *file = BufWriter::new(Self::open_append(&self.path)?);
        Ok(())
    }
}

/// Process-local journal; nothing survives a restart
#[derive(Default)]
pub struct MemoryQueueJournal {
    entries: Mutex<Vec<JournalEntry>>,
    failing: AtomicBool,
}

impl MemoryQueueJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every append while true, as a full disk would
    pub fn fail_appends(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

impl QueueJournal for MemoryQueueJournal {
    fn append(&self, entry: &JournalEntry) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CustodyError::Journal("memory journal refused append".to_string()));
        }
        self.entries.lock().map_err(lock_error)?.push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<JournalEntry>> {
        Ok(self.entries.lock().map_err(lock_error)?.clone())
    }

    fn rewrite(&self, entries: &[JournalEntry]) -> Result<()> {
        *self.entries.lock().map_err(lock_error)? = entries.to_vec();
        Ok(())
    }
}
