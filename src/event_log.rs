use crate::types::Delivery;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub delivery: Delivery,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid snapshot {path}: {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid snapshot {path}: sequence numbers are not strictly increasing")]
    OutOfOrder { path: String },
}

/// Fixed-capacity, insertion-ordered log. Appending past capacity evicts
/// the oldest entry; sequence numbers keep increasing across evictions.
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<Arc<EventLogEntry>>,
    capacity: usize,
    next_seq: u64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 1,
        }
    }

    /// Load a previously persisted snapshot. A missing or unreadable file
    /// gives an empty log.
    pub fn restore(path: &Path, capacity: usize) -> Self {
        match load_snapshot(path) {
            Ok(Some(entries)) => {
                let log = Self::from_entries(entries, capacity);
                info!(
                    path = %path.display(),
                    entries = log.len(),
                    next_seq = log.next_seq,
                    "restored event log"
                );
                log
            }
            Ok(None) => Self::new(capacity),
            Err(e) => {
                warn!(error = %e, "could not restore event log; starting empty");
                Self::new(capacity)
            }
        }
    }

    fn from_entries(entries: Vec<EventLogEntry>, capacity: usize) -> Self {
        let mut log = Self::new(capacity);
        let skip = entries.len().saturating_sub(log.capacity);
        for entry in entries.into_iter().skip(skip) {
            log.next_seq = entry.seq + 1;
            log.entries.push_back(Arc::new(entry));
        }
        log
    }

    pub fn append(&mut self, delivery: Delivery) -> Arc<EventLogEntry> {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let entry = Arc::new(EventLogEntry {
            seq: self.next_seq,
            delivery,
        });
        self.next_seq += 1;
        self.entries.push_back(Arc::clone(&entry));
        entry
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<EventLogEntry>> {
        self.entries.iter().cloned().collect()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.entries.back().map(|e| e.seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn load_snapshot(path: &Path) -> Result<Option<Vec<EventLogEntry>>, PersistError> {
    let display = || path.display().to_string();
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Io {
                path: display(),
                source,
            })
        }
    };
    let entries: Vec<EventLogEntry> =
        serde_json::from_slice(&bytes).map_err(|source| PersistError::Serde {
            path: display(),
            source,
        })?;
    if entries.windows(2).any(|w| w[0].seq >= w[1].seq) {
        return Err(PersistError::OutOfOrder { path: display() });
    }
    Ok(Some(entries))
}

/// Replace `path` with the given entries as a JSON array: written to a
/// sibling temp file, synced, then renamed over the target.
pub fn save_snapshot(path: &Path, entries: &[Arc<EventLogEntry>]) -> Result<(), PersistError> {
    let io_err = |source| PersistError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let bytes = serde_json::to_vec_pretty(entries).map_err(|source| PersistError::Serde {
        path: path.display().to_string(),
        source,
    })?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    std::fs::rename(&tmp_path, path).map_err(io_err)
}
