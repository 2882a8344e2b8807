use crate::event_log::{save_snapshot, EventLog, EventLogEntry, PersistError};
use crate::types::Delivery;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a subscriber's stream yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Feed {
    Entry(Arc<EventLogEntry>),
    /// Nothing arrived within the idle interval.
    Keepalive,
}

struct Hub {
    log: EventLog,
    subscribers: HashMap<u64, mpsc::Sender<Arc<EventLogEntry>>>,
    next_id: u64,
    /// Highest sequence number known to be on disk.
    persisted_seq: Option<u64>,
}

struct Shared {
    hub: Mutex<Hub>,
    backlog: usize,
    /// Held for the whole of a snapshot write, including its blocking part.
    persist_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Owns the event log and fans every appended entry out to live
/// subscribers. Appending and registering share one lock, so a new
/// subscriber sees each entry exactly once: either in its replay or live.
#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    /// `backlog` bounds how far a subscriber may fall behind live traffic on
    /// top of its replay before it is disconnected.
    pub fn new(log: EventLog, backlog: usize) -> Self {
        let persisted_seq = log.last_seq();
        Self {
            shared: Arc::new(Shared {
                hub: Mutex::new(Hub {
                    log,
                    subscribers: HashMap::new(),
                    next_id: 1,
                    persisted_seq,
                }),
                backlog: backlog.max(1),
                persist_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    pub fn publish(&self, delivery: Delivery) -> Arc<EventLogEntry> {
        let mut hub = self.shared.hub.lock();
        let entry = hub.log.append(delivery);

        hub.subscribers.retain(|id, tx| match tx.try_send(Arc::clone(&entry)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = id, seq = entry.seq, "subscriber queue full; disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "subscriber gone");
                false
            }
        });

        debug!(
            seq = entry.seq,
            subscribers = hub.subscribers.len(),
            "published event"
        );
        entry
    }

    pub fn subscribe(&self) -> Subscriber {
        let mut hub = self.shared.hub.lock();
        let (tx, rx) = mpsc::channel(hub.log.capacity() + self.shared.backlog);

        // The queue is sized to hold the whole log, so replay cannot overflow.
        let replay = hub.log.snapshot();
        let replayed = replay.len();
        for entry in replay {
            let _ = tx.try_send(entry);
        }

        let id = hub.next_id;
        hub.next_id += 1;
        hub.subscribers.insert(id, tx);
        info!(subscriber = id, replayed, "subscriber connected");

        Subscriber {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn unsubscribe(&self, subscriber: Subscriber) {
        drop(subscriber);
    }

    pub fn snapshot(&self) -> Vec<Arc<EventLogEntry>> {
        self.shared.hub.lock().log.snapshot()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.hub.lock().subscribers.len()
    }

    /// Write the current log to `path` if anything was appended since the
    /// last successful write. Returns whether a write happened.
    ///
    /// Writes never overlap: the write lock travels into the blocking task,
    /// so even a cancelled caller keeps it until its file write finishes.
    pub async fn persist(&self, path: &Path) -> Result<bool, PersistError> {
        let write_guard = Arc::clone(&self.shared.persist_lock).lock_owned().await;
        let (entries, last_seq) = {
            let hub = self.shared.hub.lock();
            let last_seq = hub.log.last_seq();
            if last_seq.is_none() || last_seq == hub.persisted_seq {
                return Ok(false);
            }
            (hub.log.snapshot(), last_seq)
        };

        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let _write_guard = write_guard;
            save_snapshot(&target, &entries)
        })
        .await
        .map_err(|e| PersistError::Io {
            path: path.display().to_string(),
            source: std::io::Error::other(e),
        })??;

        let mut hub = self.shared.hub.lock();
        if hub.persisted_seq < last_seq {
            hub.persisted_seq = last_seq;
        }
        debug!(path = %path.display(), seq = ?last_seq, "persisted event log");
        Ok(true)
    }

    /// Persist every `every`; failures are logged and retried on the next tick.
    pub fn spawn_persist_loop(&self, path: PathBuf, every: Duration) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = broadcaster.persist(&path).await {
                    warn!(error = %e, "periodic persist failed");
                }
            }
        })
    }
}

/// A registered listener. Dropping it deregisters it.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<Arc<EventLogEntry>>,
    shared: Arc<Shared>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next queued entry, or a keepalive if none arrives within `idle`.
    /// `None` once the subscriber has been disconnected and drained.
    pub async fn next(&mut self, idle: Duration) -> Option<Feed> {
        match tokio::time::timeout(idle, self.rx.recv()).await {
            Ok(Some(entry)) => Some(Feed::Entry(entry)),
            Ok(None) => None,
            Err(_) => Some(Feed::Keepalive),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if self.shared.hub.lock().subscribers.remove(&self.id).is_some() {
            info!(subscriber = self.id, "subscriber disconnected");
        }
    }
}
