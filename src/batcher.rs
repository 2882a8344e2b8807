use crate::pipeline::Replier;
use crate::scheduler::{DelayRange, DelayedTaskScheduler, FiredTask, TaskHandler};
use crate::types::{ConversationKey, DirectMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Immutable copy of a batch, taken each time the batch is (re)scheduled.
pub type BatchSnapshot = Arc<[DirectMessage]>;

#[derive(Debug, Clone, Copy)]
pub struct BatchTiming {
    pub initial_delay: DelayRange,
    pub follow_up_delay: Duration,
    pub grace: Duration,
}

struct PendingBatch {
    messages: Vec<DirectMessage>,
    generation: u64,
}

type Batches = Arc<Mutex<HashMap<ConversationKey, PendingBatch>>>;

/// Collects direct messages per conversation and replies once the
/// conversation goes quiet.
pub struct ConversationBatcher {
    batches: Batches,
    scheduler: DelayedTaskScheduler<ConversationKey, BatchSnapshot>,
    timing: BatchTiming,
}

impl ConversationBatcher {
    pub fn new(timing: BatchTiming, replier: Arc<dyn Replier>) -> Self {
        Self::build(timing, replier, None)
    }

    /// Like `new`, but messages sent by `account_id` are never chosen as
    /// the reply recipient.
    pub fn with_account(timing: BatchTiming, replier: Arc<dyn Replier>, account_id: &str) -> Self {
        Self::build(timing, replier, Some(account_id.to_string()))
    }

    fn build(timing: BatchTiming, replier: Arc<dyn Replier>, own_account_id: Option<String>) -> Self {
        let batches: Batches = Arc::new(Mutex::new(HashMap::new()));
        let flusher = BatchFlusher {
            batches: Arc::clone(&batches),
            replier,
            own_account_id,
        };
        Self {
            batches,
            scheduler: DelayedTaskScheduler::new("dm", Arc::new(flusher)),
            timing,
        }
    }

    /// Add a message to its conversation's batch and push the reply back.
    /// Returns the generation of the reply task now pending, or `None` when
    /// the message has no sender/recipient to key it by.
    pub fn add_message(&self, message: DirectMessage) -> Option<u64> {
        let key = match ConversationKey::for_message(&message) {
            Some(k) => k,
            None => {
                warn!("direct message without sender or recipient; not batched");
                return None;
            }
        };

        // Held across `schedule` so two arrivals for the same conversation
        // cannot interleave their snapshot and generation updates.
        let mut batches = self.batches.lock();
        let (delay, snapshot, size) = match batches.get_mut(&key) {
            Some(batch) => {
                batch.messages.push(message);
                (
                    self.timing.follow_up_delay,
                    BatchSnapshot::from(batch.messages.as_slice()),
                    batch.messages.len(),
                )
            }
            None => {
                let messages = vec![message];
                let snapshot = BatchSnapshot::from(messages.as_slice());
                batches.insert(
                    key.clone(),
                    PendingBatch {
                        messages,
                        generation: 0,
                    },
                );
                (self.timing.initial_delay.sample(), snapshot, 1)
            }
        };

        let generation =
            self.scheduler
                .schedule(key.clone(), snapshot, delay, delay + self.timing.grace);
        if let Some(batch) = batches.get_mut(&key) {
            batch.generation = generation;
        }
        drop(batches);

        info!(
            conversation = %key,
            messages = size,
            delay_secs = delay.as_secs(),
            generation,
            "scheduled conversation reply"
        );
        Some(generation)
    }

    /// Drop a conversation's batch and its pending reply.
    pub fn cancel(&self, key: &ConversationKey) -> bool {
        let mut batches = self.batches.lock();
        let had_batch = batches.remove(key).is_some();
        let had_task = self.scheduler.cancel(key);
        had_batch || had_task
    }

    pub fn pending_messages(&self, key: &ConversationKey) -> usize {
        self.batches
            .lock()
            .get(key)
            .map(|b| b.messages.len())
            .unwrap_or(0)
    }

    pub fn pending_conversations(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn shutdown(&self) {
        let mut batches = self.batches.lock();
        self.scheduler.cancel_all();
        batches.clear();
    }
}

struct BatchFlusher {
    batches: Batches,
    replier: Arc<dyn Replier>,
    own_account_id: Option<String>,
}

impl BatchFlusher {
    /// Detach the batch if it still belongs to `generation`. A newer
    /// generation means more messages arrived and a later task owns them.
    fn take(&self, key: &ConversationKey, generation: u64) -> bool {
        let mut batches = self.batches.lock();
        match batches.get(key) {
            Some(batch) if batch.generation == generation => {
                batches.remove(key);
                true
            }
            Some(batch) => {
                debug!(
                    conversation = %key,
                    generation,
                    current = batch.generation,
                    "batch superseded before reply; skipping"
                );
                false
            }
            None => {
                debug!(
                    conversation = %key,
                    generation,
                    "batch already cleared before reply; skipping"
                );
                false
            }
        }
    }

    fn recipient<'a>(&self, messages: &'a [DirectMessage]) -> Option<&'a str> {
        let from_them = messages.iter().find(|m| {
            m.sender_id.is_some() && m.sender_id.as_deref() != self.own_account_id.as_deref()
        });
        from_them
            .or_else(|| messages.first())
            .and_then(|m| m.sender_id.as_deref())
    }
}

pub fn join_texts(messages: &[DirectMessage]) -> String {
    messages
        .iter()
        .filter_map(|m| m.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl TaskHandler<ConversationKey, BatchSnapshot> for BatchFlusher {
    async fn run(&self, task: FiredTask<ConversationKey, BatchSnapshot>) -> anyhow::Result<()> {
        if !self.take(&task.key, task.generation) {
            return Ok(());
        }

        let messages = &task.payload;
        let recipient = self
            .recipient(messages)
            .ok_or_else(|| anyhow::anyhow!("batch for {} has no sender", task.key))?;
        let text = join_texts(messages);

        let outcome = self.replier.reply_to_conversation(recipient, &text).await?;
        info!(
            conversation = %task.key,
            recipient,
            messages = messages.len(),
            sentiment = %outcome.sentiment,
            fallback = outcome.used_fallback,
            "sent conversation reply"
        );
        Ok(())
    }

    fn expired(&self, key: &ConversationKey, generation: u64) {
        if self.take(key, generation) {
            warn!(conversation = %key, generation, "conversation reply expired; batch dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingReplier;

    const FOLLOW_UP: Duration = Duration::from_secs(30);

    fn timing() -> BatchTiming {
        BatchTiming {
            initial_delay: DelayRange::fixed(Duration::from_secs(60)),
            follow_up_delay: FOLLOW_UP,
            grace: Duration::from_secs(30),
        }
    }

    fn dm(sender: &str, recipient: &str, text: &str) -> DirectMessage {
        DirectMessage {
            sender_id: Some(sender.into()),
            recipient_id: Some(recipient.into()),
            text: Some(text.into()),
            message_id: None,
            is_echo: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_yields_one_reply_after_last_message() {
        let replier = RecordingReplier::new();
        let batcher = ConversationBatcher::new(timing(), replier.clone());
        let key = ConversationKey::between("S", "R");

        batcher.add_message(dm("S", "R", "first"));
        tokio::time::advance(Duration::from_secs(5)).await;
        batcher.add_message(dm("S", "R", "second"));
        tokio::time::advance(Duration::from_secs(10)).await;
        batcher.add_message(dm("S", "R", "third"));
        assert_eq!(batcher.pending_messages(&key), 3);

        // Nothing before the follow-up delay after the last message.
        tokio::time::advance(FOLLOW_UP - Duration::from_secs(1)).await;
        assert!(replier.conversations().is_empty());

        let (recipient, text) = replier.next_conversation().await;
        assert_eq!(recipient, "S");
        assert_eq!(text, "first\nsecond\nthird");
        assert_eq!(batcher.pending_conversations(), 0);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(replier.conversations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_messages_five_seconds_apart() {
        let replier = RecordingReplier::new();
        let batcher = ConversationBatcher::new(timing(), replier.clone());

        let start = tokio::time::Instant::now();
        batcher.add_message(dm("S", "R", "hello"));
        tokio::time::advance(Duration::from_secs(5)).await;
        batcher.add_message(dm("S", "R", "anyone there?"));
        let second_at = tokio::time::Instant::now();

        let (recipient, text) = replier.next_conversation().await;
        let elapsed = tokio::time::Instant::now() - second_at;
        assert_eq!(recipient, "S");
        assert_eq!(text, "hello\nanyone there?");
        assert!(elapsed >= FOLLOW_UP);
        assert!(elapsed < Duration::from_secs(90));
        assert!(tokio::time::Instant::now() - start < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn conversations_are_independent() {
        let replier = RecordingReplier::new();
        let batcher = ConversationBatcher::new(timing(), replier.clone());

        batcher.add_message(dm("A", "R", "from a"));
        batcher.add_message(dm("B", "R", "from b"));
        // Same pair in the other direction shares a batch.
        batcher.add_message(dm("R", "A", "reply to a"));
        assert_eq!(batcher.pending_conversations(), 2);

        let mut seen = vec![replier.next_conversation().await, replier.next_conversation().await];
        seen.sort();
        assert_eq!(seen[0], ("A".to_string(), "from a\nreply to a".to_string()));
        assert_eq!(seen[1], ("B".to_string(), "from b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn own_messages_are_not_the_recipient() {
        let replier = RecordingReplier::new();
        let batcher = ConversationBatcher::with_account(timing(), replier.clone(), "R");

        batcher.add_message(dm("R", "S", "we said this"));
        batcher.add_message(dm("S", "R", "they said this"));

        let (recipient, _) = replier.next_conversation().await;
        assert_eq!(recipient, "S");
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_generation_does_not_reply_or_clear() {
        let replier = RecordingReplier::new();
        let batcher = ConversationBatcher::new(timing(), replier.clone());
        let key = ConversationKey::between("S", "R");

        let first = batcher.add_message(dm("S", "R", "one")).unwrap();
        let second = batcher.add_message(dm("S", "R", "two")).unwrap();
        assert!(second > first);

        let flusher = BatchFlusher {
            batches: Arc::clone(&batcher.batches),
            replier: replier.clone(),
            own_account_id: None,
        };
        let stale = FiredTask {
            key: key.clone(),
            generation: first,
            payload: BatchSnapshot::from(vec![dm("S", "R", "one")]),
            fire_at: tokio::time::Instant::now(),
            expires_at: tokio::time::Instant::now(),
        };
        flusher.run(stale).await.unwrap();
        assert!(replier.conversations().is_empty());
        assert_eq!(batcher.pending_messages(&key), 2);

        let (_, text) = replier.next_conversation().await;
        assert_eq!(text, "one\ntwo");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_batch_and_reply() {
        let replier = RecordingReplier::new();
        let batcher = ConversationBatcher::new(timing(), replier.clone());
        let key = ConversationKey::between("S", "R");

        batcher.add_message(dm("S", "R", "never answered"));
        assert!(batcher.cancel(&key));
        assert!(!batcher.cancel(&key));

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(replier.conversations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn message_after_reply_starts_new_batch() {
        let replier = RecordingReplier::new();
        let batcher = ConversationBatcher::new(timing(), replier.clone());
        let key = ConversationKey::between("S", "R");

        batcher.add_message(dm("S", "R", "first round"));
        let _ = replier.next_conversation().await;
        assert_eq!(batcher.pending_messages(&key), 0);

        batcher.add_message(dm("S", "R", "second round"));
        assert_eq!(batcher.pending_messages(&key), 1);
        let (_, text) = replier.next_conversation().await;
        assert_eq!(text, "second round");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_is_not_retried() {
        let replier = RecordingReplier::failing();
        let batcher = ConversationBatcher::new(timing(), replier.clone());

        batcher.add_message(dm("S", "R", "hello"));
        let _ = replier.next_conversation().await;
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(replier.conversations().len(), 1);
        assert_eq!(batcher.pending_conversations(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn parallel_senders_share_one_batch() {
        const WORKERS: usize = 8;
        const PER_WORKER: usize = 50;

        let replier = RecordingReplier::new();
        let batcher = Arc::new(ConversationBatcher::new(
            BatchTiming {
                initial_delay: DelayRange::fixed(Duration::from_secs(1)),
                follow_up_delay: Duration::from_secs(1),
                grace: Duration::from_secs(5),
            },
            replier.clone(),
        ));
        let start = Arc::new(tokio::sync::Barrier::new(WORKERS));

        let senders: Vec<_> = (0..WORKERS)
            .map(|w| {
                let batcher = Arc::clone(&batcher);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    for i in 0..PER_WORKER {
                        batcher.add_message(dm("S", "R", &format!("w{w}-{i}")));
                        if i % 10 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.await.unwrap();
        }

        let (recipient, text) =
            tokio::time::timeout(Duration::from_secs(10), replier.next_conversation())
                .await
                .expect("no reply for the batch");
        assert_eq!(recipient, "S");

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), WORKERS * PER_WORKER);
        let distinct: std::collections::HashSet<&str> = lines.iter().copied().collect();
        assert_eq!(distinct.len(), WORKERS * PER_WORKER);
        // Each sender's own messages keep their order.
        for w in 0..WORKERS {
            let prefix = format!("w{w}-");
            let own: Vec<usize> = lines
                .iter()
                .filter_map(|l| l.strip_prefix(prefix.as_str()))
                .map(|i| i.parse().unwrap())
                .collect();
            assert_eq!(own, (0..PER_WORKER).collect::<Vec<_>>());
        }
        assert_eq!(batcher.pending_conversations(), 0);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(replier.conversations().len(), 1);
    }

    #[test]
    fn join_skips_messages_without_text() {
        let mut silent = dm("S", "R", "");
        silent.text = None;
        let messages = vec![dm("S", "R", "a"), silent, dm("S", "R", "b")];
        assert_eq!(join_texts(&messages), "a\nb");
    }
}
