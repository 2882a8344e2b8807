use crate::batcher::{BatchTiming, ConversationBatcher};
use crate::pipeline::Replier;
use crate::scheduler::{DelayRange, DelayedTaskScheduler, FiredTask, TaskHandler};
use crate::types::{Comment, ConversationKey, EventPayload, WebhookEvent};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Our own account id: echoes of our messages and our own comments are
    /// never answered.
    pub account_id: String,
    pub batch_timing: BatchTiming,
    pub comment_delay: DelayRange,
    pub grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    Batched { conversation: String, generation: u64 },
    CommentReply { comment_id: String, generation: u64 },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Echo,
    OwnComment,
    MissingIds,
}

#[derive(Debug, Clone)]
pub struct PendingComment {
    pub comment_id: String,
    pub text: String,
}

/// Routes parsed events: direct messages to the conversation batcher,
/// comments straight to a fixed-delay reply.
pub struct WebhookIngestor {
    config: IngestConfig,
    batcher: ConversationBatcher,
    comments: DelayedTaskScheduler<String, PendingComment>,
}

impl WebhookIngestor {
    pub fn new(config: IngestConfig, replier: Arc<dyn Replier>) -> Self {
        let batcher =
            ConversationBatcher::with_account(config.batch_timing, Arc::clone(&replier), &config.account_id);
        let comments = DelayedTaskScheduler::new("comment", Arc::new(CommentResponder { replier }));
        Self {
            config,
            batcher,
            comments,
        }
    }

    pub fn ingest(&self, events: &[WebhookEvent]) -> Vec<Route> {
        events.iter().map(|e| self.route(e)).collect()
    }

    pub fn route(&self, event: &WebhookEvent) -> Route {
        match &event.payload {
            EventPayload::DirectMessage(dm) => {
                if dm.is_echo {
                    return Route::Skipped {
                        reason: SkipReason::Echo,
                    };
                }
                let Some(key) = ConversationKey::for_message(dm) else {
                    warn!(message_id = ?dm.message_id, "direct message without sender or recipient");
                    return Route::Skipped {
                        reason: SkipReason::MissingIds,
                    };
                };
                match self.batcher.add_message(dm.clone()) {
                    Some(generation) => Route::Batched {
                        conversation: key.to_string(),
                        generation,
                    },
                    None => Route::Skipped {
                        reason: SkipReason::MissingIds,
                    },
                }
            }
            EventPayload::Comment(comment) => self.route_comment(comment),
        }
    }

    fn route_comment(&self, comment: &Comment) -> Route {
        if comment.from_id.as_deref() == Some(self.config.account_id.as_str()) {
            return Route::Skipped {
                reason: SkipReason::OwnComment,
            };
        }
        let Some(comment_id) = comment.comment_id.clone() else {
            warn!(from = ?comment.from_id, "comment without id");
            return Route::Skipped {
                reason: SkipReason::MissingIds,
            };
        };

        let delay = self.config.comment_delay.sample();
        let pending = PendingComment {
            comment_id: comment_id.clone(),
            text: comment.text.clone().unwrap_or_default(),
        };
        let generation =
            self.comments
                .schedule(comment_id.clone(), pending, delay, delay + self.config.grace);
        info!(
            comment = %comment_id,
            from = ?comment.from_username,
            delay_secs = delay.as_secs(),
            "scheduled comment reply"
        );
        Route::CommentReply {
            comment_id,
            generation,
        }
    }

    pub fn batcher(&self) -> &ConversationBatcher {
        &self.batcher
    }

    pub fn pending_comment_replies(&self) -> usize {
        self.comments.pending_count()
    }

    pub fn shutdown(&self) {
        self.batcher.shutdown();
        self.comments.cancel_all();
    }
}

struct CommentResponder {
    replier: Arc<dyn Replier>,
}

#[async_trait]
impl TaskHandler<String, PendingComment> for CommentResponder {
    async fn run(&self, task: FiredTask<String, PendingComment>) -> anyhow::Result<()> {
        let comment = task.payload;
        self.replier
            .reply_to_comment(&comment.comment_id, &comment.text)
            .await?;
        Ok(())
    }
}
