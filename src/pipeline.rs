use crate::providers::{CollaboratorError, MessageSender, ResponseGenerator, SentimentClassifier};
use crate::sentiment::Sentiment;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("sentiment classification failed: {0}")]
    Classify(#[source] CollaboratorError),

    #[error("sending reply to {target} failed: {source}")]
    Send {
        target: String,
        #[source]
        source: CollaboratorError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyOutcome {
    pub sentiment: Sentiment,
    pub text: String,
    /// True when the canned reply was sent because generation failed or
    /// no generator is configured.
    pub used_fallback: bool,
}

/// What fired reply tasks call into.
#[async_trait]
pub trait Replier: Send + Sync + 'static {
    async fn reply_to_conversation(
        &self,
        recipient_id: &str,
        text: &str,
    ) -> Result<ReplyOutcome, PipelineError>;

    async fn reply_to_comment(&self, comment_id: &str, text: &str) -> Result<ReplyOutcome, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct CannedReplies {
    pub positive: String,
    pub negative: String,
}

impl CannedReplies {
    pub fn for_sentiment(&self, sentiment: Sentiment) -> &str {
        match sentiment {
            Sentiment::Positive => &self.positive,
            Sentiment::Negative => &self.negative,
        }
    }
}

impl Default for CannedReplies {
    fn default() -> Self {
        Self {
            positive: "Thanks for your kind words! We appreciate your support.".into(),
            negative: "We are sorry to hear you're not satisfied. Please tell us more about this so that we can improve.".into(),
        }
    }
}

pub fn tone_hint(sentiment: Sentiment) -> &'static str {
    match sentiment {
        Sentiment::Positive => "Respond with a very enthusiastic and thankful tone, acknowledging the compliment. Keep it concise and friendly.",
        Sentiment::Negative => "Respond with an apologetic and helpful tone, asking for more details about the issue so we can improve. Keep it concise and professional.",
    }
}

pub fn build_prompt(system_prompt: &str, text: &str, sentiment: Sentiment) -> String {
    format!(
        "{} Message/Conversation input from user: {} {}",
        system_prompt.trim(),
        text,
        tone_hint(sentiment)
    )
}

/// Classify, generate, send.
pub struct ReplyPipeline {
    classifier: Arc<dyn SentimentClassifier>,
    generator: Option<Arc<dyn ResponseGenerator>>,
    sender: Arc<dyn MessageSender>,
    system_prompt: String,
    dm_replies: CannedReplies,
    comment_replies: CannedReplies,
}

impl ReplyPipeline {
    pub fn new(
        classifier: Arc<dyn SentimentClassifier>,
        generator: Option<Arc<dyn ResponseGenerator>>,
        sender: Arc<dyn MessageSender>,
        system_prompt: String,
    ) -> Self {
        Self {
            classifier,
            generator,
            sender,
            system_prompt,
            dm_replies: CannedReplies::default(),
            comment_replies: CannedReplies::default(),
        }
    }

    pub fn with_canned_replies(mut self, dm: CannedReplies, comment: CannedReplies) -> Self {
        self.dm_replies = dm;
        self.comment_replies = comment;
        self
    }

    async fn classify(&self, text: &str) -> Result<Sentiment, PipelineError> {
        self.classifier.classify(text).await.map_err(|e| {
            error!(error = %e, "sentiment classification failed; abandoning reply");
            PipelineError::Classify(e)
        })
    }

    async fn compose(&self, text: &str, sentiment: Sentiment) -> (String, bool) {
        let canned = self.dm_replies.for_sentiment(sentiment);
        let generator = match &self.generator {
            Some(g) => g,
            None => return (canned.to_string(), true),
        };

        let prompt = build_prompt(&self.system_prompt, text, sentiment);
        match generator.generate(&prompt).await {
            Ok(reply) if !reply.trim().is_empty() => (reply.trim().to_string(), false),
            Ok(_) => {
                warn!("generator returned an empty reply; using canned reply");
                (canned.to_string(), true)
            }
            Err(e) => {
                warn!(error = %e, "response generation failed; using canned reply");
                (canned.to_string(), true)
            }
        }
    }
}

#[async_trait]
impl Replier for ReplyPipeline {
    async fn reply_to_conversation(
        &self,
        recipient_id: &str,
        text: &str,
    ) -> Result<ReplyOutcome, PipelineError> {
        let sentiment = self.classify(text).await?;
        info!(recipient = recipient_id, %sentiment, "classified conversation");

        let (reply, used_fallback) = self.compose(text, sentiment).await;

        match self.sender.send_direct(recipient_id, &reply).await {
            Ok(result) => info!(recipient = recipient_id, %result, "direct message sent"),
            Err(e) => {
                error!(recipient = recipient_id, error = %e, "failed to send direct message");
                return Err(PipelineError::Send {
                    target: recipient_id.to_string(),
                    source: e,
                });
            }
        }

        Ok(ReplyOutcome {
            sentiment,
            text: reply,
            used_fallback,
        })
    }

    async fn reply_to_comment(&self, comment_id: &str, text: &str) -> Result<ReplyOutcome, PipelineError> {
        let sentiment = self.classify(text).await?;
        let reply = self.comment_replies.for_sentiment(sentiment).to_string();

        match self.sender.reply_to_comment(comment_id, &reply).await {
            Ok(result) => info!(comment = comment_id, %sentiment, %result, "comment reply sent"),
            Err(e) => {
                error!(comment = comment_id, error = %e, "failed to reply to comment");
                return Err(PipelineError::Send {
                    target: comment_id.to_string(),
                    source: e,
                });
            }
        }

        Ok(ReplyOutcome {
            sentiment,
            text: reply,
            used_fallback: true,
        })
    }
}
