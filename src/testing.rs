//! Recording fakes for the reply collaborators, shared by unit tests.

use crate::pipeline::{PipelineError, Replier, ReplyOutcome};
use crate::providers::{CollaboratorError, MessageSender, ResponseGenerator, SentimentClassifier};
use crate::sentiment::Sentiment;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

type Calls = Mutex<Vec<(String, String)>>;

/// Records every reply request and lets a test wait for the next one.
pub struct RecordingReplier {
    fail: bool,
    conversations: Calls,
    comments: Calls,
    conversation_tx: mpsc::UnboundedSender<(String, String)>,
    conversation_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, String)>>,
    comment_tx: mpsc::UnboundedSender<(String, String)>,
    comment_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, String)>>,
}

impl RecordingReplier {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(true)
    }

    fn build(fail: bool) -> Arc<Self> {
        let (conversation_tx, conversation_rx) = mpsc::unbounded_channel();
        let (comment_tx, comment_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            fail,
            conversations: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
            conversation_tx,
            conversation_rx: tokio::sync::Mutex::new(conversation_rx),
            comment_tx,
            comment_rx: tokio::sync::Mutex::new(comment_rx),
        })
    }

    pub fn conversations(&self) -> Vec<(String, String)> {
        self.conversations.lock().clone()
    }

    pub fn comments(&self) -> Vec<(String, String)> {
        self.comments.lock().clone()
    }

    pub async fn next_conversation(&self) -> (String, String) {
        self.conversation_rx
            .lock()
            .await
            .recv()
            .await
            .expect("replier dropped")
    }

    pub async fn next_comment(&self) -> (String, String) {
        self.comment_rx
            .lock()
            .await
            .recv()
            .await
            .expect("replier dropped")
    }

    fn outcome(&self, text: &str) -> Result<ReplyOutcome, PipelineError> {
        if self.fail {
            return Err(PipelineError::Send {
                target: "test".into(),
                source: CollaboratorError::MalformedResponse("test"),
            });
        }
        Ok(ReplyOutcome {
            sentiment: Sentiment::Positive,
            text: text.to_string(),
            used_fallback: false,
        })
    }
}

#[async_trait]
impl Replier for RecordingReplier {
    async fn reply_to_conversation(
        &self,
        recipient_id: &str,
        text: &str,
    ) -> Result<ReplyOutcome, PipelineError> {
        let call = (recipient_id.to_string(), text.to_string());
        self.conversations.lock().push(call.clone());
        let _ = self.conversation_tx.send(call);
        self.outcome(text)
    }

    async fn reply_to_comment(&self, comment_id: &str, text: &str) -> Result<ReplyOutcome, PipelineError> {
        let call = (comment_id.to_string(), text.to_string());
        self.comments.lock().push(call.clone());
        let _ = self.comment_tx.send(call);
        self.outcome(text)
    }
}

pub struct RecordingSender {
    fail: bool,
    direct: Calls,
    comments: Calls,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            direct: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            direct: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
        })
    }

    pub fn direct(&self) -> Vec<(String, String)> {
        self.direct.lock().clone()
    }

    pub fn comments(&self) -> Vec<(String, String)> {
        self.comments.lock().clone()
    }

    fn result(&self) -> Result<Value, CollaboratorError> {
        if self.fail {
            Err(CollaboratorError::Status {
                service: "graph",
                status: 500,
                body: "boom".into(),
            })
        } else {
            Ok(json!({ "ok": true }))
        }
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_direct(&self, recipient_id: &str, text: &str) -> Result<Value, CollaboratorError> {
        self.direct
            .lock()
            .push((recipient_id.to_string(), text.to_string()));
        self.result()
    }

    async fn reply_to_comment(&self, comment_id: &str, text: &str) -> Result<Value, CollaboratorError> {
        self.comments
            .lock()
            .push((comment_id.to_string(), text.to_string()));
        self.result()
    }
}

pub struct FixedGenerator {
    reply: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl FixedGenerator {
    pub fn ok(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ResponseGenerator for FixedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, CollaboratorError> {
        self.prompts.lock().push(prompt.to_string());
        self.reply
            .clone()
            .ok_or(CollaboratorError::MalformedResponse("fixed"))
    }
}

pub struct FailingClassifier;

#[async_trait]
impl SentimentClassifier for FailingClassifier {
    async fn classify(&self, _text: &str) -> Result<Sentiment, CollaboratorError> {
        Err(CollaboratorError::MalformedResponse("classifier"))
    }
}
