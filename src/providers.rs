use crate::sentiment::Sentiment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} rejected the call: {message}")]
    Api {
        service: &'static str,
        message: String,
    },

    #[error("unexpected response from {0}")]
    MalformedResponse(&'static str),

    #[error("cannot build request url: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait SentimentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Sentiment, CollaboratorError>;
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, CollaboratorError>;
}

/// Outbound calls to the messaging platform. Best effort: callers log a
/// failure and move on.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_direct(&self, recipient_id: &str, text: &str) -> Result<Value, CollaboratorError>;
    async fn reply_to_comment(&self, comment_id: &str, text: &str) -> Result<Value, CollaboratorError>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

async fn read_json(service: &'static str, resp: reqwest::Response) -> Result<Value, CollaboratorError> {
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(CollaboratorError::Status {
            service,
            status,
            body,
        });
    }
    let value: Value = resp.json().await?;
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(CollaboratorError::Api { service, message });
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

pub struct GeminiGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [GenerateContent<'a>; 1],
}

#[derive(Serialize)]
struct GenerateContent<'a> {
    parts: [GeneratePart<'a>; 1],
}

#[derive(Serialize)]
struct GeneratePart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiGenerator {
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl ResponseGenerator for GeminiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, CollaboratorError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let body = GenerateRequest {
            contents: [GenerateContent {
                parts: [GeneratePart { text: prompt }],
            }],
        };
        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let value = read_json("gemini", resp).await?;
        let data: GenerateResponse = serde_json::from_value(value)
            .map_err(|_| CollaboratorError::MalformedResponse("gemini"))?;

        data.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or(CollaboratorError::MalformedResponse("gemini"))
    }
}

// ---------------------------------------------------------------------------
// Graph API
// ---------------------------------------------------------------------------

pub struct GraphApiSender {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    recipient: Recipient<'a>,
    message: OutboundText<'a>,
}

#[derive(Serialize)]
struct Recipient<'a> {
    id: &'a str,
}

#[derive(Serialize)]
struct OutboundText<'a> {
    text: &'a str,
}

impl GraphApiSender {
    pub fn new(base_url: &str, access_token: &str) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }
}

/// `{base}/v22.0/{comment_id}/replies`, with the id percent-encoded as a
/// single path segment.
fn comment_replies_url(base_url: &str, comment_id: &str) -> Result<reqwest::Url, CollaboratorError> {
    if matches!(comment_id, "" | "." | "..") {
        return Err(CollaboratorError::InvalidUrl(format!("bad comment id {comment_id:?}")));
    }
    let mut url = reqwest::Url::parse(base_url).map_err(|e| CollaboratorError::InvalidUrl(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| CollaboratorError::InvalidUrl(format!("{base_url} cannot be a base")))?
        .pop_if_empty()
        .extend(["v22.0", comment_id, "replies"]);
    Ok(url)
}

#[async_trait]
impl MessageSender for GraphApiSender {
    async fn send_direct(&self, recipient_id: &str, text: &str) -> Result<Value, CollaboratorError> {
        let url = format!("{}/v21.0/me/messages", self.base_url);
        let body = SendMessageRequest {
            recipient: Recipient { id: recipient_id },
            message: OutboundText { text },
        };
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        read_json("graph", resp).await
    }

    async fn reply_to_comment(&self, comment_id: &str, text: &str) -> Result<Value, CollaboratorError> {
        let url = comment_replies_url(&self.base_url, comment_id)?;
        let resp = self
            .client
            .post(url)
            .query(&[("message", text), ("access_token", self.access_token.as_str())])
            .send()
            .await?;
        read_json("graph", resp).await
    }
}
