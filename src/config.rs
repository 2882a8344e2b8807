use crate::batcher::BatchTiming;
use crate::ingest::IngestConfig;
use crate::scheduler::DelayRange;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Webhook auto-responder for direct messages and comments.
#[derive(Parser, Debug, Clone)]
#[command(name = "nexus-webhook-responder", version, long_about = None)]
pub struct Config {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:5000")]
    pub bind: SocketAddr,

    /// HMAC key for the X-Hub-Signature-256 header.
    #[arg(long, env = "APP_SECRET", hide_env_values = true)]
    pub app_secret: String,

    /// Token expected in the subscription handshake.
    #[arg(long, env = "VERIFY_TOKEN", hide_env_values = true)]
    pub verify_token: String,

    /// Bearer token for outbound sends.
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: String,

    /// Our own account id; its messages and comments are never answered.
    #[arg(long, env = "ACCOUNT_ID")]
    pub account_id: String,

    #[arg(long, env = "GRAPH_API_BASE", default_value = "https://graph.instagram.com")]
    pub graph_api_base: String,

    /// Without a key every reply is the canned one.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    #[arg(long, env = "GEMINI_MODEL", default_value = "gemini-1.5-flash")]
    pub gemini_model: String,

    #[arg(
        long,
        env = "GEMINI_API_BASE",
        default_value = "https://generativelanguage.googleapis.com"
    )]
    pub gemini_api_base: String,

    #[arg(long, env = "SYSTEM_PROMPT_PATH", default_value = "system_prompt.txt")]
    pub system_prompt: PathBuf,

    #[arg(long, env = "WEBHOOK_EVENTS_FILE", default_value = "webhook_events.json")]
    pub events_file: PathBuf,

    #[arg(long, env = "EVENT_LOG_CAPACITY", default_value_t = 100)]
    pub log_capacity: usize,

    #[arg(long, env = "PERSIST_INTERVAL_SECS", default_value_t = 5)]
    pub persist_interval_secs: u64,

    #[arg(long, env = "DM_INITIAL_DELAY_MIN_SECS", default_value_t = 60)]
    pub dm_initial_delay_min_secs: u64,

    #[arg(long, env = "DM_INITIAL_DELAY_MAX_SECS", default_value_t = 120)]
    pub dm_initial_delay_max_secs: u64,

    #[arg(long, env = "DM_FOLLOW_UP_DELAY_SECS", default_value_t = 30)]
    pub dm_follow_up_delay_secs: u64,

    /// Added to every delay to get the task's time-to-live.
    #[arg(long, env = "REPLY_GRACE_SECS", default_value_t = 30)]
    pub reply_grace_secs: u64,

    #[arg(long, env = "COMMENT_DELAY_MIN_SECS", default_value_t = 60)]
    pub comment_delay_min_secs: u64,

    #[arg(long, env = "COMMENT_DELAY_MAX_SECS", default_value_t = 120)]
    pub comment_delay_max_secs: u64,

    #[arg(long, env = "SSE_KEEPALIVE_SECS", default_value_t = 30)]
    pub keepalive_secs: u64,

    #[arg(long, env = "SUBSCRIBER_BACKLOG", default_value_t = 1024)]
    pub subscriber_backlog: usize,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{name}: minimum ({min}s) exceeds maximum ({max}s)")]
    InvertedRange { name: &'static str, min: u64, max: u64 },

    #[error("{0} must be at least 1")]
    TooSmall(&'static str),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("APP_SECRET", &self.app_secret),
            ("VERIFY_TOKEN", &self.verify_token),
            ("ACCOUNT_ID", &self.account_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(name));
            }
        }

        for (name, min, max) in [
            (
                "DM initial delay",
                self.dm_initial_delay_min_secs,
                self.dm_initial_delay_max_secs,
            ),
            (
                "comment delay",
                self.comment_delay_min_secs,
                self.comment_delay_max_secs,
            ),
        ] {
            if min > max {
                return Err(ConfigError::InvertedRange { name, min, max });
            }
        }

        for (name, value) in [
            ("EVENT_LOG_CAPACITY", self.log_capacity as u64),
            ("PERSIST_INTERVAL_SECS", self.persist_interval_secs),
            ("SSE_KEEPALIVE_SECS", self.keepalive_secs),
            ("SUBSCRIBER_BACKLOG", self.subscriber_backlog as u64),
        ] {
            if value < 1 {
                return Err(ConfigError::TooSmall(name));
            }
        }
        Ok(())
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.reply_grace_secs)
    }

    pub fn batch_timing(&self) -> BatchTiming {
        BatchTiming {
            initial_delay: DelayRange::new(
                Duration::from_secs(self.dm_initial_delay_min_secs),
                Duration::from_secs(self.dm_initial_delay_max_secs),
            ),
            follow_up_delay: Duration::from_secs(self.dm_follow_up_delay_secs),
            grace: self.grace(),
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            account_id: self.account_id.clone(),
            batch_timing: self.batch_timing(),
            comment_delay: DelayRange::new(
                Duration::from_secs(self.comment_delay_min_secs),
                Duration::from_secs(self.comment_delay_max_secs),
            ),
            grace: self.grace(),
        }
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}
