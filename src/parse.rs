use crate::types::{Comment, DirectMessage, EventPayload, WebhookEvent};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Split a platform payload into its direct-message and comment events.
///
/// Partial or unexpected payloads never fail: anything that does not have
/// the expected shape simply contributes no events.
pub fn parse_payload(payload: &Value, received_at: DateTime<Utc>) -> Vec<WebhookEvent> {
    let mut events = Vec::new();

    let entries = match payload.get("entry").and_then(Value::as_array) {
        Some(e) => e,
        None => return events,
    };

    for entry in entries {
        let occurred_at = entry.get("time").and_then(platform_time);

        if let Some(messaging) = entry.get("messaging").and_then(Value::as_array) {
            for item in messaging {
                let message = match item.get("message") {
                    Some(m) if is_non_empty_object(m) => m,
                    _ => continue,
                };
                events.push(WebhookEvent {
                    received_at,
                    occurred_at,
                    payload: EventPayload::DirectMessage(DirectMessage {
                        sender_id: id_at(item, &["sender", "id"]),
                        recipient_id: id_at(item, &["recipient", "id"]),
                        text: string_at(message, &["text"]),
                        message_id: string_at(message, &["mid"]),
                        is_echo: message
                            .get("is_echo")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    }),
                });
            }
        }

        if let Some(changes) = entry.get("changes").and_then(Value::as_array) {
            for change in changes {
                if change.get("field").and_then(Value::as_str) != Some("comments") {
                    continue;
                }
                let value = match change.get("value") {
                    Some(v) if is_non_empty_object(v) => v,
                    _ => continue,
                };
                events.push(WebhookEvent {
                    received_at,
                    occurred_at,
                    payload: EventPayload::Comment(Comment {
                        comment_id: id_at(value, &["id"]),
                        text: string_at(value, &["text"]),
                        media_id: id_at(value, &["media", "id"]),
                        media_type: string_at(value, &["media", "media_product_type"]),
                        from_id: id_at(value, &["from", "id"]),
                        from_username: string_at(value, &["from", "username"]),
                    }),
                });
            }
        }
    }

    events
}

fn is_non_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(|o| !o.is_empty())
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    lookup(value, path)
        .and_then(Value::as_str)
        .map(str::to_string)
}

// Ids arrive as strings, but some test tooling sends them as numbers.
fn id_at(value: &Value, path: &[&str]) -> Option<String> {
    match lookup(value, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// `entry.time` is epoch seconds for some subscriptions and epoch millis
// for others.
fn platform_time(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_i64()?;
    if raw > 100_000_000_000 {
        DateTime::from_timestamp_millis(raw)
    } else {
        DateTime::from_timestamp(raw, 0)
    }
}
