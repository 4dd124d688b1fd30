//! Bus message type and its newline-delimited JSON wire form.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broadcast domain for host events (comments, broadcast state, UI).
pub const DOMAIN_BROADCAST: &str = "nicohub";
/// Unicast domain between the host and exactly one plugin. Never
/// broadcast, never filter-matched.
pub const DOMAIN_DIRECT: &str = "nicohub_direct";
/// Domain suffix marking a single-consumer pipeline stage.
pub const FILTER_SUFFIX: &str = "@filter";

/// Where a message entered the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Created by a hub command handler or session translation.
    Internal,
    /// Decoded from the plugin in this slot.
    Plugin(usize),
}

/// One bus message. Immutable once constructed; consumed exactly once by
/// the router dispatch step.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub domain: String,
    pub command: String,
    pub content: Value,
    pub source: Source,
}

impl Message {
    /// A message originating inside the hub.
    pub fn internal(domain: &str, command: &str, content: Value) -> Self {
        Self {
            domain: domain.to_string(),
            command: command.to_string(),
            content,
            source: Source::Internal,
        }
    }

    /// A message decoded from the plugin in `slot`.
    pub fn from_plugin(slot: usize, domain: &str, command: &str, content: Value) -> Self {
        Self {
            domain: domain.to_string(),
            command: command.to_string(),
            content,
            source: Source::Plugin(slot),
        }
    }

    /// Whether this message rides the unicast direct domain.
    pub fn is_direct(&self) -> bool {
        self.domain == DOMAIN_DIRECT
    }

    /// The bare domain when this message carries the filter marker.
    pub fn filter_base(&self) -> Option<&str> {
        self.domain.strip_suffix(FILTER_SUFFIX)
    }

    /// A copy of this message on a different domain.
    pub fn with_domain(&self, domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..self.clone()
        }
    }
}

/// Wire shape of a message; `source` is implicit in the connection.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    domain: String,
    command: String,
    #[serde(default)]
    content: Value,
}

/// Encodes a message as one newline-terminated JSON line.
pub fn encode_line(msg: &Message) -> Result<String> {
    let wire = WireMessage {
        domain: msg.domain.clone(),
        command: msg.command.clone(),
        content: msg.content.clone(),
    };
    let mut line = serde_json::to_string(&wire).context("encoding bus message")?;
    line.push('\n');
    Ok(line)
}

/// Decodes one JSON line received from the plugin in `slot`.
pub fn decode_line(line: &str, slot: usize) -> Result<Message> {
    let wire: WireMessage =
        serde_json::from_str(line.trim()).with_context(|| format!("decoding bus message {line:?}"))?;
    Ok(Message {
        domain: wire.domain,
        command: wire.command,
        content: wire.content,
        source: Source::Plugin(slot),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = Message::from_plugin(2, DOMAIN_BROADCAST, "Comment.Got", json!({"no": 7}));
        let line = encode_line(&msg).unwrap();
        assert!(line.ends_with('\n'));
        let back = decode_line(&line, 2).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_missing_content_defaults_to_null() {
        let msg = decode_line("{\"domain\":\"nicohub\",\"command\":\"Ping\"}", 0).unwrap();
        assert_eq!(msg.content, Value::Null);
        assert_eq!(msg.source, Source::Plugin(0));
    }

    #[test]
    fn test_garbage_line_rejected() {
        assert!(decode_line("not json", 0).is_err());
        assert!(decode_line("{\"command\":\"x\"}", 0).is_err());
    }

    #[test]
    fn test_filter_base() {
        let msg = Message::internal("nicohub@filter", "Comment.Got", Value::Null);
        assert_eq!(msg.filter_base(), Some("nicohub"));
        assert!(Message::internal(DOMAIN_BROADCAST, "x", Value::Null)
            .filter_base()
            .is_none());
        assert!(!msg.is_direct());
        assert!(Message::internal(DOMAIN_DIRECT, "x", Value::Null).is_direct());
    }

    #[test]
    fn test_with_domain_strips_marker() {
        let msg = Message::from_plugin(1, "nicohub@filter", "Comment.Got", json!("hi"));
        let bare = msg.with_domain("nicohub");
        assert_eq!(bare.domain, "nicohub");
        assert_eq!(bare.command, "Comment.Got");
        assert_eq!(bare.source, Source::Plugin(1));
    }
}
