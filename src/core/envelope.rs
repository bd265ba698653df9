//! Message envelope placed around application payloads.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque application payload.
pub type Payload = serde_json::Value;

/// Identifier of one message, unique per sender.
///
/// Formatted as `{node:016x}-{sequence}`. The transport never deduplicates on
/// it; it exists for ack correlation and application-level dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces [`MessageId`]s from a random node id and a counter.
#[derive(Debug)]
pub struct MessageIdGenerator {
    node: u64,
    next: AtomicU64,
}

impl MessageIdGenerator {
    /// Generator with a random node id.
    pub fn new() -> Self {
        Self::with_node(rand::random())
    }

    /// Generator with a fixed node id.
    pub fn with_node(node: u64) -> Self {
        Self {
            node,
            next: AtomicU64::new(1),
        }
    }

    /// Node component of generated ids.
    pub fn node(&self) -> u64 {
        self.node
    }

    /// Next id. Never repeats within one generator.
    pub fn next_id(&self) -> MessageId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        MessageId(format!("{:016x}-{}", self.node, seq))
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A channel-addressed message in transit.
///
/// Immutable once built. Serialized as
/// `{channel, data, timestamp, messageId}` with `timestamp` in unix
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    channel: String,
    data: Payload,
    timestamp: i64,
    message_id: MessageId,
}

impl MessageEnvelope {
    /// Envelope stamped with the current wall-clock time.
    pub fn new(channel: impl Into<String>, data: Payload, message_id: MessageId) -> Self {
        Self::from_parts(channel, data, unix_millis(), message_id)
    }

    /// Envelope from explicit parts.
    pub fn from_parts(
        channel: impl Into<String>,
        data: Payload,
        timestamp: i64,
        message_id: MessageId,
    ) -> Self {
        Self {
            channel: channel.into(),
            data,
            timestamp,
            message_id,
        }
    }

    /// Logical topic.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Application payload.
    pub fn data(&self) -> &Payload {
        &self.data
    }

    /// Creation time in unix milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Message identifier.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Take the payload out of the envelope.
    pub fn into_data(self) -> Payload {
        self.data
    }
}

/// Current wall-clock time in unix milliseconds (0 if the clock is before 1970).
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_unique_and_tagged_with_node() {
        let ids = MessageIdGenerator::with_node(0xabc);
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "0000000000000abc-1");
        assert_eq!(b.as_str(), "0000000000000abc-2");
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = MessageEnvelope::from_parts(
            "coordination",
            json!({"foo": 1}),
            1_700_000_000_000,
            MessageId::new("n-1"),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "channel": "coordination",
                "data": {"foo": 1},
                "timestamp": 1_700_000_000_000i64,
                "messageId": "n-1",
            })
        );
    }

    #[test]
    fn test_new_envelope_is_timestamped() {
        let before = unix_millis();
        let env = MessageEnvelope::new("agent:status", json!("idle"), MessageId::new("x"));
        assert!(env.timestamp() >= before);
        assert_eq!(env.channel(), "agent:status");
        assert_eq!(env.into_data(), json!("idle"));
    }
}
