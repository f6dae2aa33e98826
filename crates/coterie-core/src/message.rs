use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recipient wildcard: a message addressed to `"*"` is a broadcast.
pub const BROADCAST: &str = "*";

/// Classification of a [`BusMessage`].
///
/// Subscriptions on the bus are keyed by kind, not by recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A request for an agent to perform work.
    TaskRequest,
    /// The outcome of a previously requested task.
    TaskResponse,
    /// A lifecycle or progress notification.
    StatusUpdate,
    /// A request to start a multi-agent collaboration.
    CollaborationRequest,
    /// A participant sharing knowledge with others.
    KnowledgeShare,
    /// A failure report.
    ErrorReport,
    /// A system-wide event mirrored onto the bus.
    SystemEvent,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::TaskRequest => "task_request",
            MessageKind::TaskResponse => "task_response",
            MessageKind::StatusUpdate => "status_update",
            MessageKind::CollaborationRequest => "collaboration_request",
            MessageKind::KnowledgeShare => "knowledge_share",
            MessageKind::ErrorReport => "error_report",
            MessageKind::SystemEvent => "system_event",
        };
        write!(f, "{s}")
    }
}

/// Delivery priority carried on a message.
///
/// The bus delivers FIFO; priority is informational for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Background traffic.
    Low,
    /// Default priority.
    Normal,
    /// Should be handled promptly.
    High,
    /// Requires immediate attention.
    Urgent,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

/// A single message exchanged between named participants over the bus.
///
/// Owned by the bus from publish until it ages out of history. Immutable
/// after creation except for the delivery flags, which the delivery loop
/// sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Name of the sending participant.
    pub sender: String,
    /// Name of the receiving participant, or [`BROADCAST`].
    pub recipient: String,
    /// Message classification; subscriptions key on this.
    pub kind: MessageKind,
    /// Delivery priority (consumer-side).
    #[serde(default)]
    pub priority: MessagePriority,
    /// Opaque payload.
    pub content: serde_json::Value,
    /// UTC timestamp of creation.
    pub created_at: DateTime<Utc>,
    /// Whether at least one handler received this message without error.
    #[serde(default)]
    pub delivered: bool,
    /// Whether a consumer has acted on this message.
    #[serde(default)]
    pub processed: bool,
    /// For responses: the id of the request this message answers.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl BusMessage {
    /// Creates a new message with [`MessagePriority::Normal`].
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: MessageKind,
        content: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient: recipient.into(),
            kind,
            priority: MessagePriority::Normal,
            content,
            created_at: Utc::now(),
            delivered: false,
            processed: false,
            correlation_id: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Creates a response to this message, swapping sender and recipient
    /// and linking back through `correlation_id`.
    pub fn reply(&self, kind: MessageKind, content: serde_json::Value) -> Self {
        let mut msg = Self::new(self.recipient.clone(), self.sender.clone(), kind, content);
        msg.correlation_id = Some(self.id);
        msg
    }

    /// Whether this message is addressed to every participant.
    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = BusMessage::new(
            "planner",
            "builder",
            MessageKind::TaskRequest,
            json!({"task": "implement auth"}),
        );
        assert_eq!(msg.sender, "planner");
        assert_eq!(msg.recipient, "builder");
        assert_eq!(msg.priority, MessagePriority::Normal);
        assert!(!msg.delivered);
        assert!(!msg.is_broadcast());
        assert!(msg.correlation_id.is_none());
    }

    #[test]
    fn test_broadcast() {
        let msg = BusMessage::new("system", BROADCAST, MessageKind::SystemEvent, json!({}));
        assert!(msg.is_broadcast());
    }

    #[test]
    fn test_reply_links_correlation_id() {
        let request = BusMessage::new(
            "planner",
            "builder",
            MessageKind::TaskRequest,
            json!({"task": "plan"}),
        );
        let response = request.reply(MessageKind::TaskResponse, json!({"ok": true}));

        assert_eq!(response.sender, "builder");
        assert_eq!(response.recipient, "planner");
        assert_eq!(response.correlation_id, Some(request.id));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Urgent > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
    }

    #[test]
    fn test_serialization_round_trip() {
        let msg = BusMessage::new("a", "b", MessageKind::KnowledgeShare, json!({"fact": 42}))
            .with_priority(MessagePriority::High);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("knowledge_share"));
        let parsed: BusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, msg.id);
        assert_eq!(parsed.kind, MessageKind::KnowledgeShare);
        assert_eq!(parsed.priority, MessagePriority::High);
    }
}
