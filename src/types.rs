//! Core data types: prompt messages, chunks, queues, and task submissions.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
}

impl Role {
    /// Wire name (`"system"`, `"user"`, `"assistant"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One element of a prompt bundle. An ordered `Vec<Message>` is the opaque
/// input the relay hands to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl Message {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One unit of streamed content, as tracked per attempt and persisted to the
/// partial-response store.
///
/// `chunk_index` is monotone per attempt, starting at 0, with no gaps.
/// `timestamp_ns` is monotonic within the task (epoch base plus elapsed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// The chunk text.
    pub content: String,
    /// Monotonic nanosecond timestamp.
    pub timestamp_ns: u64,
    /// Position within the attempt, starting at 0.
    pub chunk_index: u64,
    /// Speaker label, present in multi-AI observation mode.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub speaker: Option<String>,
}

/// Named task queues with static priorities. Higher priority wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    /// Streamed chat completions. Heavy tasks, low priority, strict
    /// one-at-a-time workers.
    Llm,
    /// Conversation feedback generation.
    Feedback,
    /// Background analysis.
    Analytics,
    /// Lightweight fast-turnaround work.
    Quick,
    /// Everything else.
    Default,
}

impl QueueName {
    /// All queues, in declaration order.
    pub const ALL: [QueueName; 5] = [
        QueueName::Llm,
        QueueName::Feedback,
        QueueName::Analytics,
        QueueName::Quick,
        QueueName::Default,
    ];

    /// Static queue priority. Higher wins.
    pub fn priority(self) -> u8 {
        match self {
            QueueName::Llm => 3,
            QueueName::Feedback => 5,
            QueueName::Analytics => 7,
            QueueName::Quick => 9,
            QueueName::Default => 5,
        }
    }

    /// Queue name on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Llm => "llm",
            QueueName::Feedback => "feedback",
            QueueName::Analytics => "analytics",
            QueueName::Quick => "quick",
            QueueName::Default => "default",
        }
    }

    /// Route a dotted task kind (`"llm.stream_chat"`, `"feedback.generate"`)
    /// to its queue. Unmatched kinds land on the default queue.
    pub fn for_task_kind(kind: &str) -> Self {
        if kind.starts_with("llm.") {
            QueueName::Llm
        } else if kind.starts_with("feedback.") {
            QueueName::Feedback
        } else if kind.starts_with("analytics.") || kind.starts_with("strength_analysis.") {
            QueueName::Analytics
        } else if kind.starts_with("quick.") {
            QueueName::Quick
        } else {
            QueueName::Default
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for a streamed chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Identifies the fan-out channel (`stream:{session_id}`).
    pub session_id: String,
    /// Provider-qualified model name (e.g. `gemini/gemini-1.5-flash`).
    pub model_name: String,
    /// The prompt bundle, in order.
    pub messages: Vec<Message>,
    /// Opaque passthrough (speaker label, user id, parent session id, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Target queue.
    #[serde(default = "default_queue")]
    pub queue: QueueName,
}

fn default_queue() -> QueueName {
    QueueName::Default
}

impl TaskSubmission {
    /// A chat-completion submission bound for the llm queue.
    pub fn new(
        session_id: impl Into<String>,
        model_name: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            model_name: model_name.into(),
            messages,
            metadata: serde_json::Value::Null,
            queue: QueueName::Llm,
        }
    }

    /// Set the target queue.
    pub fn with_queue(mut self, queue: QueueName) -> Self {
        self.queue = queue;
        self
    }

    /// Attach passthrough metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The speaker label for observation mode: only when `metadata.watch_mode`
    /// is truthy and `metadata.speaker` is a string.
    pub fn speaker(&self) -> Option<&str> {
        let watch = self
            .metadata
            .get("watch_mode")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !watch {
            return None;
        }
        self.metadata.get("speaker").and_then(|v| v.as_str())
    }
}

/// Seconds since the Unix epoch, as carried on event timestamps.
pub(crate) fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Nanoseconds since the Unix epoch, the base for chunk timestamps.
pub(crate) fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Assistant);
    }

    #[test]
    fn test_message_constructors() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
    }

    #[test]
    fn test_queue_priorities() {
        assert_eq!(QueueName::Llm.priority(), 3);
        assert_eq!(QueueName::Feedback.priority(), 5);
        assert_eq!(QueueName::Analytics.priority(), 7);
        assert_eq!(QueueName::Quick.priority(), 9);
        assert_eq!(QueueName::Default.priority(), 5);
    }

    #[test]
    fn test_task_kind_routing() {
        assert_eq!(QueueName::for_task_kind("llm.stream_chat"), QueueName::Llm);
        assert_eq!(
            QueueName::for_task_kind("feedback.generate"),
            QueueName::Feedback
        );
        assert_eq!(
            QueueName::for_task_kind("analytics.aggregate"),
            QueueName::Analytics
        );
        assert_eq!(
            QueueName::for_task_kind("strength_analysis.run"),
            QueueName::Analytics
        );
        assert_eq!(QueueName::for_task_kind("quick.ping"), QueueName::Quick);
        assert_eq!(QueueName::for_task_kind("misc.thing"), QueueName::Default);
    }

    #[test]
    fn test_submission_defaults_to_llm_queue() {
        let sub = TaskSubmission::new("s1", "gemini/gemini-1.5-flash", vec![Message::user("Hi")]);
        assert_eq!(sub.queue, QueueName::Llm);
        assert!(sub.speaker().is_none());
    }

    #[test]
    fn test_speaker_requires_watch_mode() {
        let sub = TaskSubmission::new("s1", "gemini/g", vec![])
            .with_metadata(json!({"speaker": "Alice"}));
        assert!(sub.speaker().is_none());

        let sub = TaskSubmission::new("s1", "gemini/g", vec![])
            .with_metadata(json!({"watch_mode": true, "speaker": "Alice"}));
        assert_eq!(sub.speaker(), Some("Alice"));
    }

    #[test]
    fn test_chunk_speaker_omitted_when_none() {
        let chunk = Chunk {
            content: "hi".into(),
            timestamp_ns: 1,
            chunk_index: 0,
            speaker: None,
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert!(json.get("speaker").is_none());
    }

    #[test]
    fn test_submission_deserializes_with_defaults() {
        let sub: TaskSubmission = serde_json::from_value(json!({
            "session_id": "s1",
            "model_name": "gemini/gemini-1.5-flash",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .unwrap();
        assert_eq!(sub.queue, QueueName::Default);
        assert!(sub.metadata.is_null());
    }
}
