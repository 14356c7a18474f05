//! Shared conversation types for settle.
//!
//! These types are UI-agnostic: the core appends them to the conversation
//! log and the CLI renders them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    System,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Display/reconciliation tag attached to a message.
///
/// Kinds carry no semantics for the agent; they decide how an entry is
/// rendered and which entries a settlement or an aborted turn may replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Transient "agent is thinking" marker, removed once the stream starts.
    Loading,
    /// Submitted operation awaiting settlement.
    Transaction,
    Error,
    Success,
    Warning,
}

impl MessageKind {
    /// Returns true for the kinds a settlement resolves into.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageKind::Success | MessageKind::Warning)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Loading => write!(f, "loading"),
            MessageKind::Transaction => write!(f, "transaction"),
            MessageKind::Error => write!(f, "error"),
            MessageKind::Success => write!(f, "success"),
            MessageKind::Warning => write!(f, "warning"),
        }
    }
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            kind: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    #[must_use]
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Returns true if this message carries the given kind.
    pub fn is(&self, kind: MessageKind) -> bool {
        self.kind == Some(kind)
    }
}

/// Surrogate identity assigned by the conversation log at append time.
///
/// Ids are monotonic within one log and never reused, so a settlement can
/// refer to "its" transaction entry even when another entry has byte-identical
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A message as stored in the conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: MessageId,
    #[serde(flatten)]
    pub message: Message,
}

/// Identifier of a submitted blockchain operation (a `0x`-prefixed hex token).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
