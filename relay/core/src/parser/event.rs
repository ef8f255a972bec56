//! Provider Event Types
//!
//! Typed units of output from the external tool. Events are ephemeral: they
//! are produced and consumed within one request and never persisted.

use serde::{Deserialize, Serialize};

/// What kind of provider output an event carries
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderEventKind {
    /// The tool reported the id of the session it is recording
    SessionStarted {
        /// Provider-side session identifier
        session_id: String,
    },
    /// The tool invoked one of its own tools
    ToolInvocation {
        /// Tool name as reported by the provider
        name: String,
    },
    /// Intermediate assistant text (narration between tool calls)
    PartialAssistantText {
        /// Text payload
        text: String,
    },
    /// Text that belongs to the final answer
    FinalAssistantText {
        /// Text payload
        text: String,
    },
    /// The tool reported a failure
    ProviderError {
        /// Provider message
        message: String,
    },
    /// The provider stream ended
    StreamEnd,
}

/// A provider event with its position in the request's event sequence
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    /// Monotonic sequence index, starting at 0 for each request
    pub seq: u64,
    /// Event kind and payload
    #[serde(flatten)]
    pub kind: ProviderEventKind,
}

impl ProviderEvent {
    /// Create an event
    #[must_use]
    pub fn new(seq: u64, kind: ProviderEventKind) -> Self {
        Self { seq, kind }
    }

    /// Payload text, if this kind carries one
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        match &self.kind {
            ProviderEventKind::SessionStarted { session_id } => Some(session_id),
            ProviderEventKind::ToolInvocation { name } => Some(name),
            ProviderEventKind::PartialAssistantText { text }
            | ProviderEventKind::FinalAssistantText { text } => Some(text),
            ProviderEventKind::ProviderError { message } => Some(message),
            ProviderEventKind::StreamEnd => None,
        }
    }

    /// Whether this event ends the provider stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ProviderEventKind::StreamEnd | ProviderEventKind::ProviderError { .. }
        )
    }
}
