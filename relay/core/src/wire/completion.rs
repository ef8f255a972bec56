//! Buffered (non-streaming) responses

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::keepalive::Multiplexed;
use crate::translate::StreamChunk;

/// Assistant message of a buffered response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Always `assistant`
    pub role: String,
    /// Full answer
    pub content: String,
}

/// One choice of a buffered response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChoice {
    /// Always 0
    pub index: u32,
    /// The answer
    pub message: Message,
    /// Always `stop`
    pub finish_reason: String,
}

/// `chat.completion` object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// Completion id
    pub id: String,
    /// Always `chat.completion`
    pub object: String,
    /// Unix seconds
    pub created: i64,
    /// Model name echoed to the client
    pub model: String,
    /// Single choice
    pub choices: Vec<CompletionChoice>,
}

impl ChatCompletion {
    /// Answer text
    #[must_use]
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default()
    }
}

/// A chunk stream that did not end in `Done`
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StreamFailure {
    /// Failure classification
    pub kind: ErrorKind,
    /// Message from the error chunk
    pub message: String,
}

/// Drain a chunk stream into one buffered response
///
/// Progress markers and keepalives are dropped. Content from every content
/// chunk is concatenated in order.
pub async fn collect_completion<S, I>(
    chunks: S,
    model: impl Into<String>,
) -> Result<ChatCompletion, StreamFailure>
where
    S: Stream<Item = I>,
    I: Into<Multiplexed<StreamChunk>>,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut content = String::new();

    while let Some(item) = chunks.next().await {
        let Some(chunk) = item.into().into_item() else {
            continue;
        };
        match chunk {
            StreamChunk::Content { content: text, .. } => content.push_str(&text),
            StreamChunk::Progress { .. } => {}
            StreamChunk::Error {
                error_kind,
                message,
            } => {
                return Err(StreamFailure {
                    kind: error_kind,
                    message,
                })
            }
            StreamChunk::Done => {
                return Ok(ChatCompletion {
                    id: super::completion_id(),
                    object: "chat.completion".to_string(),
                    created: Utc::now().timestamp(),
                    model: model.into(),
                    choices: vec![CompletionChoice {
                        index: 0,
                        message: Message {
                            role: "assistant".to_string(),
                            content,
                        },
                        finish_reason: "stop".to_string(),
                    }],
                })
            }
        }
    }

    Err(StreamFailure {
        kind: ErrorKind::KilledByCancellation,
        message: "stream ended before completion".to_string(),
    })
}
