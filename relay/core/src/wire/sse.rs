//! Server-sent event framing

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::keepalive::Multiplexed;
use crate::translate::StreamChunk;

/// SSE comment line carrying a keepalive
pub const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

/// Terminal SSE frame of a successful stream
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Streaming delta payload
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Present on the first frame only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Text to append
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One choice of a streaming frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Always 0
    pub index: u32,
    /// Incremental content
    pub delta: Delta,
    /// `"stop"` on the last content frame
    pub finish_reason: Option<String>,
}

/// `chat.completion.chunk` object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Completion id, shared by every frame of a stream
    pub id: String,
    /// Always `chat.completion.chunk`
    pub object: String,
    /// Unix seconds
    pub created: i64,
    /// Model name echoed to the client
    pub model: String,
    /// Single choice
    pub choices: Vec<ChunkChoice>,
}

/// Error body of a failed stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error details
    pub error: ErrorDetail,
}

/// Error details
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error kind
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Message
    pub message: String,
}

/// Frames one response as OpenAI-compatible SSE
#[derive(Debug)]
pub struct SseEncoder {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    stop_sent: bool,
}

impl SseEncoder {
    /// Encoder for a response attributed to `model`
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: super::completion_id(),
            model: model.into(),
            created: Utc::now().timestamp(),
            role_sent: false,
            stop_sent: false,
        }
    }

    /// Use a fixed completion id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Completion id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn frame(&mut self, content: Option<String>, finish_reason: Option<&str>) -> String {
        let role = (!self.role_sent).then(|| "assistant".to_string());
        self.role_sent = true;
        if finish_reason.is_some() {
            self.stop_sent = true;
        }
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta { role, content },
                finish_reason: finish_reason.map(str::to_string),
            }],
        };
        data_frame(&chunk)
    }

    /// Frames for one chunk
    pub fn encode_chunk(&mut self, chunk: &StreamChunk) -> Vec<String> {
        match chunk {
            StreamChunk::Content { content, is_final } => {
                let finish = is_final.then_some("stop");
                vec![self.frame(Some(content.clone()), finish)]
            }
            StreamChunk::Progress { content } => vec![self.frame(Some(content.clone()), None)],
            StreamChunk::Done => {
                let mut frames = Vec::with_capacity(2);
                if !self.stop_sent {
                    frames.push(self.frame(None, Some("stop")));
                }
                frames.push(DONE_FRAME.to_string());
                frames
            }
            StreamChunk::Error {
                error_kind,
                message,
            } => vec![data_frame(&ErrorBody {
                error: ErrorDetail {
                    kind: *error_kind,
                    message: message.clone(),
                },
            })],
        }
    }

    /// Frames for one multiplexed element
    pub fn encode(&mut self, item: &Multiplexed<StreamChunk>) -> Vec<String> {
        match item {
            Multiplexed::Item(chunk) => self.encode_chunk(chunk),
            Multiplexed::Keepalive => vec![KEEPALIVE_FRAME.to_string()],
        }
    }
}

fn data_frame<T: Serialize>(payload: &T) -> String {
    match serde_json::to_string(payload) {
        Ok(json) => format!("data: {json}\n\n"),
        // plain data structs; serialization cannot fail
        Err(e) => format!("data: {{\"error\":{{\"type\":\"provider_error\",\"message\":\"{e}\"}}}}\n\n"),
    }
}
