//! OpenAI-compatible framing
//!
//! Turns the format-agnostic chunk stream into what chat-completion clients
//! expect: `chat.completion.chunk` server-sent events for streaming requests,
//! or a single `chat.completion` object for buffered ones.
//!
//! ```text
//! Content / Progress ──► data: {"choices":[{"delta":{"content":…}}]}
//! Done               ──► data: [DONE]
//! Error              ──► data: {"error":{"type":…,"message":…}}
//! Keepalive          ──► : keepalive
//! ```

mod completion;
mod sse;

pub use completion::{collect_completion, ChatCompletion, CompletionChoice, Message, StreamFailure};
pub use sse::{
    ChatCompletionChunk, ChunkChoice, Delta, ErrorBody, ErrorDetail, SseEncoder, DONE_FRAME,
    KEEPALIVE_FRAME,
};

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}
