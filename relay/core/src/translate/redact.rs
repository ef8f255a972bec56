//! Sandbox path redaction

use std::path::Path;

use super::translator::StreamChunk;

/// Replacement for sandbox paths in client-visible text
pub const SANDBOX_PLACEHOLDER: &str = "[sandbox]";

/// Scrubs the sandbox location out of client-visible text
#[derive(Clone, Debug, Default)]
pub struct PathRedactor {
    /// Longest first, so the full path is replaced before its bare name
    needles: Vec<String>,
}

impl PathRedactor {
    /// Redactor that leaves text untouched
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Redactor for one sandbox directory
    #[must_use]
    pub fn for_sandbox(path: &Path) -> Self {
        let mut needles = vec![path.to_string_lossy().into_owned()];
        if let Some(name) = path.file_name() {
            needles.push(name.to_string_lossy().into_owned());
        }
        needles.retain(|n| !n.is_empty());
        needles.sort_by_key(|n| std::cmp::Reverse(n.len()));
        needles.dedup();
        Self { needles }
    }

    /// Whether this redactor changes anything
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.needles.is_empty()
    }

    /// Redact a string
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for needle in &self.needles {
            if out.contains(needle.as_str()) {
                out = out.replace(needle.as_str(), SANDBOX_PLACEHOLDER);
            }
        }
        out
    }

    /// Redact every text field of a chunk
    #[must_use]
    pub fn redact_chunk(&self, chunk: StreamChunk) -> StreamChunk {
        if !self.is_enabled() {
            return chunk;
        }
        match chunk {
            StreamChunk::Content { content, is_final } => StreamChunk::Content {
                content: self.redact(&content),
                is_final,
            },
            StreamChunk::Progress { content } => StreamChunk::Progress {
                content: self.redact(&content),
            },
            StreamChunk::Error {
                error_kind,
                message,
            } => StreamChunk::Error {
                error_kind,
                message: self.redact(&message),
            },
            StreamChunk::Done => StreamChunk::Done,
        }
    }
}
