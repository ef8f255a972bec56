//! Stream Translator
//!
//! Converts provider events into client chunks. The emission mode is chosen
//! once, when the translator is built, and selects the variant of
//! [`TranslationState`]; every event then goes through that variant's
//! transition function.
//!
//! The translator never reads the clock itself. Callers pass `now`, which
//! keeps the state machine deterministic under test.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::markers::{GlyphCursor, MarkerPolicy};
use crate::error::{ErrorKind, RelayError};
use crate::parser::{ProviderEvent, ProviderEventKind};

// ============================================================================
// Chunks
// ============================================================================

/// A client-facing unit of output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Real assistant content
    Content {
        /// Text to append
        content: String,
        /// Whether this chunk completes the answer
        #[serde(rename = "isFinal")]
        is_final: bool,
    },
    /// Synthetic liveness marker carrying no answer text
    Progress {
        /// Marker glyph
        content: String,
    },
    /// Terminal failure
    Error {
        /// Failure classification
        #[serde(rename = "errorKind")]
        error_kind: ErrorKind,
        /// Human-readable message
        message: String,
    },
    /// Successful end of stream
    Done,
}

impl StreamChunk {
    /// Whether nothing may follow this chunk
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done)
    }

    /// Build the terminal error chunk for a failure
    #[must_use]
    pub fn from_error(err: &RelayError) -> Self {
        Self::Error {
            error_kind: err.kind(),
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Mode and state
// ============================================================================

/// How provider output is turned into chunks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionMode {
    /// Buffer the answer and emit it once, at the end
    #[default]
    FinalOnly,
    /// Stream the answer as it arrives, with progress markers during silence
    Progress,
}

impl FromStr for EmissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "final_only" | "final" => Ok(Self::FinalOnly),
            "progress" | "stream" => Ok(Self::Progress),
            other => Err(format!("unknown emission mode: {other}")),
        }
    }
}

/// Progress-mode bookkeeping
#[derive(Clone, Debug)]
pub struct ProgressState {
    /// Last time a content chunk or marker went out
    pub last_emission_at: Instant,
    /// Current silence allowed before the next marker
    pub interval: Duration,
    /// Glyph sequence position
    pub glyphs: GlyphCursor,
}

/// Per-stream translation state, one variant per emission mode
#[derive(Clone, Debug)]
pub enum TranslationState {
    /// Accumulating the final answer
    FinalOnly {
        /// Concatenated `FinalAssistantText` payloads
        accumulated_final_text: String,
    },
    /// Streaming content with markers
    Progress(ProgressState),
}

impl TranslationState {
    /// Mode this state implements
    #[must_use]
    pub fn mode(&self) -> EmissionMode {
        match self {
            Self::FinalOnly { .. } => EmissionMode::FinalOnly,
            Self::Progress(_) => EmissionMode::Progress,
        }
    }
}

// ============================================================================
// Translator
// ============================================================================

/// State machine from provider events to client chunks
#[derive(Debug)]
pub struct StreamTranslator {
    state: TranslationState,
    policy: MarkerPolicy,
    terminated: bool,
}

impl StreamTranslator {
    /// Start translating a stream that began at `started_at`
    #[must_use]
    pub fn new(mode: EmissionMode, policy: MarkerPolicy, started_at: Instant) -> Self {
        let state = match mode {
            EmissionMode::FinalOnly => TranslationState::FinalOnly {
                accumulated_final_text: String::new(),
            },
            EmissionMode::Progress => TranslationState::Progress(ProgressState {
                last_emission_at: started_at,
                interval: policy.min_interval,
                glyphs: GlyphCursor::default(),
            }),
        };
        Self {
            state,
            policy,
            terminated: false,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> &TranslationState {
        &self.state
    }

    /// Whether a terminal chunk has been produced
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// When the next progress marker is due, if one can be
    #[must_use]
    pub fn next_marker_at(&self) -> Option<Instant> {
        match &self.state {
            TranslationState::Progress(p) if !self.terminated => {
                Some(p.last_emission_at + p.interval)
            }
            _ => None,
        }
    }

    /// Apply one provider event
    pub fn on_event(&mut self, event: ProviderEvent, now: Instant) -> Vec<StreamChunk> {
        if self.terminated {
            return Vec::new();
        }
        let chunks = match &mut self.state {
            TranslationState::FinalOnly {
                accumulated_final_text,
            } => final_only_transition(accumulated_final_text, event),
            TranslationState::Progress(progress) => {
                progress_transition(progress, &self.policy, event, now)
            }
        };
        if chunks.iter().any(StreamChunk::is_terminal) {
            self.terminated = true;
        }
        chunks
    }

    /// Emit a progress marker if one is due at `now`
    pub fn on_tick(&mut self, now: Instant) -> Option<StreamChunk> {
        if self.terminated {
            return None;
        }
        match &mut self.state {
            TranslationState::Progress(progress) => marker_if_due(progress, &self.policy, now),
            TranslationState::FinalOnly { .. } => None,
        }
    }

    /// Terminate because the provider side failed
    ///
    /// Returns the error chunk to deliver, or `None` when the failure is a
    /// cancellation and nobody is listening.
    pub fn fail(&mut self, err: &RelayError) -> Option<StreamChunk> {
        if self.terminated {
            return None;
        }
        self.terminated = true;
        if err.kind() == ErrorKind::KilledByCancellation {
            return None;
        }
        Some(StreamChunk::from_error(err))
    }
}

fn final_only_transition(accumulated: &mut String, event: ProviderEvent) -> Vec<StreamChunk> {
    match event.kind {
        ProviderEventKind::FinalAssistantText { text } => {
            accumulated.push_str(&text);
            Vec::new()
        }
        ProviderEventKind::StreamEnd => vec![
            StreamChunk::Content {
                content: std::mem::take(accumulated),
                is_final: true,
            },
            StreamChunk::Done,
        ],
        ProviderEventKind::ProviderError { message } => {
            accumulated.clear();
            vec![StreamChunk::Error {
                error_kind: ErrorKind::ProviderError,
                message,
            }]
        }
        ProviderEventKind::SessionStarted { .. }
        | ProviderEventKind::ToolInvocation { .. }
        | ProviderEventKind::PartialAssistantText { .. } => Vec::new(),
    }
}

fn progress_transition(
    progress: &mut ProgressState,
    policy: &MarkerPolicy,
    event: ProviderEvent,
    now: Instant,
) -> Vec<StreamChunk> {
    match event.kind {
        ProviderEventKind::FinalAssistantText { text } => {
            progress.last_emission_at = now;
            progress.interval = policy.min_interval;
            if text.is_empty() {
                return Vec::new();
            }
            vec![StreamChunk::Content {
                content: text,
                is_final: false,
            }]
        }
        ProviderEventKind::ToolInvocation { .. } | ProviderEventKind::PartialAssistantText { .. } => {
            marker_if_due(progress, policy, now).into_iter().collect()
        }
        ProviderEventKind::StreamEnd => vec![StreamChunk::Done],
        ProviderEventKind::ProviderError { message } => vec![StreamChunk::Error {
            error_kind: ErrorKind::ProviderError,
            message,
        }],
        ProviderEventKind::SessionStarted { .. } => Vec::new(),
    }
}

fn marker_if_due(
    progress: &mut ProgressState,
    policy: &MarkerPolicy,
    now: Instant,
) -> Option<StreamChunk> {
    if now < progress.last_emission_at + progress.interval {
        return None;
    }
    let marker = progress.glyphs.advance(policy.repeat_limit);
    debug!(
        marker = %marker,
        interval_ms = progress.interval.as_millis() as u64,
        "Progress marker"
    );
    progress.last_emission_at = now;
    progress.interval = policy.grow(progress.interval);
    Some(StreamChunk::Progress { content: marker })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event(seq: u64, kind: ProviderEventKind) -> ProviderEvent {
        ProviderEvent::new(seq, kind)
    }

    fn final_text(text: &str) -> ProviderEventKind {
        ProviderEventKind::FinalAssistantText {
            text: text.to_string(),
        }
    }

    fn partial(text: &str) -> ProviderEventKind {
        ProviderEventKind::PartialAssistantText {
            text: text.to_string(),
        }
    }

    fn run(translator: &mut StreamTranslator, kinds: Vec<ProviderEventKind>, now: Instant) -> Vec<StreamChunk> {
        kinds
            .into_iter()
            .enumerate()
            .flat_map(|(i, kind)| translator.on_event(event(i as u64, kind), now))
            .collect()
    }

    #[test]
    fn test_final_only_concatenates() {
        let now = Instant::now();
        let mut translator = StreamTranslator::new(EmissionMode::FinalOnly, MarkerPolicy::default(), now);
        let chunks = run(
            &mut translator,
            vec![
                partial("Hi"),
                final_text("Hello"),
                final_text(" world"),
                ProviderEventKind::StreamEnd,
            ],
            now,
        );
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Content {
                    content: "Hello world".to_string(),
                    is_final: true
                },
                StreamChunk::Done
            ]
        );
        assert!(translator.is_terminated());
    }

    #[test]
    fn test_final_only_empty_terminal_chunk() {
        let now = Instant::now();
        let mut translator = StreamTranslator::new(EmissionMode::FinalOnly, MarkerPolicy::default(), now);
        let chunks = run(
            &mut translator,
            vec![
                ProviderEventKind::ToolInvocation {
                    name: "search".to_string(),
                },
                ProviderEventKind::StreamEnd,
            ],
            now,
        );
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Content {
                    content: String::new(),
                    is_final: true
                },
                StreamChunk::Done
            ]
        );
    }

    #[test]
    fn test_final_only_error_drops_partial_content() {
        let now = Instant::now();
        let mut translator = StreamTranslator::new(EmissionMode::FinalOnly, MarkerPolicy::default(), now);
        let chunks = run(
            &mut translator,
            vec![
                final_text("half an answer"),
                ProviderEventKind::ProviderError {
                    message: "rate limited".to_string(),
                },
                ProviderEventKind::StreamEnd,
            ],
            now,
        );
        assert_eq!(
            chunks,
            vec![StreamChunk::Error {
                error_kind: ErrorKind::ProviderError,
                message: "rate limited".to_string()
            }]
        );
    }

    #[test]
    fn test_final_only_never_marks() {
        let now = Instant::now();
        let mut translator = StreamTranslator::new(EmissionMode::FinalOnly, MarkerPolicy::default(), now);
        assert_eq!(translator.next_marker_at(), None);
        assert_eq!(translator.on_tick(now + Duration::from_secs(3600)), None);
    }

    #[test]
    fn test_progress_markers_escalate() {
        let start = Instant::now();
        let policy = MarkerPolicy::default();
        let mut translator = StreamTranslator::new(EmissionMode::Progress, policy, start);

        assert_eq!(translator.next_marker_at(), Some(start + Duration::from_secs(2)));
        assert_eq!(translator.on_tick(start + Duration::from_secs(1)), None);

        let first = translator.on_tick(start + Duration::from_secs(2));
        assert_eq!(
            first,
            Some(StreamChunk::Progress {
                content: "⏳".to_string()
            })
        );
        // interval doubled to 4s
        assert_eq!(translator.next_marker_at(), Some(start + Duration::from_secs(6)));
        assert_eq!(translator.on_tick(start + Duration::from_secs(5)), None);
        assert_eq!(
            translator.on_tick(start + Duration::from_secs(6)),
            Some(StreamChunk::Progress {
                content: "◐".to_string()
            })
        );
    }

    #[test]
    fn test_progress_content_resets_backoff() {
        let start = Instant::now();
        let mut translator = StreamTranslator::new(EmissionMode::Progress, MarkerPolicy::default(), start);
        translator.on_tick(start + Duration::from_secs(2));
        translator.on_tick(start + Duration::from_secs(6));

        let at = start + Duration::from_secs(7);
        let chunks = translator.on_event(event(0, final_text("done")), at);
        assert_eq!(
            chunks,
            vec![StreamChunk::Content {
                content: "done".to_string(),
                is_final: false
            }]
        );
        assert_eq!(translator.next_marker_at(), Some(at + Duration::from_secs(2)));
    }

    #[test]
    fn test_progress_content_wins_tie() {
        let start = Instant::now();
        let mut translator = StreamTranslator::new(EmissionMode::Progress, MarkerPolicy::default(), start);
        let due = start + Duration::from_secs(2);

        // content delivered at the instant a marker is due suppresses the marker
        let chunks = translator.on_event(event(0, final_text("x")), due);
        assert_eq!(chunks.len(), 1);
        assert_eq!(translator.on_tick(due), None);
    }

    #[test]
    fn test_progress_activity_does_not_reset_backoff() {
        let start = Instant::now();
        let mut translator = StreamTranslator::new(EmissionMode::Progress, MarkerPolicy::default(), start);

        assert!(translator
            .on_event(event(0, partial("thinking")), start + Duration::from_secs(1))
            .is_empty());
        let chunks = translator.on_event(
            event(1, ProviderEventKind::ToolInvocation {
                name: "Bash".to_string(),
            }),
            start + Duration::from_secs(3),
        );
        assert_eq!(
            chunks,
            vec![StreamChunk::Progress {
                content: "⏳".to_string()
            }]
        );
    }

    #[test]
    fn test_progress_end_and_error() {
        let start = Instant::now();
        let mut translator = StreamTranslator::new(EmissionMode::Progress, MarkerPolicy::default(), start);
        assert_eq!(
            translator.on_event(event(0, ProviderEventKind::StreamEnd), start),
            vec![StreamChunk::Done]
        );
        assert_eq!(translator.next_marker_at(), None);
        assert!(translator
            .on_event(event(1, final_text("late")), start)
            .is_empty());
    }

    #[test]
    fn test_fail_on_cancellation_is_silent() {
        let start = Instant::now();
        let mut translator = StreamTranslator::new(EmissionMode::Progress, MarkerPolicy::default(), start);
        assert_eq!(translator.fail(&RelayError::KilledByCancellation), None);
        assert!(translator.is_terminated());

        let mut translator = StreamTranslator::new(EmissionMode::Progress, MarkerPolicy::default(), start);
        let chunk = translator.fail(&RelayError::Timeout(Duration::from_millis(100)));
        assert!(matches!(
            chunk,
            Some(StreamChunk::Error {
                error_kind: ErrorKind::Timeout,
                ..
            })
        ));
    }

    #[test]
    fn test_chunk_wire_shape() {
        let chunk = StreamChunk::Error {
            error_kind: ErrorKind::Timeout,
            message: "slow".to_string(),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["errorKind"], "timeout");
        assert_eq!(json["message"], "slow");

        let chunk = StreamChunk::Content {
            content: "a".to_string(),
            is_final: true,
        };
        assert_eq!(serde_json::to_value(&chunk).unwrap()["isFinal"], true);
    }

    #[test]
    fn test_emission_mode_from_str() {
        assert_eq!("final-only".parse(), Ok(EmissionMode::FinalOnly));
        assert_eq!("PROGRESS".parse(), Ok(EmissionMode::Progress));
        assert!("loud".parse::<EmissionMode>().is_err());
    }
}
