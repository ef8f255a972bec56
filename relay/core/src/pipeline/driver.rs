//! Per-request event loop
//!
//! Races provider events against the progress-marker deadline. Events are
//! polled first, so content that is already available always beats a marker
//! that falls due at the same instant.

use std::fmt;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ErrorKind, RelayError};
use crate::parser::{ProviderEvent, ProviderEventKind};
use crate::translate::{PathRedactor, StreamChunk, StreamTranslator};

/// How a request's chunk stream ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// `Done` was delivered
    Completed,
    /// An error chunk of this kind was delivered
    Failed(ErrorKind),
    /// The run was cancelled; nothing further was delivered
    Cancelled,
    /// The consumer went away
    ClientGone,
}

impl Outcome {
    /// Whether the tool may still be running when the loop returns
    pub(crate) fn leaves_tool_running(self) -> bool {
        !matches!(self, Self::Completed)
    }

    /// Whether cleanup should follow the cancellation policy
    pub(crate) fn is_cancellation(self) -> bool {
        matches!(self, Self::Cancelled | Self::ClientGone)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed(kind) => write!(f, "failed:{kind}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ClientGone => write!(f, "client_gone"),
        }
    }
}

enum Step {
    Event(Option<Result<ProviderEvent, RelayError>>),
    Tick,
}

async fn marker_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Translate `events` into chunks on `tx` until a terminal chunk is sent
///
/// `on_session` sees every provider session id the tool reports. Once
/// `cancel` fires nothing more is sent.
pub(crate) async fn drive<E, F>(
    events: &mut E,
    translator: &mut StreamTranslator,
    redactor: &PathRedactor,
    tx: &mpsc::Sender<StreamChunk>,
    cancel: &CancellationToken,
    mut on_session: F,
) -> Outcome
where
    E: Stream<Item = Result<ProviderEvent, RelayError>> + Unpin,
    F: FnMut(&str),
{
    loop {
        let marker_at = translator.next_marker_at();
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            _ = tx.closed() => return Outcome::ClientGone,
            item = events.next() => Step::Event(item),
            _ = marker_due(marker_at) => Step::Tick,
        };

        let chunks = match step {
            Step::Event(Some(Ok(event))) => {
                if let ProviderEventKind::SessionStarted { session_id } = &event.kind {
                    on_session(session_id);
                }
                translator.on_event(event, Instant::now())
            }
            Step::Event(Some(Err(err))) => {
                if err.kind() == ErrorKind::KilledByCancellation {
                    translator.fail(&err);
                    debug!("Run cancelled, closing stream without a chunk");
                    return Outcome::Cancelled;
                }
                translator.fail(&err).into_iter().collect()
            }
            Step::Event(None) => {
                // upstream ended without a terminal event
                translator.on_event(
                    ProviderEvent::new(u64::MAX, ProviderEventKind::StreamEnd),
                    Instant::now(),
                )
            }
            Step::Tick => translator.on_tick(Instant::now()).into_iter().collect(),
        };

        for chunk in chunks {
            let outcome = match &chunk {
                StreamChunk::Done => Some(Outcome::Completed),
                StreamChunk::Error { error_kind, .. } => Some(Outcome::Failed(*error_kind)),
                StreamChunk::Content { .. } | StreamChunk::Progress { .. } => None,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                sent = tx.send(redactor.redact_chunk(chunk)) => {
                    if sent.is_err() {
                        return Outcome::ClientGone;
                    }
                }
            }
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }
}
