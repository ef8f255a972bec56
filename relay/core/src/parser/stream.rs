//! Lazy event sequence over a fragment stream

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use super::event::ProviderEvent;
use super::state_machine::EventParser;
use crate::error::RelayError;

/// Adapts a stream of raw output fragments into a stream of provider events
///
/// A producer failure is yielded after every event that was already complete
/// in the buffer, and ends the sequence. A clean end of input yields the
/// parser's trailing events ending in `StreamEnd`.
pub struct ProviderEvents<S> {
    fragments: S,
    parser: EventParser,
    ready: VecDeque<ProviderEvent>,
    failure: Option<RelayError>,
    done: bool,
}

impl<S> ProviderEvents<S>
where
    S: Stream<Item = Result<Vec<u8>, RelayError>> + Unpin,
{
    /// Wrap `fragments` with `parser`
    pub fn new(fragments: S, parser: EventParser) -> Self {
        Self {
            fragments,
            parser,
            ready: VecDeque::new(),
            failure: None,
            done: false,
        }
    }

    /// Inner parser, for statistics
    #[must_use]
    pub fn parser(&self) -> &EventParser {
        &self.parser
    }
}

impl<S> Stream for ProviderEvents<S>
where
    S: Stream<Item = Result<Vec<u8>, RelayError>> + Unpin,
{
    type Item = Result<ProviderEvent, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(event) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if let Some(err) = this.failure.take() {
                return Poll::Ready(Some(Err(err)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.fragments).poll_next(cx) {
                Poll::Ready(Some(Ok(fragment))) => {
                    this.ready.extend(this.parser.feed(&fragment));
                }
                Poll::Ready(Some(Err(err))) => {
                    this.ready.extend(this.parser.flush_pending());
                    this.failure = Some(err);
                    this.done = true;
                }
                Poll::Ready(None) => {
                    this.ready.extend(this.parser.finish());
                    this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{OutputFormat, ProviderEventKind};
    use futures::{stream, StreamExt};

    #[tokio::test]
    async fn test_events_then_end() {
        let fragments = stream::iter(vec![
            Ok(b"{\"type\":\"result\",".to_vec()),
            Ok(b"\"result\":\"hi\"}\n".to_vec()),
        ]);
        let events: Vec<_> = ProviderEvents::new(fragments, EventParser::new(OutputFormat::StreamJson))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].as_ref().map(|e| &e.kind),
            Ok(ProviderEventKind::FinalAssistantText { .. })
        ));
        assert!(matches!(
            events[1].as_ref().map(|e| &e.kind),
            Ok(ProviderEventKind::StreamEnd)
        ));
    }

    #[tokio::test]
    async fn test_failure_after_buffered_events() {
        let fragments = stream::iter(vec![
            Ok(b"partial answer".to_vec()),
            Err(RelayError::non_zero_exit(Some(1), "bad auth")),
            Ok(b"never read".to_vec()),
        ]);
        let mut events = ProviderEvents::new(fragments, EventParser::new(OutputFormat::PlainText));

        let first = events.next().await;
        assert!(matches!(
            first,
            Some(Ok(ProviderEvent {
                kind: ProviderEventKind::FinalAssistantText { .. },
                ..
            }))
        ));
        let second = events.next().await;
        assert!(matches!(second, Some(Err(RelayError::NonZeroExit { .. }))));
        assert!(events.next().await.is_none());
    }
}
