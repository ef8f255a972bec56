//! Event Parser
//!
//! Reassembles raw subprocess output into typed [`ProviderEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! stdout fragments ──► EventParser (arena + cursor) ──► records ──► ProviderEvent
//!                             │
//!                             └── ProviderEvents: Stream adapter used by the pipeline
//! ```
//!
//! Fragments may split records anywhere, including inside a multi-byte
//! character. Malformed records are skipped and counted; they only surface as
//! a `ProviderError` if the stream ends without a single valid record.

mod event;
mod records;
mod state_machine;
mod stream;

pub use event::{ProviderEvent, ProviderEventKind};
pub use records::OutputFormat;
pub use state_machine::{EventParser, ParseStats, DEFAULT_MAX_RECORD_BYTES};
pub use stream::ProviderEvents;
