//! Stream Translation
//!
//! Provider events in, client chunks out.
//!
//! ```text
//! ProviderEvent ──► StreamTranslator ──► PathRedactor ──► StreamChunk
//!                     │
//!                     ├── FinalOnly: accumulate, emit once at StreamEnd
//!                     └── Progress:  emit content now, markers during silence
//! ```

mod markers;
mod redact;
mod translator;

pub use markers::{GlyphCursor, MarkerPolicy, CIRCLE_PHASES, HOURGLASS};
pub use redact::{PathRedactor, SANDBOX_PLACEHOLDER};
pub use translator::{EmissionMode, ProgressState, StreamChunk, StreamTranslator, TranslationState};
