//! Incremental Event Parser
//!
//! A buffering state machine over an unbounded byte stream. Raw fragments are
//! appended to an arena; a cursor marks how far the arena has been consumed.
//!
//! ```text
//!   arena:  [ consumed ........ | pending record bytes ...... ]
//!                               ^ cursor
//! ```
//!
//! Complete records (newline terminated) are decoded as soon as they are
//! available. The consumed prefix is compacted away once it exceeds half of
//! the arena, and a single record may never grow past `max_record_bytes`.

use tracing::{debug, warn};

use super::event::{ProviderEvent, ProviderEventKind};
use super::records::{decode_json_record, is_preamble_noise, Decoded, OutputFormat};

/// Default cap on a single provider record
pub const DEFAULT_MAX_RECORD_BYTES: usize = 8 * 1024 * 1024;

/// A plain-text preamble this long without a newline is treated as content
const PREAMBLE_FLUSH_BYTES: usize = 500;

/// Characters of a malformed record included in log output
const PREVIEW_CHARS: usize = 120;

/// Counters describing what the parser has seen
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Records that decoded successfully
    pub valid_records: u64,
    /// Records that were skipped as unparseable or oversized
    pub malformed_records: u64,
    /// Events emitted so far
    pub events: u64,
}

/// Turns raw subprocess output into [`ProviderEvent`]s
///
/// One parser serves exactly one request. After [`EventParser::finish`] it
/// emits nothing further.
#[derive(Debug)]
pub struct EventParser {
    format: OutputFormat,
    arena: Vec<u8>,
    cursor: usize,
    next_seq: u64,
    max_record_bytes: usize,
    /// Dropping the tail of an oversized record up to its newline
    discarding: bool,
    /// Plain text: noise filtering has ended
    preamble_done: bool,
    finished: bool,
    stats: ParseStats,
}

impl EventParser {
    /// Create a parser for the given output format
    #[must_use]
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            arena: Vec::with_capacity(4096),
            cursor: 0,
            next_seq: 0,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            discarding: false,
            preamble_done: false,
            finished: false,
            stats: ParseStats::default(),
        }
    }

    /// Override the per-record size cap
    #[must_use]
    pub fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max.max(1);
        self
    }

    /// Output format this parser decodes
    #[must_use]
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Parse statistics so far
    #[must_use]
    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    /// Bytes received but not yet turned into events
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.arena.len() - self.cursor
    }

    /// Feed one raw fragment, returning every event it completes
    pub fn feed(&mut self, fragment: &[u8]) -> Vec<ProviderEvent> {
        if self.finished {
            debug!(bytes = fragment.len(), "Fragment after finish ignored");
            return Vec::new();
        }
        self.arena.extend_from_slice(fragment);

        let mut out = Vec::new();
        match self.format {
            OutputFormat::StreamJson => self.drain_json(&mut out),
            OutputFormat::PlainText => self.drain_text(&mut out),
        }
        self.compact();
        out
    }

    /// Decode a trailing unterminated record without ending the stream
    ///
    /// Used when the producer fails; events already complete in the buffer
    /// are still delivered ahead of the failure.
    pub fn flush_pending(&mut self) -> Vec<ProviderEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        if self.discarding {
            self.discarding = false;
        } else if self.pending_bytes() > 0 {
            let record = self.arena[self.cursor..].to_vec();
            match self.format {
                OutputFormat::StreamJson => self.json_record(&record, &mut out),
                OutputFormat::PlainText => {
                    let text = String::from_utf8_lossy(&record).into_owned();
                    if self.preamble_done || !is_preamble_noise(&text) {
                        self.preamble_done = true;
                        self.text(text, &mut out);
                    }
                }
            }
        }
        self.arena.clear();
        self.cursor = 0;
        out
    }

    /// Flush any trailing record and terminate the event sequence
    pub fn finish(&mut self) -> Vec<ProviderEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut out = self.flush_pending();
        self.finished = true;

        if self.stats.valid_records == 0 && self.stats.malformed_records > 0 {
            let message = format!(
                "tool produced no valid output ({} malformed record{})",
                self.stats.malformed_records,
                if self.stats.malformed_records == 1 { "" } else { "s" }
            );
            self.push(ProviderEventKind::ProviderError { message }, &mut out);
        }
        self.push(ProviderEventKind::StreamEnd, &mut out);

        debug!(
            valid = self.stats.valid_records,
            malformed = self.stats.malformed_records,
            events = self.stats.events,
            "Provider stream finished"
        );
        out
    }

    // ========================================================================
    // Record extraction
    // ========================================================================

    fn drain_json(&mut self, out: &mut Vec<ProviderEvent>) {
        while let Some(newline) = self.next_newline() {
            let start = self.cursor;
            self.cursor = newline + 1;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            let record = self.arena[start..newline].to_vec();
            self.json_record(&record, out);
        }
        self.enforce_record_cap();
    }

    fn drain_text(&mut self, out: &mut Vec<ProviderEvent>) {
        while !self.preamble_done {
            let Some(newline) = self.next_newline() else {
                if self.pending_bytes() > PREAMBLE_FLUSH_BYTES {
                    self.preamble_done = true;
                }
                break;
            };
            let line = String::from_utf8_lossy(&self.arena[self.cursor..=newline]).into_owned();
            self.cursor = newline + 1;
            if is_preamble_noise(&line) {
                debug!(line = %preview(line.trim()), "Dropped preamble noise");
                continue;
            }
            self.preamble_done = true;
            self.text(line, out);
        }

        if self.preamble_done && self.pending_bytes() > 0 {
            let pending = &self.arena[self.cursor..];
            // hold back an incomplete UTF-8 sequence at the tail
            let usable = match std::str::from_utf8(pending) {
                Ok(_) => pending.len(),
                Err(e) if e.error_len().is_none() => e.valid_up_to(),
                Err(_) => pending.len(),
            };
            if usable > 0 {
                let text = String::from_utf8_lossy(&pending[..usable]).into_owned();
                self.cursor += usable;
                self.text(text, out);
            }
        }
    }

    fn next_newline(&self) -> Option<usize> {
        self.arena[self.cursor..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|offset| self.cursor + offset)
    }

    fn enforce_record_cap(&mut self) {
        if self.discarding {
            self.arena.truncate(self.cursor);
            return;
        }
        if self.pending_bytes() > self.max_record_bytes {
            warn!(
                pending = self.pending_bytes(),
                max = self.max_record_bytes,
                "Provider record exceeds size cap, discarding"
            );
            self.stats.malformed_records += 1;
            self.arena.truncate(self.cursor);
            self.discarding = true;
        }
    }

    fn compact(&mut self) {
        if self.cursor == self.arena.len() {
            self.arena.clear();
            self.cursor = 0;
        } else if self.cursor > self.arena.len() / 2 {
            self.arena.drain(..self.cursor);
            self.cursor = 0;
        }
    }

    // ========================================================================
    // Event construction
    // ========================================================================

    fn json_record(&mut self, raw: &[u8], out: &mut Vec<ProviderEvent>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match decode_json_record(line) {
            Decoded::Valid(kinds) => {
                self.stats.valid_records += 1;
                for kind in kinds {
                    self.push(kind, out);
                }
            }
            Decoded::Malformed(reason) => {
                self.stats.malformed_records += 1;
                warn!(reason = %reason, line = %preview(line), "Skipping malformed provider record");
            }
        }
    }

    fn text(&mut self, text: String, out: &mut Vec<ProviderEvent>) {
        if text.is_empty() {
            return;
        }
        self.stats.valid_records += 1;
        self.push(ProviderEventKind::FinalAssistantText { text }, out);
    }

    fn push(&mut self, kind: ProviderEventKind, out: &mut Vec<ProviderEvent>) {
        out.push(ProviderEvent::new(self.next_seq, kind));
        self.next_seq += 1;
        self.stats.events += 1;
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() <= PREVIEW_CHARS {
        s.to_string()
    } else {
        let cut: String = s.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}…")
    }
}
