//! Incremental telegram framing over a raw byte stream.
//!
//! The serial port delivers a continuous stream in which telegrams are
//! separated by idle time and, after a reconnect, by arbitrary partial
//! data. The [`Framer`] buffers bytes and yields one [`Frame`] per complete
//! `/ ... !XXXX` block, resynchronising on the next `/` whenever it sees
//! noise or a truncated telegram.

use chrono::{DateTime, Utc};

use crate::telegram::{CHECKSUM_DIGITS, END_MARKER, START_MARKER};

/// Default upper bound for a single telegram.
///
/// A full DSMR 5 telegram with gas and failure log is roughly 1 KiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024;

/// A complete, not yet validated telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Bytes from `/` through the last checksum digit.
    pub bytes: Vec<u8>,
    /// Wall-clock time at which the `/` was read.
    pub received_at: DateTime<Utc>,
}

/// Splits a byte stream into telegram frames.
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    started_at: Option<DateTime<Utc>>,
    end_marker: Option<usize>,
    max_frame: usize,
    discarded: u64,
}

impl Framer {
    /// Creates a framer that drops partial frames longer than `max_frame`.
    pub fn new(max_frame: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_frame.min(DEFAULT_MAX_FRAME)),
            started_at: None,
            end_marker: None,
            max_frame,
            discarded: 0,
        }
    }

    /// Feeds bytes read at `now` and returns every frame they complete.
    pub fn push(&mut self, bytes: &[u8], now: DateTime<Utc>) -> Vec<Frame> {
        let mut frames = Vec::new();

        for &byte in bytes {
            if byte == START_MARKER {
                if !self.buffer.is_empty() {
                    self.discard("new start marker before end of telegram");
                }
                self.started_at = Some(now);
                self.buffer.push(byte);
                continue;
            }

            if self.started_at.is_none() {
                // Noise between telegrams.
                self.discarded += 1;
                continue;
            }

            if byte == END_MARKER && self.end_marker.is_none() {
                self.end_marker = Some(self.buffer.len());
            }
            self.buffer.push(byte);

            if let Some(frame) = self.complete_frame() {
                frames.push(frame);
            } else if self.buffer.len() > self.max_frame {
                self.discard("telegram exceeds maximum frame size");
            }
        }

        frames
    }

    /// Number of bytes dropped while resynchronising.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Returns `true` while a telegram is partially buffered.
    pub fn in_frame(&self) -> bool {
        self.started_at.is_some()
    }

    /// Emits the buffered frame once `!` and all checksum digits are in.
    fn complete_frame(&mut self) -> Option<Frame> {
        let end = self.end_marker?;
        if self.buffer.len() < end + 1 + CHECKSUM_DIGITS {
            return None;
        }

        let received_at = self.started_at.take()?;
        self.end_marker = None;
        Some(Frame {
            bytes: std::mem::take(&mut self.buffer),
            received_at,
        })
    }

    fn discard(&mut self, reason: &str) {
        tracing::warn!(
            bytes = self.buffer.len(),
            reason,
            "discarding partial telegram"
        );
        self.discarded += self.buffer.len() as u64;
        self.buffer.clear();
        self.started_at = None;
        self.end_marker = None;
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}
