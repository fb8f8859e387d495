//! The reader side: raw bytes in, envelopes out.
//!
//! Reads the meter's byte stream, frames and validates telegrams and
//! publishes every valid one. A bad telegram is logged and skipped; only
//! losing the stream itself ends the loop.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::Config;
use crate::error::TransportError;
use crate::framer::Framer;
use crate::publisher::Publisher;
use crate::telegram::TelegramParser;

const READ_BUFFER: usize = 4096;

/// Counters over the reader's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Complete frames seen.
    pub telegrams: u64,
    /// Frames rejected by the parser.
    pub rejected: u64,
    /// Envelopes sent.
    pub published: u64,
    /// Envelopes dropped by the publisher.
    pub publish_failures: u64,
}

/// Frames, parses and publishes telegrams.
#[derive(Debug)]
pub struct Reader {
    framer: Framer,
    parser: TelegramParser,
    publisher: Publisher,
    stats: ReaderStats,
}

impl Reader {
    /// Creates a reader using the transport and parser settings of `config`.
    pub fn new(config: &Config, publisher: Publisher) -> Self {
        Self {
            framer: Framer::new(config.transport.max_frame),
            parser: config.telegram_parser(),
            publisher,
            stats: ReaderStats::default(),
        }
    }

    /// Processes bytes read at `now`.
    pub async fn feed(&mut self, bytes: &[u8], now: DateTime<Utc>) {
        for frame in self.framer.push(bytes, now) {
            self.stats.telegrams += 1;

            let measurement = match self.parser.parse(&frame.bytes) {
                Ok(measurement) => measurement,
                Err(e) => {
                    self.stats.rejected += 1;
                    tracing::warn!(
                        received_at = %frame.received_at,
                        bytes = frame.bytes.len(),
                        error = %e,
                        "rejected telegram"
                    );
                    continue;
                }
            };

            match self
                .publisher
                .publish(measurement, frame.received_at, Utc::now())
                .await
            {
                Ok(_) => self.stats.published += 1,
                Err(e) => {
                    self.stats.publish_failures += 1;
                    tracing::warn!(error = %e, "envelope dropped");
                }
            }
        }
    }

    /// Reads `source` until it ends or fails, and returns why it stopped.
    ///
    /// `name` identifies the source in the returned error.
    pub async fn run<R>(&mut self, mut source: R, name: &str) -> TransportError
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; READ_BUFFER];
        loop {
            match source.read(&mut buffer).await {
                Ok(0) => {
                    return TransportError::Lost {
                        name: name.to_string(),
                        reason: "end of stream".to_string(),
                    };
                }
                Ok(n) => self.feed(&buffer[..n], Utc::now()).await,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return TransportError::Lost {
                        name: name.to_string(),
                        reason: e.to_string(),
                    };
                }
            }
        }
    }

    /// Lifetime counters.
    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    /// Bytes discarded by the framer while resynchronising.
    pub fn discarded_bytes(&self) -> u64 {
        self.framer.discarded_bytes()
    }
}
