//! # p1meter
//!
//! DSMR P1 smart meter telemetry: telegram validation, local-network
//! distribution and multi-cadence rollups.
//!
//! A smart meter's P1 port emits a telegram every second (DSMR 5) or every
//! ten seconds (DSMR 4). The reader side of this crate frames and validates
//! those telegrams and publishes each one as a JSON envelope on a UDP
//! multicast group. The listener side receives envelopes and keeps four
//! windows (detail, interval, day, week) that are flushed to JSON-lines
//! files when their period ends.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - A telegram with a bad CRC never produces fields
//! - Numbers keep the exact digits the meter sent (fixed-point, no floats)
//! - Best-effort delivery: gaps and restarts are reported, never retried
//! - All window state lives in one task fed by one queue
//!
//! ## Quick Start
//!
//! ```rust
//! use p1meter::{TelegramParser, checksum::crc16};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut telegram = b"/ISK5\\2M550T-1013\r\n1-0:1.8.0(00123.456*kWh)\r\n!".to_vec();
//! let crc = crc16(&telegram);
//! telegram.extend_from_slice(format!("{crc:04X}").as_bytes());
//!
//! let measurement = TelegramParser::default().parse(&telegram)?;
//! assert_eq!(measurement.number("1-0:1.8.0").unwrap().to_string(), "123.456");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! bytes ─► Framer ─► TelegramParser ─► Publisher ─► UDP ─► Subscriber ─► Aggregator ─► sinks
//! ```
//!
//! - [`Framer`]: Splits the raw byte stream into telegrams
//! - [`TelegramParser`]: Checks the CRC and decodes OBIS lines into a [`Measurement`]
//! - [`Publisher`] / [`Subscriber`]: Envelope transport over UDP multicast
//! - [`Aggregator`]: Owns the windows, rotates them and drives the sinks
//!
//! ## Modules
//!
//! - [`telegram`]: Telegram grammar and values
//! - [`obis`]: OBIS code table
//! - [`checksum`]: CRC-16/ARC
//! - [`window`]: Cadences, boundaries and rollups
//! - [`sink`]: Snapshot destinations
//! - [`config`]: Configuration file
//! - [`error`]: Error types

pub mod aggregator;
pub mod checksum;
pub mod config;
pub mod envelope;
pub mod error;
pub mod framer;
pub mod live;
pub mod obis;
pub mod publisher;
pub mod reader;
pub mod sink;
pub mod subscriber;
pub mod telegram;
pub mod window;

// Re-export primary API types at crate root for convenience.
pub use aggregator::{Aggregator, Event, SinkSet};
pub use config::Config;
pub use envelope::Envelope;
pub use error::{P1Error, Result};
pub use framer::Framer;
pub use obis::ObisTable;
pub use publisher::Publisher;
pub use reader::Reader;
pub use subscriber::Subscriber;
pub use telegram::{Measurement, TelegramParser, Value};
pub use window::{Cadence, Snapshot};
