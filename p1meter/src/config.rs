//! Configuration for the reader and listener.
//!
//! Configuration is a JSON document; every section and every key is
//! optional and falls back to the values the original deployment used.
//! Durations are written as seconds.
//!
//! ```json
//! {
//!   "transport": { "device": "/dev/ttyUSB0" },
//!   "multicast": { "group": "224.7.2.1", "port": 52001, "ttl": 2 },
//!   "parser": { "ignore_unknown_fields": true },
//!   "aggregator": { "interval": 300, "key_fields": ["1-0:1.7.0", "1-0:2.7.0"] },
//!   "sinks": { "day": "/var/lib/p1/day-%Y%m%d.jsonl" }
//! }
//! ```

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::framer::DEFAULT_MAX_FRAME;
use crate::obis::{self, ObisField, ObisTable};
use crate::telegram::TelegramParser;

/// Largest UDP payload that fits an IPv4 datagram.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Default datagram limit; matches the listener's receive buffer.
pub const DEFAULT_MAX_DATAGRAM: usize = 10_240;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Raw byte stream settings.
    pub transport: TransportConfig,
    /// Distribution channel settings.
    pub multicast: MulticastConfig,
    /// Telegram decoding settings.
    pub parser: ParserConfig,
    /// Rollup and rotation settings.
    pub aggregator: AggregatorConfig,
    /// Output file templates.
    pub sinks: SinkConfig,
}

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, is not valid JSON,
    /// or fails [`Config::validate`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Checks ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregator;

        if agg.interval.as_secs() == 0 {
            return Err(invalid("aggregator.interval must be at least one second"));
        }
        if agg.interval > Duration::from_secs(86_400) {
            return Err(invalid("aggregator.interval must not exceed one day"));
        }
        if agg.tick.is_zero() || agg.tick > agg.interval {
            return Err(invalid(format!(
                "aggregator.tick ({:?}) must be non-zero and <= interval ({:?})",
                agg.tick, agg.interval
            )));
        }
        if agg.detail_flush.is_zero() {
            return Err(invalid("aggregator.detail_flush cannot be zero"));
        }
        if agg.live_window.is_zero() {
            return Err(invalid("aggregator.live_window cannot be zero"));
        }
        if agg.queue_capacity == 0 {
            return Err(invalid("aggregator.queue_capacity cannot be zero"));
        }

        if self.multicast.port == 0 {
            return Err(invalid("multicast.port cannot be zero"));
        }
        if !(512..=MAX_UDP_PAYLOAD).contains(&self.multicast.max_datagram) {
            return Err(invalid(format!(
                "multicast.max_datagram must be within 512..={MAX_UDP_PAYLOAD}"
            )));
        }
        if self.transport.max_frame < 64 {
            return Err(invalid("transport.max_frame must be at least 64 bytes"));
        }

        for field in &self.parser.extra_fields {
            let bare = field.code.split('.').take(3).collect::<Vec<_>>().join(".");
            if !obis::is_obis_code(&bare) {
                return Err(invalid(format!(
                    "parser.extra_fields: '{}' is not an OBIS code",
                    field.code
                )));
            }
        }

        for (name, template) in self.sinks.templates() {
            if template.is_empty() {
                return Err(invalid(format!("sinks.{name} cannot be empty")));
            }
            if StrftimeItems::new(template).any(|item| matches!(item, Item::Error)) {
                return Err(invalid(format!(
                    "sinks.{name}: invalid strftime pattern '{template}'"
                )));
            }
        }

        Ok(())
    }

    /// Builds the telegram parser described by the `parser` section.
    pub fn telegram_parser(&self) -> TelegramParser {
        let table = ObisTable::dsmr().extended(self.parser.extra_fields.iter().cloned());
        TelegramParser::new(table, self.parser.ignore_unknown_fields)
    }
}

fn invalid(reason: impl Into<String>) -> crate::error::P1Error {
    ConfigError::Invalid {
        reason: reason.into(),
    }
    .into()
}

/// Raw byte stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Device or file to read telegrams from; `-` reads stdin.
    pub device: String,
    /// Partial telegrams longer than this are dropped.
    pub max_frame: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

/// Distribution channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    /// Group address (any IPv4 address; unicast works for point-to-point).
    pub group: Ipv4Addr,
    /// UDP port.
    pub port: u16,
    /// Multicast TTL; 1 keeps datagrams on the local segment.
    pub ttl: u32,
    /// Local interface used to join the group.
    pub interface: Ipv4Addr,
    /// Largest encoded envelope the publisher will send.
    pub max_datagram: usize,
}

impl MulticastConfig {
    /// The destination socket address.
    pub fn target(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(224, 7, 2, 1),
            port: 52001,
            ttl: 1,
            interface: Ipv4Addr::UNSPECIFIED,
            max_datagram: DEFAULT_MAX_DATAGRAM,
        }
    }
}

/// Telegram decoding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Skip unknown codes and malformed lines instead of rejecting the telegram.
    pub ignore_unknown_fields: bool,
    /// Codes added to the built-in DSMR table.
    pub extra_fields: Vec<ObisField>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            ignore_unknown_fields: true,
            extra_fields: Vec::new(),
        }
    }
}

/// Rollup and rotation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Length of the interval cadence.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Period of the boundary-check timer.
    #[serde(with = "duration_secs")]
    pub tick: Duration,
    /// How often buffered detail records are appended to the day's file.
    #[serde(with = "duration_secs")]
    pub detail_flush: Duration,
    /// Span of the in-memory live view.
    #[serde(with = "duration_secs")]
    pub live_window: Duration,
    /// Envelopes whose parse duration exceeds this are reported.
    #[serde(with = "duration_secs")]
    pub slow_frame: Duration,
    /// Envelopes captured further than this ahead of the local clock are
    /// reported as coming from a publisher with a wrong clock.
    #[serde(with = "duration_secs")]
    pub max_clock_skew: Duration,
    /// How long shutdown waits for the final flush.
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
    /// Fields summarised in the weekly log.
    pub key_fields: Vec<String>,
    /// Capacity of the aggregator's event queue.
    pub queue_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            tick: Duration::from_secs(1),
            detail_flush: Duration::from_secs(300),
            live_window: Duration::from_secs(120),
            slow_frame: Duration::from_millis(500),
            max_clock_skew: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            key_fields: vec![
                obis::POWER_DELIVERED.to_string(),
                obis::POWER_RETURNED.to_string(),
                "1-0:32.7.0".to_string(),
                "1-0:52.7.0".to_string(),
                "1-0:72.7.0".to_string(),
            ],
            queue_capacity: 1024,
        }
    }
}

/// Output file templates, formatted with the window start in local time.
///
/// The interval file only ever holds the open interval; on rotation it is
/// moved aside to `<path>.prev`, replacing the copy before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Every envelope, one file per day.
    pub detail: String,
    /// Interval rollups.
    pub interval: String,
    /// Day rollups.
    pub day: String,
    /// Weekly summaries.
    pub week: String,
}

impl SinkConfig {
    /// All templates with their key names.
    pub fn templates(&self) -> [(&'static str, &str); 4] {
        [
            ("detail", self.detail.as_str()),
            ("interval", self.interval.as_str()),
            ("day", self.day.as_str()),
            ("week", self.week.as_str()),
        ]
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            detail: "/tmp/p1_reader_details-%Y%m%d.jsonl".to_string(),
            interval: "/tmp/p1_reader_interval.jsonl".to_string(),
            day: "/tmp/p1_reader_day-%Y.jsonl".to_string(),
            week: "/tmp/p1_reader_week-%G-W%V.jsonl".to_string(),
        }
    }
}

/// Serde support for Duration fields written as (fractional) seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(de::Error::custom)
    }
}
