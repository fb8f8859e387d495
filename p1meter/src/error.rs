//! Error types for the p1meter pipeline.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all p1meter operations.
///
/// Each variant wraps the error enum of one pipeline stage. Only
/// [`TransportError::Lost`] is meant to end a process; everything else is
/// scoped to a single telegram, datagram or flush.
#[derive(Error, Debug)]
pub enum P1Error {
    /// A telegram failed framing, checksum or field validation.
    #[error("telegram error: {0}")]
    Telegram(#[from] TelegramError),

    /// An envelope could not be published.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// A datagram could not be turned back into an envelope.
    #[error("subscribe error: {0}")]
    Subscribe(#[from] SubscribeError),

    /// A window snapshot could not be written to its sink.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// The raw byte stream or the socket is gone.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration could not be loaded or is inconsistent.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors produced while decoding a single telegram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelegramError {
    /// The start marker, end marker or checksum digits are missing.
    #[error("framing error: {reason}")]
    Framing {
        /// What was wrong with the frame.
        reason: String,
    },

    /// The CRC computed over the frame differs from the transmitted one.
    #[error("checksum mismatch: telegram says {expected:04X}, computed {computed:04X}")]
    Checksum {
        /// Checksum transmitted after the `!` marker.
        expected: u16,
        /// Checksum computed over `/` through `!`.
        computed: u16,
    },

    /// A data line does not follow the OBIS grammar or names an unknown code.
    #[error("cannot decode line '{line}': {reason}")]
    FieldDecode {
        /// The offending line, verbatim.
        line: String,
        /// Why the line was rejected.
        reason: String,
    },
}

/// Errors that can occur when publishing an envelope.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The encoded envelope does not fit into one datagram.
    #[error("encoded envelope is {size} bytes, datagram limit is {limit}")]
    Oversize {
        /// Encoded size in bytes.
        size: usize,
        /// Configured datagram limit.
        limit: usize,
    },

    /// Failed to serialize the envelope to JSON.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// The socket refused the datagram.
    #[error("failed to send datagram to {target}: {source}")]
    Send {
        /// Destination of the datagram.
        target: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur when receiving envelopes.
#[derive(Error, Debug)]
pub enum SubscribeError {
    /// A datagram is not a valid envelope.
    #[error("malformed datagram ({len} bytes) from {from}: {source}")]
    Deserialization {
        /// Sender of the datagram.
        from: SocketAddr,
        /// Datagram length in bytes.
        len: usize,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur while writing window snapshots.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink file could not be opened or created.
    #[error("failed to open sink '{}': {source}", path.display())]
    Open {
        /// The sink file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Appending a snapshot failed.
    #[error("failed to write sink '{}': {source}", path.display())]
    Write {
        /// The sink file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Moving the previous file aside failed.
    #[error("failed to rotate sink '{}': {source}", path.display())]
    Rotate {
        /// The sink file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot could not be serialized.
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors on the underlying byte stream or socket.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The raw byte stream ended or failed; fatal for the reader.
    #[error("transport '{name}' lost: {reason}")]
    Lost {
        /// Device path or socket description.
        name: String,
        /// What happened.
        reason: String,
    },

    /// A socket could not be bound or configured.
    #[error("failed to set up socket on {addr}: {source}")]
    Bind {
        /// Address being bound or joined.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Description of the problem.
        reason: String,
    },
}

/// Type alias for `Result<T, P1Error>`.
pub type Result<T> = std::result::Result<T, P1Error>;
