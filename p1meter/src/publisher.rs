//! Envelope publishing.
//!
//! The publisher numbers each measurement, attaches capture timing and sends
//! it as one UDP datagram. Multicast has no back-channel, so an envelope
//! that cannot be sent is logged and dropped; it is never retried.

use std::net::{Ipv4Addr, SocketAddr};

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;

use crate::config::MulticastConfig;
use crate::envelope::Envelope;
use crate::error::{PublishError, TransportError};
use crate::telegram::Measurement;

/// Numbers measurements and turns them into envelopes.
///
/// Kept separate from the socket so sequencing and size checks can be used
/// without network access.
#[derive(Debug)]
pub struct Stamper {
    next_sequence: u64,
    max_datagram: usize,
}

impl Stamper {
    /// Creates a stamper whose first envelope has sequence number 1.
    pub fn new(max_datagram: usize) -> Self {
        Self {
            next_sequence: 1,
            max_datagram,
        }
    }

    /// Wraps a measurement with sequence number and capture timing.
    ///
    /// `received_at` is the instant the telegram's first byte was read and
    /// `parsed_at` the instant decoding finished.
    pub fn stamp(
        &mut self,
        measurement: Measurement,
        received_at: DateTime<Utc>,
        parsed_at: DateTime<Utc>,
    ) -> Envelope {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let parse_duration_ms = u64::try_from((parsed_at - received_at).num_milliseconds())
            .unwrap_or_default();

        Envelope {
            sequence,
            captured_at: received_at,
            parse_duration_ms,
            measurement,
        }
    }

    /// Encodes an envelope, enforcing the datagram limit.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Oversize`] if the JSON does not fit, or
    /// [`PublishError::Encode`] if serialization fails.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, PublishError> {
        let bytes = envelope.to_json()?;
        if bytes.len() > self.max_datagram {
            return Err(PublishError::Oversize {
                size: bytes.len(),
                limit: self.max_datagram,
            });
        }
        Ok(bytes)
    }

    /// Sequence number the next envelope will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// Sends envelopes to the distribution channel.
#[derive(Debug)]
pub struct Publisher {
    socket: UdpSocket,
    target: SocketAddr,
    stamper: Stamper,
}

impl Publisher {
    /// Opens a sending socket for the configured group.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the socket cannot be created or
    /// the multicast options cannot be set.
    pub async fn bind(config: &MulticastConfig) -> Result<Self, TransportError> {
        let target = config.target();
        let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local,
                source,
            })?;

        if config.group.is_multicast() {
            socket
                .set_multicast_ttl_v4(config.ttl)
                .map_err(|source| TransportError::Bind {
                    addr: target,
                    source,
                })?;
        }

        tracing::info!(%target, ttl = config.ttl, "publisher ready");
        Ok(Self {
            socket,
            target,
            stamper: Stamper::new(config.max_datagram),
        })
    }

    /// Stamps, encodes and sends one measurement.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the envelope is too large or the socket
    /// rejects it. The envelope is dropped in both cases.
    pub async fn publish(
        &mut self,
        measurement: Measurement,
        received_at: DateTime<Utc>,
        parsed_at: DateTime<Utc>,
    ) -> Result<Envelope, PublishError> {
        let envelope = self.stamper.stamp(measurement, received_at, parsed_at);
        let bytes = self.stamper.encode(&envelope)?;

        self.socket
            .send_to(&bytes, self.target)
            .await
            .map_err(|source| PublishError::Send {
                target: self.target,
                source,
            })?;

        tracing::debug!(
            sequence = envelope.sequence,
            bytes = bytes.len(),
            "published envelope"
        );
        Ok(envelope)
    }

    /// Destination of published datagrams.
    pub fn target(&self) -> SocketAddr {
        self.target
    }
}
