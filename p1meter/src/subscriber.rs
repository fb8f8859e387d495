//! Envelope reception.
//!
//! A [`Subscriber`] joins the multicast group and yields envelopes in
//! arrival order. Delivery is best-effort: malformed datagrams are logged
//! and skipped, and sequence anomalies are reported by the
//! [`SequenceTracker`] without reordering or holding anything back.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::config::MulticastConfig;
use crate::envelope::Envelope;
use crate::error::{SubscribeError, TransportError};

/// How a sequence number relates to what was seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First envelope from this sender.
    First,
    /// Exactly one more than the highest seen.
    InOrder,
    /// Some envelopes were never received.
    Gap {
        /// Number of sequence numbers skipped.
        missed: u64,
    },
    /// Same number as the highest seen.
    Duplicate,
    /// Lower than the highest seen, arriving late.
    OutOfOrder,
    /// The publisher restarted or a different publisher took over.
    Reset,
}

/// Classifies incoming sequence numbers per sender.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    sender: Option<SocketAddr>,
    highest: u64,
    missed: u64,
    duplicates: u64,
    resets: u64,
}

impl SequenceTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `sequence` from `from` and classifies it.
    pub fn observe(&mut self, from: SocketAddr, sequence: u64) -> SequenceCheck {
        let check = match self.sender {
            None => SequenceCheck::First,
            Some(sender) if sender != from => SequenceCheck::Reset,
            // Publishers count from 1, so a number far below the high-water
            // mark is a restart, even when its first envelopes were lost.
            Some(_)
                if sequence < self.highest
                    && (sequence == 1 || sequence < self.highest / 2) =>
            {
                SequenceCheck::Reset
            }
            Some(_) if sequence == self.highest + 1 => SequenceCheck::InOrder,
            Some(_) if sequence > self.highest => SequenceCheck::Gap {
                missed: sequence - self.highest - 1,
            },
            Some(_) if sequence == self.highest => SequenceCheck::Duplicate,
            Some(_) => SequenceCheck::OutOfOrder,
        };

        match check {
            SequenceCheck::First | SequenceCheck::Reset => {
                if check == SequenceCheck::Reset {
                    self.resets += 1;
                }
                self.sender = Some(from);
                self.highest = sequence;
            }
            SequenceCheck::InOrder => self.highest = sequence,
            SequenceCheck::Gap { missed } => {
                self.missed += missed;
                self.highest = sequence;
            }
            SequenceCheck::Duplicate => self.duplicates += 1,
            SequenceCheck::OutOfOrder => {}
        }
        check
    }

    /// Total sequence numbers skipped so far.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Total duplicates seen so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Number of publisher restarts observed.
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

/// Decodes one datagram payload.
///
/// # Errors
///
/// Returns [`SubscribeError::Deserialization`] if the payload is not an
/// envelope.
pub fn decode_datagram(bytes: &[u8], from: SocketAddr) -> Result<Envelope, SubscribeError> {
    Envelope::from_json(bytes).map_err(|source| SubscribeError::Deserialization {
        from,
        len: bytes.len(),
        source,
    })
}

/// Receives envelopes from the distribution channel.
#[derive(Debug)]
pub struct Subscriber {
    socket: UdpSocket,
    buffer: Vec<u8>,
    tracker: SequenceTracker,
    slow_frame: Duration,
}

impl Subscriber {
    /// Binds the receiving socket.
    ///
    /// For a multicast group the socket binds the wildcard address on the
    /// configured port and joins the group on `config.interface`. Any other
    /// address is bound directly, which is how tests receive over loopback.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if binding or joining fails.
    pub async fn bind(config: &MulticastConfig, slow_frame: Duration) -> Result<Self, TransportError> {
        let local = if config.group.is_multicast() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port))
        } else {
            config.target()
        };

        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local,
                source,
            })?;

        if config.group.is_multicast() {
            socket
                .join_multicast_v4(config.group, config.interface)
                .map_err(|source| TransportError::Bind {
                    addr: config.target(),
                    source,
                })?;
        }

        tracing::info!(
            group = %config.group,
            port = config.port,
            interface = %config.interface,
            "subscriber listening"
        );
        Ok(Self {
            socket,
            buffer: vec![0; config.max_datagram],
            tracker: SequenceTracker::new(),
            slow_frame,
        })
    }

    /// The bound local address.
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be queried.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next valid envelope.
    ///
    /// Malformed datagrams are logged and skipped. Sequence anomalies and
    /// slow frames are logged; the envelope is returned regardless.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Lost`] if the socket fails.
    pub async fn next(&mut self) -> Result<Envelope, TransportError> {
        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut self.buffer)
                .await
                .map_err(|e| TransportError::Lost {
                    name: "multicast socket".to_string(),
                    reason: e.to_string(),
                })?;

            let envelope = match decode_datagram(&self.buffer[..len], from) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping datagram");
                    continue;
                }
            };

            self.inspect(&envelope, from);
            return Ok(envelope);
        }
    }

    /// Sequence statistics since bind.
    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    fn inspect(&mut self, envelope: &Envelope, from: SocketAddr) {
        let sequence = envelope.sequence;
        match self.tracker.observe(from, sequence) {
            SequenceCheck::First => {
                tracing::info!(%from, sequence, "first envelope from publisher");
            }
            SequenceCheck::InOrder => {}
            SequenceCheck::Gap { missed } => {
                tracing::warn!(%from, sequence, missed, "missed envelopes");
            }
            SequenceCheck::Duplicate => {
                tracing::warn!(%from, sequence, "duplicate envelope");
            }
            SequenceCheck::OutOfOrder => {
                tracing::warn!(%from, sequence, "envelope arrived out of order");
            }
            SequenceCheck::Reset => {
                tracing::warn!(%from, sequence, "publisher restarted");
            }
        }

        if Duration::from_millis(envelope.parse_duration_ms) > self.slow_frame {
            tracing::warn!(
                sequence,
                parse_duration_ms = envelope.parse_duration_ms,
                captured_at = %envelope.captured_at,
                "slow telegram"
            );
        }
    }
}
