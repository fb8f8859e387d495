//! The message distributed on the multicast channel.
//!
//! An [`Envelope`] is encoded as one JSON object per datagram. Field names
//! are inline, so subscribers built against an older OBIS table keep
//! working when the meter starts sending new codes.
//!
//! ```text
//! {
//!   "sequence": 42,
//!   "captured_at": "2021-06-08T11:00:46.120Z",
//!   "parse_duration_ms": 870,
//!   "measurement": {
//!     "header": "/ISK5\\2M550T-1013",
//!     "fields": {
//!       "1-0:1.8.1": { "type": "number", "value": "1.651", "unit": "kWh" },
//!       ...
//!     }
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::telegram::Measurement;

/// A measurement plus distribution metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-process counter starting at 1; restarts with the publisher.
    pub sequence: u64,
    /// Wall-clock time at which the telegram's first byte was read.
    pub captured_at: DateTime<Utc>,
    /// Milliseconds between first byte and decoded measurement.
    pub parse_duration_ms: u64,
    /// The decoded telegram.
    pub measurement: Measurement,
}

impl Envelope {
    /// Encodes the envelope as compact JSON.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; cannot happen for well-formed values.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decodes an envelope from a datagram payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a JSON envelope.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
