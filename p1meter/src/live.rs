//! Short-term live view of power flow.
//!
//! Keeps the last few minutes of delivered/returned power in memory for
//! dashboards. Nothing here is persisted.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;

use crate::envelope::Envelope;
use crate::obis;

/// One power reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSample {
    /// Capture time of the envelope.
    pub at: DateTime<Utc>,
    /// Power taken from the grid, in kW.
    pub power_in: Option<Decimal>,
    /// Power returned to the grid, in kW.
    pub power_out: Option<Decimal>,
}

/// Bounded buffer of recent [`LiveSample`]s.
///
/// Samples older than the configured span, measured from the newest sample,
/// are evicted on insert. A hard capacity bounds memory if the meter sends
/// faster than expected.
#[derive(Debug, Clone)]
pub struct LiveBuffer {
    span: TimeDelta,
    capacity: usize,
    samples: VecDeque<LiveSample>,
}

impl LiveBuffer {
    /// Creates a buffer covering `span`.
    ///
    /// Capacity allows two samples per second of span, since DSMR 5 meters
    /// send one telegram per second.
    pub fn new(span: Duration) -> Self {
        let capacity = usize::try_from(span.as_secs().saturating_mul(2))
            .unwrap_or(usize::MAX)
            .clamp(2, 1 << 16);
        Self {
            span: TimeDelta::from_std(span).unwrap_or(TimeDelta::MAX),
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Records the power fields of an envelope.
    ///
    /// Envelopes without either power field are ignored.
    pub fn record(&mut self, envelope: &Envelope) {
        let sample = LiveSample {
            at: envelope.captured_at,
            power_in: envelope.measurement.number(obis::POWER_DELIVERED),
            power_out: envelope.measurement.number(obis::POWER_RETURNED),
        };
        if sample.power_in.is_none() && sample.power_out.is_none() {
            return;
        }
        self.push(sample);
    }

    /// Adds a sample and evicts what fell out of the span.
    pub fn push(&mut self, sample: LiveSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        if let Some(horizon) = sample.at.checked_sub_signed(self.span) {
            while self.samples.front().is_some_and(|s| s.at < horizon) {
                self.samples.pop_front();
            }
        }
    }

    /// Samples oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LiveSample> {
        self.samples.iter()
    }

    /// The most recent sample.
    pub fn latest(&self) -> Option<&LiveSample> {
        self.samples.back()
    }

    /// Mean delivered and returned power over the buffer.
    pub fn average(&self) -> (Option<Decimal>, Option<Decimal>) {
        (
            mean(self.samples.iter().filter_map(|s| s.power_in)),
            mean(self.samples.iter().filter_map(|s| s.power_out)),
        )
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn mean(values: impl Iterator<Item = Decimal>) -> Option<Decimal> {
    let (sum, count) = values.fold((Decimal::ZERO, 0u32), |(sum, n), v| {
        (sum.saturating_add(v), n + 1)
    });
    if count == 0 {
        return None;
    }
    sum.checked_div(Decimal::from(count)).map(|m| m.round_dp(3))
}
