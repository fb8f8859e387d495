//! Time windows and their accumulated state.
//!
//! Every cadence owns exactly one [`Window`] at a time. Windows are
//! half-open `[start, end)` and contiguous: when one is flushed the next
//! starts where it ended (or at the boundary containing the triggering
//! instant, when whole periods passed without data).
//!
//! # Accumulation
//!
//! ```text
//! detail    every envelope, verbatim
//! interval  last value per field, counter deltas, min/avg/max
//! day       same as interval
//! week      counter deltas, min/avg/max of key fields
//! ```
//!
//! Counter deltas are measured against the last reading of the previous
//! window, so consecutive rollups add up without gaps. A counter that goes
//! down is taken as a meter reset: consumption up to the reset is kept and
//! counting restarts from zero.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::obis::{FieldKind, ObisTable};
use crate::telegram::{Value, decimal_str};

/// Time granularity of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Every envelope, one window per local day.
    Detail,
    /// Fixed-length rollups aligned to the Unix epoch.
    Interval,
    /// Local calendar day.
    Day,
    /// ISO week starting Monday 00:00 local time.
    Week,
}

impl Cadence {
    /// All cadences, in flush order.
    pub const ALL: [Cadence; 4] = [Self::Detail, Self::Interval, Self::Day, Self::Week];

    /// Position in [`Cadence::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Detail => "detail",
            Self::Interval => "interval",
            Self::Day => "day",
            Self::Week => "week",
        })
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    /// First instant inside the window.
    pub start: DateTime<Utc>,
    /// First instant after the window.
    pub end: DateTime<Utc>,
}

impl Bounds {
    /// Returns `true` if `at` lies inside the range.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Computes window boundaries in a time zone.
///
/// Day and week boundaries follow the zone's local midnight, including DST
/// transitions. Interval boundaries are multiples of the interval since the
/// Unix epoch and ignore the zone.
#[derive(Debug, Clone)]
pub struct Calendar<Tz: TimeZone> {
    tz: Tz,
    interval_secs: i64,
}

impl<Tz: TimeZone> Calendar<Tz> {
    /// Creates a calendar for `tz` with the given interval length.
    ///
    /// Sub-second parts of `interval` are ignored; anything shorter than
    /// one second counts as one second.
    pub fn new(tz: Tz, interval: Duration) -> Self {
        let interval_secs = i64::try_from(interval.as_secs()).unwrap_or(i64::MAX).max(1);
        Self { tz, interval_secs }
    }

    /// The window of `cadence` that contains `at`.
    pub fn bounds(&self, cadence: Cadence, at: DateTime<Utc>) -> Bounds {
        match cadence {
            Cadence::Interval => {
                let secs = at.timestamp();
                let start = secs - secs.rem_euclid(self.interval_secs);
                Bounds {
                    start: from_secs(start),
                    end: from_secs(start.saturating_add(self.interval_secs)),
                }
            }
            Cadence::Detail | Cadence::Day => {
                let date = self.local_date(at);
                Bounds {
                    start: self.start_of_day(date),
                    end: self.start_of_day(add_days(date, 1)),
                }
            }
            Cadence::Week => {
                let date = self.local_date(at);
                let monday = date
                    .checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
                    .unwrap_or(NaiveDate::MIN);
                Bounds {
                    start: self.start_of_day(monday),
                    end: self.start_of_day(add_days(monday, 7)),
                }
            }
        }
    }

    /// The time zone used for local boundaries.
    pub fn tz(&self) -> &Tz {
        &self.tz
    }

    fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.tz).date_naive()
    }

    fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(NaiveTime::MIN);
        self.tz
            .from_local_datetime(&midnight)
            .earliest()
            // Midnight skipped by a DST jump: the day starts when clocks resume.
            .or_else(|| {
                self.tz
                    .from_local_datetime(&(midnight + TimeDelta::hours(1)))
                    .earliest()
            })
            .map_or_else(|| midnight.and_utc(), |t| t.with_timezone(&Utc))
    }
}

fn from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn add_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX)
}

/// Whether a window is accepting data or being written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Accumulating envelopes.
    Open,
    /// Snapshot taken, sink write in progress.
    Flushing,
}

/// Delta of a cumulative field over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Amount added during the window.
    #[serde(with = "decimal_str")]
    pub value: Decimal,
    /// Unit of the counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Number of meter resets seen in the window.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub resets: u32,
}

#[allow(clippy::trivially_copy_pass_by_ref)] // serde passes by reference
fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Min/avg/max of an instantaneous field over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    /// Smallest sample.
    #[serde(with = "decimal_str")]
    pub min: Decimal,
    /// Mean of all samples, rounded to three decimals.
    #[serde(with = "decimal_str")]
    pub avg: Decimal,
    /// Largest sample.
    #[serde(with = "decimal_str")]
    pub max: Decimal,
    /// Number of samples.
    pub count: u64,
    /// Unit of the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// One rollup record, as written by the interval, day and week sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    /// Cadence that produced the record.
    pub cadence: Cadence,
    /// Window start.
    pub start: DateTime<Utc>,
    /// Window end; earlier than the nominal end for forced flushes.
    pub end: DateTime<Utc>,
    /// Envelopes accumulated.
    pub samples: u64,
    /// Capture time of the first envelope.
    pub first_at: DateTime<Utc>,
    /// Capture time of the last envelope.
    pub last_at: DateTime<Utc>,
    /// Meter identification of the last envelope.
    pub header: String,
    /// Last value of every field; empty for weekly summaries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last: BTreeMap<String, Value>,
    /// Deltas of cumulative fields.
    pub deltas: BTreeMap<String, Delta>,
    /// Statistics of instantaneous fields.
    pub stats: BTreeMap<String, FieldStats>,
}

/// The owned content of a flushed window, handed to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Snapshot {
    /// Envelopes received since the last detail flush.
    Records(Vec<Envelope>),
    /// An interval or day rollup, or a weekly summary.
    Rollup(Rollup),
}

impl Snapshot {
    /// Number of envelopes the snapshot covers.
    pub fn samples(&self) -> u64 {
        match self {
            Self::Records(records) => records.len() as u64,
            Self::Rollup(rollup) => rollup.samples,
        }
    }
}

#[derive(Debug, Clone)]
struct Counter {
    baseline: Decimal,
    last: Decimal,
    carried: Decimal,
    resets: u32,
    unit: Option<String>,
}

impl Counter {
    fn new(baseline: Decimal, unit: Option<String>) -> Self {
        Self {
            baseline,
            last: baseline,
            carried: Decimal::ZERO,
            resets: 0,
            unit,
        }
    }

    fn observe(&mut self, code: &str, value: Decimal) {
        if value < self.last {
            tracing::warn!(
                code,
                previous = %self.last,
                current = %value,
                "counter went backwards, treating as meter reset"
            );
            self.carried += self.last - self.baseline;
            self.baseline = Decimal::ZERO;
            self.resets += 1;
        }
        self.last = value;
    }

    fn delta(&self) -> Delta {
        Delta {
            value: self.carried + self.last - self.baseline,
            unit: self.unit.clone(),
            resets: self.resets,
        }
    }
}

#[derive(Debug, Clone)]
struct Stats {
    min: Decimal,
    max: Decimal,
    sum: Decimal,
    count: u64,
    unit: Option<String>,
}

impl Stats {
    fn new(value: Decimal, unit: Option<String>) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
            count: 1,
            unit,
        }
    }

    fn add(&mut self, value: Decimal) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum = self.sum.saturating_add(value);
        self.count += 1;
    }

    fn summary(&self) -> FieldStats {
        let avg = self
            .sum
            .checked_div(Decimal::from(self.count))
            .unwrap_or(self.sum)
            .round_dp(3);
        FieldStats {
            min: self.min,
            avg,
            max: self.max,
            count: self.count,
            unit: self.unit.clone(),
        }
    }
}

/// Rollup accumulator for interval, day and week windows.
#[derive(Debug, Clone)]
struct Accumulator {
    keep_last: bool,
    stat_fields: Option<Vec<String>>,
    samples: u64,
    first_at: Option<DateTime<Utc>>,
    last_at: Option<DateTime<Utc>>,
    header: String,
    last: BTreeMap<String, Value>,
    counters: BTreeMap<String, Counter>,
    stats: BTreeMap<String, Stats>,
    // Survives resets so the next window's deltas continue seamlessly.
    baselines: BTreeMap<String, Decimal>,
}

impl Accumulator {
    fn new(keep_last: bool, stat_fields: Option<Vec<String>>) -> Self {
        Self {
            keep_last,
            stat_fields,
            samples: 0,
            first_at: None,
            last_at: None,
            header: String::new(),
            last: BTreeMap::new(),
            counters: BTreeMap::new(),
            stats: BTreeMap::new(),
            baselines: BTreeMap::new(),
        }
    }

    fn add(&mut self, envelope: &Envelope, table: &ObisTable) {
        let at = envelope.captured_at;
        self.samples += 1;
        self.first_at.get_or_insert(at);
        self.last_at = Some(at);
        envelope
            .measurement
            .header()
            .clone_into(&mut self.header);

        for (code, value) in envelope.measurement.iter() {
            if self.keep_last {
                self.last.insert(code.to_string(), value.clone());
            }

            let Some(number) = value.as_decimal() else {
                continue;
            };
            match table.kind(code) {
                Some(FieldKind::Cumulative) => {
                    let baselines = &self.baselines;
                    self.counters
                        .entry(code.to_string())
                        .or_insert_with(|| {
                            let baseline = baselines.get(code).copied().unwrap_or(number);
                            Counter::new(baseline, value.unit().map(str::to_string))
                        })
                        .observe(code, number);
                }
                Some(FieldKind::Instantaneous) if self.tracks_stats(code) => {
                    match self.stats.get_mut(code) {
                        Some(stats) => stats.add(number),
                        None => {
                            self.stats.insert(
                                code.to_string(),
                                Stats::new(number, value.unit().map(str::to_string)),
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn tracks_stats(&self, code: &str) -> bool {
        self.stat_fields
            .as_ref()
            .is_none_or(|fields| fields.iter().any(|f| f == code))
    }

    fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Builds the record for `[start, end)` and clears the accumulation.
    fn take(&mut self, cadence: Cadence, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Rollup> {
        let (Some(first_at), Some(last_at)) = (self.first_at.take(), self.last_at.take()) else {
            return None;
        };

        let rollup = Rollup {
            cadence,
            start,
            end,
            samples: self.samples,
            first_at,
            last_at,
            header: std::mem::take(&mut self.header),
            last: std::mem::take(&mut self.last),
            deltas: self
                .counters
                .iter()
                .map(|(code, counter)| (code.clone(), counter.delta()))
                .collect(),
            stats: self
                .stats
                .iter()
                .map(|(code, stats)| (code.clone(), stats.summary()))
                .collect(),
        };

        for (code, counter) in std::mem::take(&mut self.counters) {
            self.baselines.insert(code, counter.last);
        }
        self.stats.clear();
        self.samples = 0;
        Some(rollup)
    }
}

#[derive(Debug, Clone)]
enum Accumulation {
    Records(Vec<Envelope>),
    Rollup(Accumulator),
}

/// One cadence's current window.
#[derive(Debug, Clone)]
pub struct Window {
    cadence: Cadence,
    bounds: Bounds,
    state: WindowState,
    accumulation: Accumulation,
}

impl Window {
    /// Creates an empty window.
    ///
    /// `key_fields` limits the statistics of weekly summaries; other
    /// cadences keep statistics for every instantaneous field.
    pub fn new(cadence: Cadence, bounds: Bounds, key_fields: &[String]) -> Self {
        let accumulation = match cadence {
            Cadence::Detail => Accumulation::Records(Vec::new()),
            Cadence::Interval | Cadence::Day => Accumulation::Rollup(Accumulator::new(true, None)),
            Cadence::Week => {
                Accumulation::Rollup(Accumulator::new(false, Some(key_fields.to_vec())))
            }
        };
        Self {
            cadence,
            bounds,
            state: WindowState::Open,
            accumulation,
        }
    }

    /// The window's cadence.
    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Current boundaries.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Current state.
    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Returns `true` if data arrived since the last flush.
    pub fn is_dirty(&self) -> bool {
        match &self.accumulation {
            Accumulation::Records(records) => !records.is_empty(),
            Accumulation::Rollup(acc) => !acc.is_empty(),
        }
    }

    /// Adds one envelope.
    pub fn add(&mut self, envelope: &Envelope, table: &ObisTable) {
        match &mut self.accumulation {
            Accumulation::Records(records) => records.push(envelope.clone()),
            Accumulation::Rollup(acc) => acc.add(envelope, table),
        }
    }

    /// Marks the window as flushing and takes its content up to `until`.
    ///
    /// The accumulation is reset immediately. Returns `None` for an empty
    /// window. Call [`Window::reopen`] or [`Window::advance`] afterwards.
    pub fn take_snapshot(&mut self, until: DateTime<Utc>) -> Option<Snapshot> {
        self.state = WindowState::Flushing;
        let end = until.clamp(self.bounds.start, self.bounds.end);
        match &mut self.accumulation {
            Accumulation::Records(records) if records.is_empty() => None,
            Accumulation::Records(records) => Some(Snapshot::Records(std::mem::take(records))),
            Accumulation::Rollup(acc) => acc
                .take(self.cadence, self.bounds.start, end)
                .map(Snapshot::Rollup),
        }
    }

    /// Reopens the window after a flush that did not cross a boundary.
    ///
    /// With `restart_at` set, the remaining window starts there; forced
    /// interval flushes use this so the next record does not overlap.
    pub fn reopen(&mut self, restart_at: Option<DateTime<Utc>>) {
        if let Some(at) = restart_at {
            self.bounds.start = at.clamp(self.bounds.start, self.bounds.end);
        }
        self.state = WindowState::Open;
    }

    /// Moves the window to new boundaries and reopens it.
    pub fn advance(&mut self, bounds: Bounds) {
        self.bounds = bounds;
        self.state = WindowState::Open;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::Measurement;
    use chrono::{FixedOffset, NaiveDateTime};

    fn utc(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn kw(value: &str) -> Value {
        Value::Number {
            value: Decimal::from_str_exact(value).unwrap(),
            unit: Some("kW".to_string()),
        }
    }

    fn kwh(value: &str) -> Value {
        Value::Number {
            value: Decimal::from_str_exact(value).unwrap(),
            unit: Some("kWh".to_string()),
        }
    }

    fn envelope(at: &str, power: &str, energy: &str) -> Envelope {
        Envelope {
            sequence: 1,
            captured_at: utc(at),
            parse_duration_ms: 0,
            measurement: Measurement::from_fields(
                "/TEST",
                [("1-0:1.7.0", kw(power)), ("1-0:1.8.1", kwh(energy))],
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_interval_bounds_epoch_aligned() {
        let calendar = Calendar::new(Utc, Duration::from_secs(300));
        let bounds = calendar.bounds(Cadence::Interval, utc("2021-06-08 11:03:17"));

        assert_eq!(bounds.start, utc("2021-06-08 11:00:00"));
        assert_eq!(bounds.end, utc("2021-06-08 11:05:00"));
        assert!(bounds.contains(utc("2021-06-08 11:04:59")));
        assert!(!bounds.contains(bounds.end));
    }

    #[test]
    fn test_day_bounds_follow_local_midnight() {
        let cest = FixedOffset::east_opt(2 * 3600).unwrap();
        let calendar = Calendar::new(cest, Duration::from_secs(300));

        // 23:30 UTC is already the next day in +02:00.
        let bounds = calendar.bounds(Cadence::Day, utc("2021-06-08 23:30:00"));
        assert_eq!(bounds.start, utc("2021-06-08 22:00:00"));
        assert_eq!(bounds.end, utc("2021-06-09 22:00:00"));
        assert_eq!(calendar.bounds(Cadence::Detail, utc("2021-06-08 23:30:00")), bounds);
    }

    #[test]
    fn test_week_starts_monday() {
        let calendar = Calendar::new(Utc, Duration::from_secs(300));

        // 2021-06-10 is a Thursday.
        let bounds = calendar.bounds(Cadence::Week, utc("2021-06-10 15:00:00"));
        assert_eq!(bounds.start, utc("2021-06-07 00:00:00"));
        assert_eq!(bounds.end, utc("2021-06-14 00:00:00"));

        let sunday = calendar.bounds(Cadence::Week, utc("2021-06-13 23:59:59"));
        assert_eq!(sunday, bounds);
    }

    #[test]
    fn test_rollup_last_value_and_stats() {
        let calendar = Calendar::new(Utc, Duration::from_secs(300));
        let bounds = calendar.bounds(Cadence::Interval, utc("2021-06-08 11:00:00"));
        let mut window = Window::new(Cadence::Interval, bounds, &[]);
        let table = ObisTable::dsmr();

        window.add(&envelope("2021-06-08 11:00:10", "0.100", "1.000"), &table);
        window.add(&envelope("2021-06-08 11:01:10", "0.150", "1.004"), &table);
        window.add(&envelope("2021-06-08 11:02:10", "0.120", "1.010"), &table);
        assert!(window.is_dirty());

        let Some(Snapshot::Rollup(rollup)) = window.take_snapshot(bounds.end) else {
            panic!("expected a rollup");
        };
        assert_eq!(window.state(), WindowState::Flushing);
        assert!(!window.is_dirty());

        assert_eq!(rollup.samples, 3);
        assert_eq!(rollup.last["1-0:1.7.0"], kw("0.120"));
        assert_eq!(rollup.deltas["1-0:1.8.1"].value.to_string(), "0.010");

        let power = &rollup.stats["1-0:1.7.0"];
        assert_eq!(power.min.to_string(), "0.100");
        assert_eq!(power.max.to_string(), "0.150");
        assert_eq!(power.avg.to_string(), "0.123");
        assert_eq!(power.count, 3);
    }

    #[test]
    fn test_delta_continues_from_previous_window() {
        let bounds = Bounds {
            start: utc("2021-06-08 11:00:00"),
            end: utc("2021-06-08 11:05:00"),
        };
        let mut window = Window::new(Cadence::Interval, bounds, &[]);
        let table = ObisTable::dsmr();

        window.add(&envelope("2021-06-08 11:00:10", "0.1", "1.000"), &table);
        window.add(&envelope("2021-06-08 11:04:10", "0.1", "1.020"), &table);
        window.take_snapshot(bounds.end);
        window.advance(Bounds {
            start: bounds.end,
            end: utc("2021-06-08 11:10:00"),
        });

        window.add(&envelope("2021-06-08 11:05:10", "0.1", "1.050"), &table);
        let Some(Snapshot::Rollup(rollup)) = window.take_snapshot(utc("2021-06-08 11:10:00")) else {
            panic!("expected a rollup");
        };
        assert_eq!(rollup.deltas["1-0:1.8.1"].value.to_string(), "0.030");
        assert_eq!(rollup.start, bounds.end);
    }

    #[test]
    fn test_counter_reset() {
        let bounds = Bounds {
            start: utc("2021-06-08 11:00:00"),
            end: utc("2021-06-08 11:05:00"),
        };
        let mut window = Window::new(Cadence::Interval, bounds, &[]);
        let table = ObisTable::dsmr();

        window.add(&envelope("2021-06-08 11:00:10", "0.1", "500.000"), &table);
        window.add(&envelope("2021-06-08 11:01:10", "0.1", "500.200"), &table);
        // Meter replaced: counting restarts near zero.
        window.add(&envelope("2021-06-08 11:02:10", "0.1", "0.050"), &table);

        let Some(Snapshot::Rollup(rollup)) = window.take_snapshot(bounds.end) else {
            panic!("expected a rollup");
        };
        let delta = &rollup.deltas["1-0:1.8.1"];
        assert_eq!(delta.value.to_string(), "0.250");
        assert_eq!(delta.resets, 1);
    }

    #[test]
    fn test_week_summary_only_key_fields() {
        let bounds = Bounds {
            start: utc("2021-06-07 00:00:00"),
            end: utc("2021-06-14 00:00:00"),
        };
        let mut window = Window::new(Cadence::Week, bounds, &["1-0:2.7.0".to_string()]);
        window.add(&envelope("2021-06-08 11:00:10", "0.1", "1.000"), &ObisTable::dsmr());

        let Some(Snapshot::Rollup(summary)) = window.take_snapshot(bounds.end) else {
            panic!("expected a summary");
        };
        assert!(summary.last.is_empty());
        assert!(summary.stats.is_empty());
        assert!(summary.deltas.contains_key("1-0:1.8.1"));
    }

    #[test]
    fn test_empty_window_has_no_snapshot() {
        let bounds = Bounds {
            start: utc("2021-06-08 00:00:00"),
            end: utc("2021-06-09 00:00:00"),
        };
        let mut detail = Window::new(Cadence::Detail, bounds, &[]);
        let mut day = Window::new(Cadence::Day, bounds, &[]);

        assert!(detail.take_snapshot(bounds.end).is_none());
        assert!(day.take_snapshot(bounds.end).is_none());
    }

    #[test]
    fn test_reopen_after_forced_flush() {
        let bounds = Bounds {
            start: utc("2021-06-08 11:00:00"),
            end: utc("2021-06-08 11:05:00"),
        };
        let mut window = Window::new(Cadence::Interval, bounds, &[]);
        window.add(&envelope("2021-06-08 11:00:10", "0.1", "1.000"), &ObisTable::dsmr());

        let forced_at = utc("2021-06-08 11:02:00");
        let Some(Snapshot::Rollup(rollup)) = window.take_snapshot(forced_at) else {
            panic!("expected a rollup");
        };
        assert_eq!(rollup.end, forced_at);

        window.reopen(Some(forced_at));
        assert_eq!(window.state(), WindowState::Open);
        assert_eq!(window.bounds().start, forced_at);
        assert_eq!(window.bounds().end, bounds.end);
    }
}
