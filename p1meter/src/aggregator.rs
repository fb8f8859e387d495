//! Multi-cadence aggregation and rotation.
//!
//! The [`Aggregator`] is the single owner of all window state. Everything
//! that can change a window arrives as an [`Event`] on one queue: envelopes
//! from the subscriber, ticks from a timer task, forced flushes and the
//! shutdown request. No locks are involved.
//!
//! # Rotation
//!
//! Windows move forward on the aggregator's own wall clock only: the time
//! carried by [`Event::Tick`] and the instant of a forced flush or shutdown.
//! Capture times of envelopes never move a boundary, so a publisher with a
//! wrong clock cannot drag the windows into the past or the future. Every
//! envelope lands in the windows that are open when it arrives. Each
//! cadence rotates independently:
//!
//! ```text
//!            11:00        11:05        11:10
//! interval   |---- w1 ----|---- w2 ----|---- ...
//! day        |------------------- 2021-06-08 ----...
//! ```
//!
//! A flush takes a snapshot and resets the window before the sink is
//! called, so a failing sink loses that snapshot (logged as data loss) but
//! never stalls aggregation.

use std::fmt::Display;
use std::ops::ControlFlow;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AggregatorConfig, SinkConfig};
use crate::envelope::Envelope;
use crate::error::SinkError;
use crate::live::LiveBuffer;
use crate::obis::ObisTable;
use crate::sink::{FileSink, Sink};
use crate::window::{Bounds, Cadence, Calendar, Window};

/// Input of the aggregator's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A received envelope.
    Envelope(Envelope),
    /// Timer tick carrying the current wall-clock time.
    Tick(DateTime<Utc>),
    /// Flush a cadence now, without waiting for its boundary.
    ForceFlush(Cadence),
    /// Flush everything and stop.
    Shutdown,
}

/// One sink per cadence.
pub struct SinkSet {
    detail: Box<dyn Sink>,
    interval: Box<dyn Sink>,
    day: Box<dyn Sink>,
    week: Box<dyn Sink>,
}

impl SinkSet {
    /// Groups already constructed sinks.
    pub fn new(
        detail: Box<dyn Sink>,
        interval: Box<dyn Sink>,
        day: Box<dyn Sink>,
        week: Box<dyn Sink>,
    ) -> Self {
        Self {
            detail,
            interval,
            day,
            week,
        }
    }

    /// Creates JSON-lines file sinks for the windows containing `now`.
    ///
    /// The interval sink moves its previous file aside on rotation; the
    /// others keep appending.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Open`] if a template cannot be formatted.
    pub fn from_config<Tz>(
        config: &SinkConfig,
        calendar: &Calendar<Tz>,
        now: DateTime<Utc>,
    ) -> Result<Self, SinkError>
    where
        Tz: TimeZone + Send + 'static,
        Tz::Offset: Display,
    {
        let file = |template: &str, cadence: Cadence| -> Result<Box<dyn Sink>, SinkError> {
            let start = calendar.bounds(cadence, now).start;
            let move_aside = cadence == Cadence::Interval;
            Ok(Box::new(FileSink::new(
                template,
                calendar.tz().clone(),
                start,
                move_aside,
            )?))
        };

        Ok(Self {
            detail: file(&config.detail, Cadence::Detail)?,
            interval: file(&config.interval, Cadence::Interval)?,
            day: file(&config.day, Cadence::Day)?,
            week: file(&config.week, Cadence::Week)?,
        })
    }

    fn get_mut(&mut self, cadence: Cadence) -> &mut dyn Sink {
        match cadence {
            Cadence::Detail => self.detail.as_mut(),
            Cadence::Interval => self.interval.as_mut(),
            Cadence::Day => self.day.as_mut(),
            Cadence::Week => self.week.as_mut(),
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// The flushed cadence.
    pub cadence: Cadence,
    /// Start of the flushed range.
    pub start: DateTime<Utc>,
    /// End of the flushed range.
    pub end: DateTime<Utc>,
    /// Envelopes covered; zero for an empty window.
    pub samples: u64,
    /// Whether the sink accepted the snapshot.
    pub written: bool,
    /// Whether the window moved to a new period.
    pub rotated: bool,
}

/// Counters over the aggregator's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Envelopes ingested.
    pub envelopes: u64,
    /// Snapshots accepted by sinks.
    pub snapshots_written: u64,
    /// Snapshots dropped because a sink failed.
    pub snapshots_lost: u64,
    /// Envelopes captured too far ahead of the local clock.
    pub clock_skewed: u64,
}

/// What happens to a window after its snapshot is taken.
#[derive(Debug, Clone, Copy)]
enum After {
    Rotate(Bounds),
    Reopen(Option<DateTime<Utc>>),
}

/// Owns the windows of every cadence and drives their sinks.
pub struct Aggregator<Tz: TimeZone = Local> {
    calendar: Calendar<Tz>,
    table: ObisTable,
    windows: [Window; 4],
    sinks: SinkSet,
    live: LiveBuffer,
    detail_flush: TimeDelta,
    max_clock_skew: TimeDelta,
    last_detail_flush: DateTime<Utc>,
    clock: DateTime<Utc>,
    stats: AggregatorStats,
    closed: bool,
}

impl<Tz: TimeZone> Aggregator<Tz> {
    /// Creates an aggregator whose windows contain `now`.
    ///
    /// `table` decides which fields are counters and which are sampled.
    pub fn new(
        config: &AggregatorConfig,
        table: ObisTable,
        calendar: Calendar<Tz>,
        sinks: SinkSet,
        now: DateTime<Utc>,
    ) -> Self {
        let windows = Cadence::ALL
            .map(|cadence| Window::new(cadence, calendar.bounds(cadence, now), &config.key_fields));

        Self {
            calendar,
            table,
            windows,
            sinks,
            live: LiveBuffer::new(config.live_window),
            detail_flush: TimeDelta::from_std(config.detail_flush).unwrap_or(TimeDelta::MAX),
            max_clock_skew: TimeDelta::from_std(config.max_clock_skew).unwrap_or(TimeDelta::MAX),
            last_detail_flush: now,
            clock: now,
            stats: AggregatorStats::default(),
            closed: false,
        }
    }

    /// Applies one event.
    ///
    /// Returns [`ControlFlow::Break`] once the aggregator has shut down.
    pub fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Envelope(envelope) => {
                self.ingest(&envelope);
            }
            Event::Tick(now) => {
                self.tick(now);
            }
            Event::ForceFlush(cadence) => {
                self.force_flush(cadence, Utc::now());
            }
            Event::Shutdown => {
                self.shutdown(Utc::now());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Adds an envelope to every open window.
    ///
    /// The capture time is only checked against the local clock; it never
    /// rotates a window.
    pub fn ingest(&mut self, envelope: &Envelope) {
        if self.closed {
            tracing::warn!(sequence = envelope.sequence, "envelope after shutdown dropped");
            return;
        }

        let captured_at = envelope.captured_at;
        if captured_at - self.clock > self.max_clock_skew {
            self.stats.clock_skewed += 1;
            tracing::warn!(
                sequence = envelope.sequence,
                %captured_at,
                clock = %self.clock,
                "envelope captured ahead of local clock, publisher clock may be wrong"
            );
        } else if captured_at < self.window(Cadence::Interval).bounds().start {
            tracing::debug!(
                sequence = envelope.sequence,
                %captured_at,
                "late envelope added to current windows"
            );
        }

        self.live.record(envelope);
        for window in &mut self.windows {
            window.add(envelope, &self.table);
        }
        self.stats.envelopes += 1;
    }

    /// Rotates every window whose boundary lies at or before `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<FlushReport> {
        if self.closed {
            return Vec::new();
        }
        self.advance(now)
    }

    /// Flushes `cadence` immediately.
    ///
    /// The record covers the window start up to `now`; the window then
    /// continues from `now` to its regular end.
    pub fn force_flush(&mut self, cadence: Cadence, now: DateTime<Utc>) -> Vec<FlushReport> {
        if self.closed {
            return Vec::new();
        }
        let mut reports = self.advance(now);
        let now = self.clock;
        reports.push(self.flush(cadence, now, After::Reopen(Some(now))));
        reports
    }

    /// Flushes every dirty window and stops accepting events.
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> Vec<FlushReport> {
        if self.closed {
            return Vec::new();
        }
        let mut reports = self.advance(now);
        let now = self.clock;
        for cadence in Cadence::ALL {
            if self.window(cadence).is_dirty() {
                reports.push(self.flush(cadence, now, After::Reopen(None)));
            }
        }
        self.closed = true;
        tracing::info!(
            envelopes = self.stats.envelopes,
            written = self.stats.snapshots_written,
            lost = self.stats.snapshots_lost,
            "aggregator stopped"
        );
        reports
    }

    /// Runs the event loop until shutdown or until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) -> AggregatorStats {
        while let Some(event) = events.recv().await {
            if self.handle(event).is_break() {
                return self.stats;
            }
        }

        tracing::info!("event queue closed, flushing");
        self.shutdown(Utc::now());
        self.stats
    }

    /// The current window of `cadence`.
    pub fn window(&self, cadence: Cadence) -> &Window {
        &self.windows[cadence.index()]
    }

    /// The live power view.
    pub fn live(&self) -> &LiveBuffer {
        &self.live
    }

    /// Lifetime counters.
    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Returns `true` after shutdown.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn advance(&mut self, at: DateTime<Utc>) -> Vec<FlushReport> {
        self.clock = self.clock.max(at);
        let now = self.clock;
        let mut reports = Vec::new();

        for cadence in Cadence::ALL {
            let bounds = self.window(cadence).bounds();
            if now >= bounds.end {
                let next = self.calendar.bounds(cadence, now);
                reports.push(self.flush(cadence, bounds.end, After::Rotate(next)));
            }
        }

        if now - self.last_detail_flush >= self.detail_flush {
            if self.window(Cadence::Detail).is_dirty() {
                reports.push(self.flush(Cadence::Detail, now, After::Reopen(None)));
            }
            self.last_detail_flush = now;
        }

        reports
    }

    fn flush(&mut self, cadence: Cadence, until: DateTime<Utc>, after: After) -> FlushReport {
        let window = &mut self.windows[cadence.index()];
        let bounds = window.bounds();
        let snapshot = window.take_snapshot(until);
        let sink = self.sinks.get_mut(cadence);

        let mut report = FlushReport {
            cadence,
            start: bounds.start,
            end: until.clamp(bounds.start, bounds.end),
            samples: 0,
            written: false,
            rotated: false,
        };

        if let Some(snapshot) = snapshot {
            report.samples = snapshot.samples();
            match sink.append(&snapshot) {
                Ok(()) => {
                    report.written = true;
                    self.stats.snapshots_written += 1;
                    tracing::info!(
                        %cadence,
                        start = %report.start,
                        end = %report.end,
                        samples = report.samples,
                        "flushed window"
                    );
                }
                Err(e) => {
                    self.stats.snapshots_lost += 1;
                    tracing::error!(
                        %cadence,
                        start = %report.start,
                        end = %report.end,
                        samples = report.samples,
                        error = %e,
                        "data loss: snapshot not written"
                    );
                }
            }
        }

        match after {
            After::Rotate(next) => {
                if let Err(e) = sink.rotate(next.start) {
                    tracing::error!(%cadence, error = %e, "sink rotation failed");
                }
                window.advance(next);
                report.rotated = true;
            }
            After::Reopen(restart_at) => window.reopen(restart_at),
        }

        if cadence == Cadence::Interval && report.rotated {
            let (power_in, power_out) = self.live.average();
            tracing::debug!(
                samples = self.live.len(),
                power_in = ?power_in,
                power_out = ?power_out,
                "live view"
            );
        }

        report
    }
}

/// Builds the production aggregator for a configuration.
///
/// # Errors
///
/// Returns [`SinkError::Open`] if a sink template cannot be formatted.
pub fn from_config(
    config: &crate::config::Config,
    now: DateTime<Utc>,
) -> Result<Aggregator<Local>, SinkError> {
    let calendar = Calendar::new(Local, config.aggregator.interval);
    let sinks = SinkSet::from_config(&config.sinks, &calendar, now)?;
    let table = config.telegram_parser().table().clone();
    Ok(Aggregator::new(&config.aggregator, table, calendar, sinks, now))
}

/// Spawns a task that sends a [`Event::Tick`] every `period`.
///
/// The task ends when the receiving side is dropped.
pub fn spawn_ticker(events: mpsc::Sender<Event>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if events.send(Event::Tick(Utc::now())).await.is_err() {
                break;
            }
        }
    })
}
