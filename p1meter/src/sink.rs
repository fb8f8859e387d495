//! Destinations for flushed windows.
//!
//! The aggregator talks to sinks through the two-call [`Sink`] contract:
//! `append` writes a snapshot into the current file, `rotate` closes it and
//! switches to the file for the next window.
//!
//! [`FileSink`] writes JSON lines. Its path is a chrono `strftime` template
//! formatted with the window start in local time, so a template such as
//! `/var/lib/p1/day-%Y%m%d.jsonl` produces one file per day. Detail
//! snapshots produce one line per envelope; rollups one line each.

use std::fmt::{Display, Write as _};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone, Utc};

use crate::error::SinkError;
use crate::window::Snapshot;

/// Receives window snapshots.
pub trait Sink: Send {
    /// Writes a snapshot to the current destination.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the destination cannot be opened or written.
    /// The snapshot is lost in that case.
    fn append(&mut self, snapshot: &Snapshot) -> Result<(), SinkError>;

    /// Closes the current destination and prepares the one for the window
    /// starting at `next_start`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Rotate`] if the previous file cannot be moved
    /// aside.
    fn rotate(&mut self, next_start: DateTime<Utc>) -> Result<(), SinkError>;
}

/// Appends snapshots as JSON lines to templated files.
pub struct FileSink<Tz: TimeZone = Local> {
    template: String,
    tz: Tz,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    move_aside: bool,
    written: bool,
}

impl<Tz> FileSink<Tz>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    /// Creates a sink for the window starting at `start`.
    ///
    /// With `move_aside` set, a rotation that would reuse the same path
    /// first renames the written file to `<path>.prev`. Nothing is opened
    /// until the first append.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Open`] if the template cannot be formatted.
    pub fn new(
        template: impl Into<String>,
        tz: Tz,
        start: DateTime<Utc>,
        move_aside: bool,
    ) -> Result<Self, SinkError> {
        let template = template.into();
        let path = format_path(&template, &tz, start)?;
        Ok(Self {
            template,
            tz,
            path,
            writer: None,
            move_aside,
            written: false,
        })
    }

    /// The file currently written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, SinkError> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).map_err(|e| SinkError::Open {
                    path: self.path.clone(),
                    source: e,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| SinkError::Open {
                    path: self.path.clone(),
                    source: e,
                })?;
            tracing::debug!(path = %self.path.display(), "opened sink file");
            self.writer = Some(BufWriter::new(file));
        }

        self.writer.as_mut().ok_or_else(|| SinkError::Open {
            path: self.path.clone(),
            source: io::Error::other("sink writer unavailable"),
        })
    }

    fn write_lines(&mut self, snapshot: &Snapshot) -> Result<(), SinkError> {
        let mut buffer = Vec::new();
        match snapshot {
            Snapshot::Records(records) => {
                for record in records {
                    serde_json::to_writer(&mut buffer, record)?;
                    buffer.push(b'\n');
                }
            }
            Snapshot::Rollup(rollup) => {
                serde_json::to_writer(&mut buffer, rollup)?;
                buffer.push(b'\n');
            }
        }

        let path = self.path.clone();
        let writer = self.writer()?;
        writer
            .write_all(&buffer)
            .and_then(|()| writer.flush())
            .map_err(|e| SinkError::Write { path, source: e })
    }
}

impl<Tz> Sink for FileSink<Tz>
where
    Tz: TimeZone + Send,
    Tz::Offset: Display,
{
    fn append(&mut self, snapshot: &Snapshot) -> Result<(), SinkError> {
        let result = self.write_lines(snapshot);
        if result.is_err() {
            // Reopen on the next append rather than reuse a broken handle.
            self.writer = None;
        } else {
            self.written = true;
        }
        result
    }

    fn rotate(&mut self, next_start: DateTime<Utc>) -> Result<(), SinkError> {
        self.writer = None;
        let next = format_path(&self.template, &self.tz, next_start)?;

        if self.move_aside && self.written && next == self.path {
            let mut aside = self.path.clone().into_os_string();
            aside.push(".prev");
            fs::rename(&self.path, &aside).map_err(|e| SinkError::Rotate {
                path: self.path.clone(),
                source: e,
            })?;
        }

        if next != self.path {
            tracing::info!(from = %self.path.display(), to = %next.display(), "rotated sink");
        }
        self.path = next;
        self.written = false;
        Ok(())
    }
}

fn format_path<Tz>(template: &str, tz: &Tz, start: DateTime<Utc>) -> Result<PathBuf, SinkError>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut path = String::new();
    write!(path, "{}", start.with_timezone(tz).format(template)).map_err(|_| SinkError::Open {
        path: PathBuf::from(template),
        source: io::Error::new(io::ErrorKind::InvalidInput, "invalid strftime template"),
    })?;
    Ok(PathBuf::from(path))
}
