//! OBIS code table.
//!
//! Every data line in a telegram is tagged with an OBIS code
//! (IEC 62056-61, `A-B:C.D.E`). The table maps a code to a readable name and
//! to the [`FieldKind`] that decides how the aggregator treats its values.
//! Codes outside the table are "unknown" to the parser.
//!
//! Multi-value lines (the gas reading `0-1:24.2.1(ts)(value)`) are stored
//! per group with a letter suffix, so the table holds `0-1:24.2.1.A` and
//! `0-1:24.2.1.B`; a line is recognised when either its bare code or its
//! first suffixed code is present.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Field code of the meter clock line.
pub const CLOCK: &str = "0-0:1.0.0";

/// Field code of the synthetic timestamp entry added after the clock line.
pub const TIMESTAMP: &str = "timestamp";

/// Actual power delivered to the client.
pub const POWER_DELIVERED: &str = "1-0:1.7.0";

/// Actual power received from the client.
pub const POWER_RETURNED: &str = "1-0:2.7.0";

/// How values of a field behave over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Monotonic meter reading or event counter; rollups report deltas.
    Cumulative,
    /// Point-in-time reading; rollups report last, min, max and average.
    Instantaneous,
    /// Free text or identifier.
    Text,
    /// A DSMR `YYMMDDhhmmssX` timestamp.
    Timestamp,
}

/// A single entry of the OBIS table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObisField {
    /// The OBIS code, with `.A`/`.B` suffix for multi-value lines.
    pub code: String,
    /// Human-readable field name.
    pub name: String,
    /// Value behaviour.
    pub kind: FieldKind,
}

impl ObisField {
    /// Creates a table entry.
    pub fn new(code: impl Into<String>, name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            kind,
        }
    }
}

/// Lookup table translating OBIS codes to semantic fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObisTable {
    fields: HashMap<String, ObisField>,
}

impl ObisTable {
    /// Creates an empty table.
    pub fn empty() -> Self {
        Self {
            fields: HashMap::new(),
        }
    }

    /// The codes sent by a DSMR 5 meter such as the ISKRA AM550.
    pub fn dsmr() -> Self {
        use FieldKind::{Cumulative, Instantaneous, Text, Timestamp};

        let entries = [
            ("1-3:0.2.8", "version", Text),
            (CLOCK, "clock", Timestamp),
            (TIMESTAMP, "timestamp", Timestamp),
            ("0-0:96.1.1", "equipment id", Text),
            ("1-0:1.8.0", "elec. in, total", Cumulative),
            ("1-0:1.8.1", "elec. in, t1", Cumulative),
            ("1-0:1.8.2", "elec. in, t2", Cumulative),
            ("1-0:2.8.1", "elec. out, t1", Cumulative),
            ("1-0:2.8.2", "elec. out, t2", Cumulative),
            ("0-0:96.14.0", "tariff", Text),
            (POWER_DELIVERED, "power in", Instantaneous),
            (POWER_RETURNED, "power out", Instantaneous),
            ("0-0:96.7.21", "# power failures", Cumulative),
            ("0-0:96.7.9", "# long power failures", Cumulative),
            ("1-0:99.97.0", "failure log", Text),
            ("1-0:32.32.0", "voltage sags L1", Cumulative),
            ("1-0:52.32.0", "voltage sags L2", Cumulative),
            ("1-0:72.32.0", "voltage sags L3", Cumulative),
            ("1-0:32.36.0", "voltage swells L1", Cumulative),
            ("1-0:52.36.0", "voltage swells L2", Cumulative),
            ("1-0:72.36.0", "voltage swells L3", Cumulative),
            ("0-0:96.13.0", "text message", Text),
            ("1-0:32.7.0", "voltage L1", Instantaneous),
            ("1-0:52.7.0", "voltage L2", Instantaneous),
            ("1-0:72.7.0", "voltage L3", Instantaneous),
            ("1-0:31.7.0", "current L1", Instantaneous),
            ("1-0:51.7.0", "current L2", Instantaneous),
            ("1-0:71.7.0", "current L3", Instantaneous),
            ("1-0:21.7.0", "power in L1", Instantaneous),
            ("1-0:41.7.0", "power in L2", Instantaneous),
            ("1-0:61.7.0", "power in L3", Instantaneous),
            ("1-0:22.7.0", "power out L1", Instantaneous),
            ("1-0:42.7.0", "power out L2", Instantaneous),
            ("1-0:62.7.0", "power out L3", Instantaneous),
            ("0-1:24.1.0", "device type", Text),
            ("0-1:96.1.0", "gas equipment id", Text),
            ("0-1:24.2.1.A", "gas capture time", Timestamp),
            ("0-1:24.2.1.B", "gas delivered", Cumulative),
        ];

        let mut table = Self::empty();
        for (code, name, kind) in entries {
            table.insert(ObisField::new(code, name, kind));
        }
        table
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, field: ObisField) {
        self.fields.insert(field.code.clone(), field);
    }

    /// Returns a copy of this table extended with `extra` entries.
    pub fn extended<I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = ObisField>,
    {
        for field in extra {
            self.insert(field);
        }
        self
    }

    /// Looks up a code exactly as stored in a measurement.
    pub fn get(&self, code: &str) -> Option<&ObisField> {
        self.fields.get(code)
    }

    /// Returns the kind of a code, if known.
    pub fn kind(&self, code: &str) -> Option<FieldKind> {
        self.get(code).map(|f| f.kind)
    }

    /// Returns the readable name of a code.
    ///
    /// Group entries without their own table entry, such as the failure
    /// log's `1-0:99.97.0.C`, take the name of their line.
    pub fn name(&self, code: &str) -> Option<&str> {
        let field = self.get(code).or_else(|| {
            code.rsplit_once('.')
                .filter(|(_, suffix)| {
                    suffix.len() == 1 && suffix.bytes().all(|b| b.is_ascii_uppercase())
                })
                .and_then(|(line, _)| self.get(line))
        })?;
        Some(field.name.as_str())
    }

    /// Returns `true` if a telegram line carrying `code` is recognised.
    pub fn recognises(&self, code: &str) -> bool {
        self.fields.contains_key(code) || self.fields.contains_key(&format!("{code}.A"))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for ObisTable {
    fn default() -> Self {
        Self::dsmr()
    }
}

/// Returns `true` if `code` has the `A-B:C.D.E` shape.
pub fn is_obis_code(code: &str) -> bool {
    let Some((medium, rest)) = code.split_once(':') else {
        return false;
    };
    let Some((a, b)) = medium.split_once('-') else {
        return false;
    };
    let groups: Vec<&str> = rest.split('.').collect();
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    numeric(a) && numeric(b) && groups.len() == 3 && groups.iter().all(|g| numeric(g))
}
