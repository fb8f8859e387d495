//! Telegram decoding.
//!
//! A DSMR telegram is a block of CRLF-terminated lines:
//!
//! ```text
//! /ISK5\2M550T-1013                 <- identification header
//!
//! 1-3:0.2.8(50)                     <- OBIS-code(value)
//! 0-0:1.0.0(210608130046S)          <- meter clock, YYMMDDhhmmss + S|W
//! 1-0:1.8.1(000001.651*kWh)         <- OBIS-code(number*unit)
//! 0-1:24.2.1(210608130002S)(00006.135*m3)
//! !0281                             <- end marker + CRC-16
//! ```
//!
//! [`TelegramParser::parse`] validates framing first, then the checksum, and
//! only then decodes lines, so a corrupted telegram never yields fields.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use rust_decimal::Decimal;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::checksum::{crc16, parse_hex};
use crate::error::TelegramError;
use crate::obis::{self, FieldKind, ObisTable};

/// Start-of-telegram marker.
pub const START_MARKER: u8 = b'/';

/// End-of-data marker, followed by four checksum digits.
pub const END_MARKER: u8 = b'!';

/// Number of hex digits after the end marker.
pub const CHECKSUM_DIGITS: usize = 4;

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Value {
    /// Fixed-point number exactly as transmitted, with its unit if any.
    Number {
        /// The value; the scale of the source digits is kept.
        #[serde(with = "decimal_str")]
        value: Decimal,
        /// Unit suffix such as `kWh`, `kW`, `V`, `A` or `m3`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    /// Text or identifier.
    Text {
        /// The raw text.
        text: String,
    },
    /// Meter timestamp.
    Timestamp {
        /// The transmitted `YYMMDDhhmmssX` string.
        raw: String,
        /// The decoded instant, with DST offset.
        at: DateTime<FixedOffset>,
    },
}

impl Value {
    /// Returns the numeric value, if this is a number.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Number { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Returns the unit of a number.
    pub fn unit(&self) -> Option<&str> {
        match self {
            Self::Number { unit, .. } => unit.as_deref(),
            _ => None,
        }
    }

    /// Returns the instant of a timestamp.
    pub fn as_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Self::Timestamp { at, .. } => Some(*at),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number {
                value,
                unit: Some(unit),
            } => write!(f, "{value}*{unit}"),
            Self::Number { value, unit: None } => write!(f, "{value}"),
            Self::Text { text } => f.write_str(text),
            Self::Timestamp { raw, .. } => f.write_str(raw),
        }
    }
}

/// A validated telegram: header plus fields in telegram order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    header: String,
    fields: Fields,
}

impl Measurement {
    /// Builds a measurement from already decoded fields.
    ///
    /// # Errors
    ///
    /// Returns [`TelegramError::FieldDecode`] when a code appears twice.
    pub fn from_fields<I, K>(header: impl Into<String>, fields: I) -> Result<Self, TelegramError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut measurement = Self {
            header: header.into(),
            fields: Fields::default(),
        };
        for (code, value) in fields {
            let code = code.into();
            if measurement.get(&code).is_some() {
                return Err(TelegramError::FieldDecode {
                    reason: "duplicate field".to_string(),
                    line: code,
                });
            }
            measurement.fields.0.push((code, value));
        }
        Ok(measurement)
    }

    /// The identification line, including the leading `/`.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Looks up a field by code.
    pub fn get(&self, code: &str) -> Option<&Value> {
        self.fields.0.iter().find(|(c, _)| c == code).map(|(_, v)| v)
    }

    /// Returns the numeric value of a field.
    pub fn number(&self, code: &str) -> Option<Decimal> {
        self.get(code).and_then(Value::as_decimal)
    }

    /// Returns the meter clock reading.
    pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.get(obis::TIMESTAMP).and_then(Value::as_timestamp)
    }

    /// Iterates over `(code, value)` in telegram order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.0.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.0.len()
    }

    /// Returns `true` if no field was decoded.
    pub fn is_empty(&self) -> bool {
        self.fields.0.is_empty()
    }

    /// Pairs every field with its name from `table`, in telegram order.
    pub fn named<'a>(&'a self, table: &'a ObisTable) -> Vec<NamedField<'a>> {
        self.iter()
            .map(|(code, value)| NamedField {
                code,
                name: table.name(code),
                value,
            })
            .collect()
    }
}

/// A decoded field with its readable name, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedField<'a> {
    /// OBIS code, with group suffix where the line had several values.
    pub code: &'a str,
    /// Name from the OBIS table; absent for codes the table does not know.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    /// The decoded value.
    pub value: &'a Value,
}

/// Decodes raw telegram bytes into a [`Measurement`].
#[derive(Debug, Clone)]
pub struct TelegramParser {
    table: ObisTable,
    ignore_unknown: bool,
}

impl TelegramParser {
    /// Creates a parser using `table` to recognise codes.
    ///
    /// With `ignore_unknown` set, unknown codes and malformed lines are
    /// skipped instead of failing the telegram.
    pub fn new(table: ObisTable, ignore_unknown: bool) -> Self {
        Self {
            table,
            ignore_unknown,
        }
    }

    /// The code table in use.
    pub fn table(&self) -> &ObisTable {
        &self.table
    }

    /// Parses a buffer holding one telegram.
    ///
    /// Bytes before the `/` marker are ignored.
    ///
    /// # Errors
    ///
    /// - [`TelegramError::Framing`] when a marker or the checksum digits are missing
    /// - [`TelegramError::Checksum`] when the CRC does not match
    /// - [`TelegramError::FieldDecode`] for an unknown or malformed line,
    ///   unless the parser ignores those
    pub fn parse(&self, bytes: &[u8]) -> Result<Measurement, TelegramError> {
        let (frame, expected) = locate_frame(bytes)?;

        let computed = crc16(frame);
        if computed != expected {
            return Err(TelegramError::Checksum { expected, computed });
        }

        // Checksum covers the '!' marker, the text does not.
        let text = std::str::from_utf8(&frame[..frame.len() - 1]).map_err(|e| {
            TelegramError::Framing {
                reason: format!("telegram is not valid UTF-8: {e}"),
            }
        })?;

        let mut lines = text.lines();
        let header = lines.next().unwrap_or_default().trim_end().to_string();
        let mut measurement = Measurement {
            header,
            fields: Fields::default(),
        };

        for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
            match self.decode_line(line, &measurement) {
                Ok(entries) => measurement.fields.0.extend(entries),
                Err(reason) if self.ignore_unknown => {
                    tracing::debug!(line, %reason, "skipping telegram line");
                }
                Err(reason) => {
                    return Err(TelegramError::FieldDecode {
                        line: line.to_string(),
                        reason: reason.to_string(),
                    });
                }
            }
        }

        Ok(measurement)
    }

    /// Decodes one data line into one entry per value group.
    fn decode_line(
        &self,
        line: &str,
        seen: &Measurement,
    ) -> Result<Vec<(String, Value)>, LineError> {
        let (code, groups) = split_line(line)?;
        if !self.table.recognises(code) {
            return Err(LineError::UnknownCode(code.to_string()));
        }

        let keys: Vec<String> = if groups.len() == 1 {
            vec![code.to_string()]
        } else {
            (b'A'..=b'Z')
                .take(groups.len())
                .map(|suffix| format!("{code}.{}", char::from(suffix)))
                .collect()
        };
        if keys.len() != groups.len() {
            return Err(LineError::Malformed("too many value groups"));
        }

        let mut entries = Vec::with_capacity(groups.len() + 1);
        for (key, raw) in keys.into_iter().zip(groups) {
            if seen.get(&key).is_some() {
                return Err(LineError::Malformed("duplicate field"));
            }
            let value = decode_value(raw, self.table.kind(&key))?;
            if key == obis::CLOCK && matches!(value, Value::Timestamp { .. }) {
                entries.push((key, value.clone()));
                entries.push((obis::TIMESTAMP.to_string(), value));
            } else {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }
}

impl Default for TelegramParser {
    fn default() -> Self {
        Self::new(ObisTable::dsmr(), false)
    }
}

/// Why a single line was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LineError {
    UnknownCode(String),
    Malformed(&'static str),
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCode(code) => write!(f, "unknown OBIS code {code}"),
            Self::Malformed(reason) => f.write_str(reason),
        }
    }
}

/// Finds `/ ... !XXXX` and returns the checksummed slice and the sent CRC.
fn locate_frame(bytes: &[u8]) -> Result<(&[u8], u16), TelegramError> {
    let start = bytes
        .iter()
        .position(|&b| b == START_MARKER)
        .ok_or_else(|| TelegramError::Framing {
            reason: "missing start marker '/'".to_string(),
        })?;
    let end = bytes[start..]
        .iter()
        .position(|&b| b == END_MARKER)
        .map(|i| start + i)
        .ok_or_else(|| TelegramError::Framing {
            reason: "missing end marker '!'".to_string(),
        })?;

    let digits = bytes
        .get(end + 1..end + 1 + CHECKSUM_DIGITS)
        .unwrap_or_default();
    let expected = parse_hex(digits).ok_or_else(|| TelegramError::Framing {
        reason: format!(
            "expected {CHECKSUM_DIGITS} hex digits after '!', found {:?}",
            String::from_utf8_lossy(digits)
        ),
    })?;

    Ok((&bytes[start..=end], expected))
}

/// Splits `code(v1)(v2)` into the code and the raw group contents.
fn split_line(line: &str) -> Result<(&str, Vec<&str>), LineError> {
    let open = line
        .find('(')
        .ok_or(LineError::Malformed("missing '(' after OBIS code"))?;
    let code = &line[..open];
    if !obis::is_obis_code(code) {
        return Err(LineError::Malformed("not an OBIS code"));
    }

    let mut groups = Vec::new();
    let mut rest = &line[open..];
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('(')
            .ok_or(LineError::Malformed("unexpected characters between value groups"))?;
        let close = inner
            .find(')')
            .ok_or(LineError::Malformed("unbalanced parentheses"))?;
        let value = &inner[..close];
        if value.contains('(') {
            return Err(LineError::Malformed("unbalanced parentheses"));
        }
        groups.push(value);
        rest = &inner[close + 1..];
    }
    Ok((code, groups))
}

/// Decodes a group body according to the field kind, if known.
fn decode_value(raw: &str, kind: Option<FieldKind>) -> Result<Value, LineError> {
    if let Some((number, unit)) = raw.split_once('*') {
        if unit.is_empty() {
            return Err(LineError::Malformed("empty unit"));
        }
        return Ok(Value::Number {
            value: parse_decimal(number)?,
            unit: Some(unit.to_string()),
        });
    }

    match kind {
        Some(FieldKind::Timestamp) => parse_timestamp(raw)
            .ok_or(LineError::Malformed("invalid timestamp"))
            .map(|at| Value::Timestamp {
                raw: raw.to_string(),
                at,
            }),
        Some(FieldKind::Cumulative | FieldKind::Instantaneous) => Ok(Value::Number {
            value: parse_decimal(raw)?,
            unit: None,
        }),
        Some(FieldKind::Text) => Ok(Value::Text {
            text: raw.to_string(),
        }),
        None => Ok(match parse_timestamp(raw) {
            Some(at) => Value::Timestamp {
                raw: raw.to_string(),
                at,
            },
            None => Value::Text {
                text: raw.to_string(),
            },
        }),
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal, LineError> {
    Decimal::from_str_exact(raw).map_err(|_| LineError::Malformed("invalid number"))
}

/// Parses `YYMMDDhhmmssX`, where `X` is `S` (summer, UTC+2) or `W` (winter, UTC+1).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    if raw.len() != 13 || !raw.is_ascii() {
        return None;
    }
    let (digits, season) = raw.split_at(12);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let offset_secs = match season {
        "S" => 2 * 3600,
        "W" => 3600,
        _ => return None,
    };

    let naive = NaiveDateTime::parse_from_str(digits, "%y%m%d%H%M%S").ok()?;
    let offset = FixedOffset::east_opt(offset_secs)?;
    naive.and_local_timezone(offset).single()
}

/// Ordered field list, encoded as a JSON object in telegram order.
#[derive(Debug, Clone, Default, PartialEq)]
struct Fields(Vec<(String, Value)>);

impl Serialize for Fields {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (code, value) in &self.0 {
            map.serialize_entry(code, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Fields {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = Fields;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of OBIS codes to values")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut fields: Vec<(String, Value)> =
                    Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((code, value)) = access.next_entry::<String, Value>()? {
                    if fields.iter().any(|(c, _)| *c == code) {
                        return Err(serde::de::Error::custom(format!("duplicate field {code}")));
                    }
                    fields.push((code, value));
                }
                Ok(Fields(fields))
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

/// Serde helpers encoding [`Decimal`] as a string so no digits are lost.
pub(crate) mod decimal_str {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Decimal::from_str_exact(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &str) -> Vec<u8> {
        let mut bytes = body.as_bytes().to_vec();
        bytes.push(END_MARKER);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(format!("{crc:04X}\r\n").as_bytes());
        bytes
    }

    #[test]
    fn test_split_line() {
        let (code, groups) = split_line("0-1:24.2.1(210608130002S)(00006.135*m3)").unwrap();
        assert_eq!(code, "0-1:24.2.1");
        assert_eq!(groups, vec!["210608130002S", "00006.135*m3"]);

        let (_, groups) = split_line("0-0:96.13.0()").unwrap();
        assert_eq!(groups, vec![""]);

        assert!(split_line("1-0:1.8.1(12").is_err());
        assert!(split_line("1-0:1.8.1(12)x").is_err());
        assert!(split_line("garbage").is_err());
    }

    #[test]
    fn test_decode_value_keeps_scale() {
        let value = decode_value("00123.450*kWh", Some(FieldKind::Cumulative)).unwrap();
        assert_eq!(value.as_decimal().unwrap().to_string(), "123.450");
        assert_eq!(value.unit(), Some("kWh"));

        let counter = decode_value("00006", Some(FieldKind::Cumulative)).unwrap();
        assert_eq!(counter.as_decimal(), Some(Decimal::from(6)));

        let tariff = decode_value("0002", Some(FieldKind::Text)).unwrap();
        assert_eq!(tariff, Value::Text { text: "0002".to_string() });
    }

    #[test]
    fn test_parse_timestamp_offsets() {
        let summer = parse_timestamp("210608130046S").unwrap();
        assert_eq!(summer.to_rfc3339(), "2021-06-08T13:00:46+02:00");

        let winter = parse_timestamp("211224080000W").unwrap();
        assert_eq!(winter.to_rfc3339(), "2021-12-24T08:00:00+01:00");

        assert!(parse_timestamp("210608130046X").is_none());
        assert!(parse_timestamp("2106081300S").is_none());
        assert!(parse_timestamp("211308130046S").is_none());
    }

    #[test]
    fn test_clock_line_adds_timestamp_field() {
        let parser = TelegramParser::default();
        let bytes = frame("/ISK5\\2M550T-1013\r\n\r\n0-0:1.0.0(210608130046S)\r\n1-0:1.8.1(000001.651*kWh)\r\n");
        let m = parser.parse(&bytes).unwrap();

        let codes: Vec<&str> = m.iter().map(|(c, _)| c).collect();
        assert_eq!(codes, vec![obis::CLOCK, obis::TIMESTAMP, "1-0:1.8.1"]);
        assert_eq!(m.timestamp(), parse_timestamp("210608130046S"));
    }

    #[test]
    fn test_unknown_code_policy() {
        let bytes = frame("/ISK5\\2M550T-1013\r\n1-0:1.8.1(000001.651*kWh)\r\n1-0:14.7.0(50.01*Hz)\r\n");

        let strict = TelegramParser::new(ObisTable::dsmr(), false);
        match strict.parse(&bytes) {
            Err(TelegramError::FieldDecode { line, reason }) => {
                assert_eq!(line, "1-0:14.7.0(50.01*Hz)");
                assert!(reason.contains("unknown"));
            }
            other => panic!("expected field decode error, got {other:?}"),
        }

        let lenient = TelegramParser::new(ObisTable::dsmr(), true);
        let m = lenient.parse(&bytes).unwrap();
        assert_eq!(m.len(), 1);
        assert!(m.get("1-0:14.7.0").is_none());
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let bytes = frame("/X\r\n1-0:1.8.1(1.000*kWh)\r\n1-0:1.8.1(2.000*kWh)\r\n");
        let err = TelegramParser::default().parse(&bytes).unwrap_err();
        assert!(matches!(err, TelegramError::FieldDecode { .. }));
    }

    #[test]
    fn test_framing_errors() {
        let parser = TelegramParser::default();

        assert!(matches!(
            parser.parse(b"1-0:1.8.1(1.000*kWh)\r\n!1234"),
            Err(TelegramError::Framing { .. })
        ));
        assert!(matches!(
            parser.parse(b"/X\r\n1-0:1.8.1(1.000*kWh)\r\n"),
            Err(TelegramError::Framing { .. })
        ));
        assert!(matches!(
            parser.parse(b"/X\r\n1-0:1.8.1(1.000*kWh)\r\n!12"),
            Err(TelegramError::Framing { .. })
        ));
    }

    #[test]
    fn test_measurement_json_keeps_order() {
        let m = Measurement::from_fields(
            "/X",
            [
                (
                    "1-0:2.8.1",
                    Value::Number {
                        value: Decimal::new(8673, 3),
                        unit: Some("kWh".to_string()),
                    },
                ),
                (
                    "1-0:1.8.1",
                    Value::Number {
                        value: Decimal::new(1651, 3),
                        unit: Some("kWh".to_string()),
                    },
                ),
            ],
        )
        .unwrap();

        let json = serde_json::to_string(&m).unwrap();
        assert!(json.find("1-0:2.8.1").unwrap() < json.find("1-0:1.8.1").unwrap());

        let back: Measurement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        let codes: Vec<&str> = back.iter().map(|(c, _)| c).collect();
        assert_eq!(codes, vec!["1-0:2.8.1", "1-0:1.8.1"]);
    }
}
