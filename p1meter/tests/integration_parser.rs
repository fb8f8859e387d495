//! Integration tests for telegram validation and decoding.
//!
//! These tests run complete telegrams through the framer and parser and
//! check that corrupted telegrams never yield fields and that decoded
//! values keep their exact digits through envelope encoding.

use chrono::Utc;
use p1meter::checksum::crc16;
use p1meter::error::TelegramError;
use p1meter::obis::{self, ObisTable};
use p1meter::publisher::Stamper;
use p1meter::{Envelope, Framer, TelegramParser, Value};

/// A full ISKRA AM550 telegram as captured from the P1 port.
const AM550: &str = "/ISK5\\2M550T-1013\r\n\r\n\
1-3:0.2.8(50)\r\n\
0-0:1.0.0(210608130046S)\r\n\
0-0:96.1.1(4530303434303037333832363136353138)\r\n\
1-0:1.8.1(000001.651*kWh)\r\n\
1-0:1.8.2(000006.232*kWh)\r\n\
1-0:2.8.1(000008.673*kWh)\r\n\
1-0:2.8.2(000000.000*kWh)\r\n\
0-0:96.14.0(0002)\r\n\
1-0:1.7.0(00.120*kW)\r\n\
1-0:2.7.0(00.000*kW)\r\n\
0-0:96.7.21(00006)\r\n\
0-0:96.7.9(00003)\r\n\
1-0:99.97.0(1)(0-0:96.7.19)(000101000001W)(2147483647*s)\r\n\
1-0:32.32.0(00002)\r\n\
1-0:52.32.0(00002)\r\n\
1-0:72.32.0(00002)\r\n\
1-0:32.36.0(00000)\r\n\
1-0:52.36.0(00000)\r\n\
1-0:72.36.0(00000)\r\n\
0-0:96.13.0()\r\n\
1-0:32.7.0(230.8*V)\r\n\
1-0:52.7.0(231.4*V)\r\n\
1-0:72.7.0(229.9*V)\r\n\
1-0:31.7.0(001*A)\r\n\
1-0:51.7.0(000*A)\r\n\
1-0:71.7.0(000*A)\r\n\
1-0:21.7.0(00.120*kW)\r\n\
1-0:41.7.0(00.000*kW)\r\n\
1-0:61.7.0(00.000*kW)\r\n\
1-0:22.7.0(00.000*kW)\r\n\
1-0:42.7.0(00.000*kW)\r\n\
1-0:62.7.0(00.000*kW)\r\n\
0-1:24.1.0(003)\r\n\
0-1:96.1.0(4730303339303031373030373733313137)\r\n\
0-1:24.2.1(210608130002S)(00006.135*m3)\r\n\
!864E\r\n";

/// Minimal telegram with a single energy register.
const SHORT: &[u8] = b"/ISK5\\2M550T-1013\r\n1-0:1.8.0(00123.456*kWh)\r\n!9A54";

fn strict() -> TelegramParser {
    TelegramParser::new(ObisTable::dsmr(), false)
}

#[test]
fn test_am550_telegram_decodes() {
    let m = strict().parse(AM550.as_bytes()).unwrap();

    assert_eq!(m.header(), "/ISK5\\2M550T-1013");
    assert_eq!(m.len(), 40);
    assert_eq!(m.number("1-0:1.8.1").unwrap().to_string(), "1.651");
    assert_eq!(m.get("1-0:1.8.1").unwrap().unit(), Some("kWh"));
    assert_eq!(m.number(obis::POWER_DELIVERED).unwrap().to_string(), "0.120");
    assert_eq!(m.number("1-0:32.7.0").unwrap().to_string(), "230.8");
    assert_eq!(
        m.timestamp().unwrap().to_rfc3339(),
        "2021-06-08T13:00:46+02:00"
    );

    // Multi-group lines become one entry per group.
    assert_eq!(
        m.get("0-1:24.2.1.A").unwrap().as_timestamp().unwrap().to_rfc3339(),
        "2021-06-08T13:00:02+02:00"
    );
    assert_eq!(m.number("0-1:24.2.1.B").unwrap().to_string(), "6.135");
    assert_eq!(m.get("0-1:24.2.1.B").unwrap().unit(), Some("m3"));
    assert_eq!(m.number("1-0:99.97.0.D").unwrap().to_string(), "2147483647");

    assert_eq!(
        m.get("0-0:96.13.0"),
        Some(&Value::Text {
            text: String::new()
        })
    );
}

#[test]
fn test_fields_keep_telegram_order() {
    let m = strict().parse(AM550.as_bytes()).unwrap();
    let codes: Vec<&str> = m.iter().map(|(code, _)| code).take(5).collect();

    assert_eq!(
        codes,
        vec!["1-3:0.2.8", obis::CLOCK, obis::TIMESTAMP, "0-0:96.1.1", "1-0:1.8.1"]
    );
}

#[test]
fn test_named_fields_carry_table_names() {
    let parser = strict();
    let m = parser.parse(AM550.as_bytes()).unwrap();
    let named = m.named(parser.table());

    assert_eq!(named.len(), m.len());
    let gas = named.iter().find(|f| f.code == "0-1:24.2.1.B").unwrap();
    assert_eq!(gas.name, Some("gas delivered"));
    assert_eq!(gas.value.unit(), Some("m3"));
    let failure = named.iter().find(|f| f.code == "1-0:99.97.0.C").unwrap();
    assert_eq!(failure.name, Some("failure log"));

    let json = serde_json::to_value(&named[3]).unwrap();
    assert_eq!(json["code"], "0-0:96.1.1");
    assert_eq!(json["name"], "equipment id");
    assert_eq!(json["value"]["type"], "text");
}

#[test]
fn test_short_telegram_and_flipped_digit() {
    let m = strict().parse(SHORT).unwrap();
    assert_eq!(m.len(), 1);
    let value = m.get("1-0:1.8.0").unwrap();
    assert_eq!(value.as_decimal().unwrap().to_string(), "123.456");
    assert_eq!(value.unit(), Some("kWh"));

    let flipped = String::from_utf8(SHORT.to_vec())
        .unwrap()
        .replace("00123.456", "00123.457");
    match strict().parse(flipped.as_bytes()) {
        Err(TelegramError::Checksum { expected, computed }) => {
            assert_eq!(expected, 0x9A54);
            assert_ne!(computed, expected);
        }
        other => panic!("expected checksum error, got {other:?}"),
    }
}

#[test]
fn test_every_single_byte_mutation_is_rejected() {
    let parser = strict();
    let original = SHORT.to_vec();

    for i in 0..original.len() {
        for replacement in [b'0', b'7', b'/', b'!', b'x'] {
            if original[i] == replacement {
                continue;
            }
            let mut mutated = original.clone();
            mutated[i] = replacement;

            match parser.parse(&mutated) {
                Err(TelegramError::Checksum { .. } | TelegramError::Framing { .. }) => {}
                other => panic!(
                    "mutation at {i} to {:?} was not rejected: {other:?}",
                    char::from(replacement)
                ),
            }
        }
    }
}

#[test]
fn test_numbers_survive_envelope_encoding() {
    let m = strict().parse(AM550.as_bytes()).unwrap();
    let mut stamper = Stamper::new(10_240);
    let now = Utc::now();

    let envelope = stamper.stamp(m.clone(), now, now);
    let bytes = stamper.encode(&envelope).unwrap();
    let back = Envelope::from_json(&bytes).unwrap();

    assert_eq!(back, envelope);
    for (code, value) in m.iter() {
        let decoded = back.measurement.get(code).unwrap();
        if let Some(number) = value.as_decimal() {
            let round_tripped = decoded.as_decimal().unwrap();
            assert_eq!(round_tripped, number);
            assert_eq!(round_tripped.scale(), number.scale(), "{code}");
        }
    }
}

#[test]
fn test_framer_feeds_parser_byte_by_byte() {
    let mut stream = b"\r\n0-0:96.7.9(00003)\r\n!A1B2\r\n".to_vec();
    stream.extend_from_slice(AM550.as_bytes());
    stream.extend_from_slice(AM550.as_bytes());

    let mut framer = Framer::default();
    let parser = strict();
    let mut decoded = 0;
    for byte in &stream {
        for frame in framer.push(std::slice::from_ref(byte), Utc::now()) {
            parser.parse(&frame.bytes).unwrap();
            decoded += 1;
        }
    }

    assert_eq!(decoded, 2);
}

#[test]
fn test_sealed_telegram_with_extra_code() {
    let mut bytes = b"/ISK5\\2M550T-1013\r\n1-0:14.7.0(50.01*Hz)\r\n!".to_vec();
    let crc = crc16(&bytes);
    bytes.extend_from_slice(format!("{crc:04X}").as_bytes());

    assert!(strict().parse(&bytes).is_err());

    let table = ObisTable::dsmr().extended([obis::ObisField::new(
        "1-0:14.7.0",
        "frequency",
        obis::FieldKind::Instantaneous,
    )]);
    let m = TelegramParser::new(table, false).parse(&bytes).unwrap();
    assert_eq!(m.number("1-0:14.7.0").unwrap().to_string(), "50.01");
}
