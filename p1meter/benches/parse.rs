//! Microbenchmarks for the per-telegram hot path.
//!
//! A DSMR 5 meter sends one telegram per second, so these mostly guard
//! against accidental regressions rather than chase throughput.
//!
//! Run with: `cargo bench -p p1meter -- parse`

#![allow(missing_docs)]

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use p1meter::checksum::crc16;
use p1meter::publisher::Stamper;
use p1meter::window::{Bounds, Cadence, Calendar, Window};
use p1meter::{Framer, ObisTable, TelegramParser};
use std::time::Duration;

const BODY: &str = "/ISK5\\2M550T-1013\r\n\r\n\
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
0-0:96.13.0()\r\n\
1-0:32.7.0(230.8*V)\r\n\
1-0:52.7.0(231.4*V)\r\n\
1-0:72.7.0(229.9*V)\r\n\
1-0:31.7.0(001*A)\r\n\
1-0:21.7.0(00.120*kW)\r\n\
0-1:24.1.0(003)\r\n\
0-1:96.1.0(4730303339303031373030373733313137)\r\n\
0-1:24.2.1(210608130002S)(00006.135*m3)\r\n!";

fn telegram() -> Vec<u8> {
    let mut bytes = BODY.as_bytes().to_vec();
    let crc = crc16(&bytes);
    bytes.extend_from_slice(format!("{crc:04X}\r\n").as_bytes());
    bytes
}

fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16");
    for size in [64usize, 1024, 8192] {
        let data = vec![b'7'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| crc16(black_box(data)));
        });
    }
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let bytes = telegram();
    let parser = TelegramParser::new(ObisTable::dsmr(), true);

    c.bench_function("parse/am550", |b| {
        b.iter(|| parser.parse(black_box(&bytes)).unwrap());
    });

    c.bench_function("parse/frame_and_parse", |b| {
        let mut framer = Framer::default();
        let now = Utc::now();
        b.iter(|| {
            for frame in framer.push(black_box(&bytes), now) {
                black_box(parser.parse(&frame.bytes).unwrap());
            }
        });
    });
}

fn bench_envelope(c: &mut Criterion) {
    let measurement = TelegramParser::default().parse(&telegram()).unwrap();
    let mut stamper = Stamper::new(65_507);
    let now = Utc::now();

    c.bench_function("envelope/stamp_and_encode", |b| {
        b.iter(|| {
            let envelope = stamper.stamp(measurement.clone(), now, now);
            black_box(stamper.encode(&envelope).unwrap());
        });
    });
}

fn bench_window_add(c: &mut Criterion) {
    let measurement = TelegramParser::default().parse(&telegram()).unwrap();
    let mut stamper = Stamper::new(65_507);
    let now = Utc::now();
    let envelope = stamper.stamp(measurement, now, now);
    let table = ObisTable::dsmr();
    let calendar = Calendar::new(Utc, Duration::from_secs(300));
    let bounds: Bounds = calendar.bounds(Cadence::Day, now);

    c.bench_function("window/add_day", |b| {
        let mut window = Window::new(Cadence::Day, bounds, &[]);
        b.iter(|| window.add(black_box(&envelope), &table));
    });
}

criterion_group!(benches, bench_crc, bench_parse, bench_envelope, bench_window_add);
criterion_main!(benches);
