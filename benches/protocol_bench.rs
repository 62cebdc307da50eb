use criterion::{black_box, criterion_group, criterion_main, Criterion};
use powerudp::contracts::{self, PacketType};
use powerudp::transmitter::Transmitter;
use powerudp::ProtocolConfig;

fn benchmark_encode(c: &mut Criterion) {
    let payload = vec![0xabu8; 512];

    c.bench_function("serialize_data_512b", |b| {
        b.iter(|| Transmitter::serialize_data(black_box(42), black_box(&payload)));
    });

    c.bench_function("encode_ack", |b| {
        b.iter(|| contracts::encode(black_box(42), PacketType::Ack, 0, &[]));
    });
}

fn benchmark_decode(c: &mut Criterion) {
    let full = Transmitter::serialize_data(7, &[0x5au8; powerudp::MAX_PAYLOAD_SIZE]).unwrap();

    c.bench_function("decode_max_datagram", |b| {
        b.iter(|| contracts::decode(black_box(&full)));
    });
}

fn benchmark_config_record(c: &mut Criterion) {
    let config = ProtocolConfig::default();
    let record = config.to_record();

    c.bench_function("config_record_roundtrip", |b| {
        b.iter(|| ProtocolConfig::from_record(black_box(&config.to_record())));
    });

    c.bench_function("config_record_decode", |b| {
        b.iter(|| ProtocolConfig::from_record(black_box(&record)));
    });
}

fn benchmark_ack_backoff(c: &mut Criterion) {
    use powerudp::ack_manager::AckManager;

    c.bench_function("calculate_exponential_backoff", |b| {
        b.iter(|| {
            for attempt in 0..10 {
                AckManager::calculate_backoff_ms(attempt, black_box(200), black_box(powerudp::MAX_BACKOFF_MS));
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_encode,
    benchmark_decode,
    benchmark_config_record,
    benchmark_ack_backoff
);
criterion_main!(benches);
