use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use seqvault::stream::{Decryptor, Encryptor, StreamOptions};

const KEY: [u8; 32] = [7; 32];
const HASH_KEY: [u8; 32] = [9; 32];
const NONCE: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 1];

fn stream_benchmark(c: &mut Criterion) {
    let data = vec![0x5Au8; 8 * 1024 * 1024];
    let mut group = c.benchmark_group("stream");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for (label, integrity) in [("integrity", true), ("plain", false)] {
        let options = StreamOptions::default().with_integrity(integrity);

        for threads in [1usize, 4] {
            let encryptor = Encryptor::new(threads);
            group.bench_function(BenchmarkId::new(format!("encrypt_{}", label), threads), |b| {
                b.iter(|| {
                    encryptor
                        .encrypt(black_box(&data), &KEY, Some(&HASH_KEY), NONCE, &options)
                        .unwrap()
                })
            });

            let encrypted = encryptor
                .encrypt(&data, &KEY, Some(&HASH_KEY), NONCE, &options)
                .unwrap();
            let decryptor = Decryptor::new(threads);
            group.bench_function(BenchmarkId::new(format!("decrypt_{}", label), threads), |b| {
                b.iter(|| {
                    decryptor
                        .decrypt(black_box(&encrypted), &KEY, Some(&HASH_KEY), &options)
                        .unwrap()
                })
            });
        }
    }

    group.finish();
}

criterion_group!(benches, stream_benchmark);
criterion_main!(benches);
