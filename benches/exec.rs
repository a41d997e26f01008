use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::Rng;
use tinyredis::*;

fn bench_exec_set_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("exec");
    group.bench_function("set_get", |b| {
        b.iter_batched(
            || Shard::new(0),
            |shard| {
                for i in 0..1000u32 {
                    let k = Bytes::from(format!("k{}", i));
                    let v = Bytes::from(format!("v{}", i));
                    let _ = shard.exec(Cmd::Set(k.clone(), v));
                    let _ = shard.exec(Cmd::Get(k));
                }
                black_box(shard)
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("mixed_random_keys", |b| {
        let mut rng = rand::thread_rng();
        let keys: Vec<Bytes> = (0..10_000)
            .map(|_| Bytes::from(format!("key:{}", rng.gen_range(0..1000))))
            .collect();
        b.iter_batched(
            || Shard::new(0),
            |shard| {
                for k in &keys {
                    let _ = shard.exec(Cmd::IncrBy { name: "INCR", key: k.clone(), delta: 1 });
                    let _ = shard.exec(Cmd::RPush(Bytes::from_static(b"list"), vec![k.clone()]));
                    let _ = shard.exec(Cmd::SAdd(Bytes::from_static(b"set"), vec![k.clone()]));
                }
                black_box(shard)
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(benches, bench_exec_set_get);
criterion_main!(benches);
