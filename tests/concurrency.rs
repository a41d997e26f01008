use bytes::Bytes;
use std::sync::Arc;
use std::thread;
use tinyredis::*;

const THREADS: usize = 8;
const ROUNDS: usize = 200;

fn run(shard: &Shard, args: &[&str]) -> Reply {
    shard.execute(args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect())
}

fn hammer(shard: &Arc<Shard>) {
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let shard = shard.clone();
            thread::spawn(move || {
                for i in 0..ROUNDS {
                    let item = format!("{}:{}", t, i);
                    assert!(!run(&shard, &["RPUSH", "l", &item]).is_error());
                    assert!(!run(&shard, &["INCR", "n"]).is_error());
                    if i % 3 == 0 {
                        run(&shard, &["LPOP", "l"]);
                    }
                    run(&shard, &["HSET", "h", &t.to_string(), &item]);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().expect("worker panicked");
    }
}

fn state(shard: &Shard) -> Vec<Reply> {
    let mut out = vec![
        run(shard, &["LRANGE", "l", "0", "-1"]),
        run(shard, &["GET", "n"]),
        run(shard, &["HLEN", "h"]),
        run(shard, &["DBSIZE"]),
    ];
    out.extend((0..THREADS).map(|t| run(shard, &["HGET", "h", &t.to_string()])));
    out
}

#[test]
fn concurrent_writers_replay_to_live_state() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PersistenceConfig::in_dir(dir.path());

    let live = {
        let shard = Arc::new(Shard::open(0, &cfg));
        hammer(&shard);
        state(&shard)
    };
    assert_eq!(live[1], Reply::Bulk(Bytes::from((THREADS * ROUNDS).to_string())));

    let replayed = Shard::open(0, &cfg);
    assert_eq!(state(&replayed), live);
}

#[test]
fn concurrent_writers_with_everysec_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PersistenceConfig {
        fsync: FsyncPolicy::Everysec,
        checkpoint_interval: Some(std::time::Duration::from_millis(5)),
        ..PersistenceConfig::in_dir(dir.path())
    };

    let live = {
        let shard = Arc::new(Shard::open(0, &cfg));
        hammer(&shard);
        state(&shard)
    };

    let replayed = Shard::open(0, &cfg);
    assert_eq!(state(&replayed), live);
}
