/*!
 * Command Execution Shard
 *
 * A shard owns the keyspace and its durability state behind one mutex.
 * Each command runs as a single critical section: lazy expiration, type
 * check, mutation, log append and checkpoint check all happen before the
 * lock is released, so the log order is the order mutations were applied.
 */

use crate::aof::{self, Aof};
use crate::command::Cmd;
use crate::config::PersistenceConfig;
use crate::error::{PersistError, StoreError, StoreResult};
use crate::protocol::Reply;
use crate::snapshot;
use crate::storage::Dict;
use crate::value::{deadline_after, Kind};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Log records produced while applying one command
struct Journal {
    enabled: bool,
    mutated: bool,
    records: Vec<Vec<u8>>,
}

impl Journal {
    fn new(enabled: bool) -> Self {
        Self { enabled, mutated: false, records: Vec::new() }
    }

    fn record(&mut self, name: &str, args: &[&Bytes]) {
        self.mutated = true;
        if !self.enabled {
            return;
        }
        let mut parts: Vec<&[u8]> = Vec::with_capacity(args.len() + 1);
        parts.push(name.as_bytes());
        parts.extend(args.iter().map(|a| &a[..]));
        self.records.push(aof::emit(&parts));
    }
}

struct Durability {
    snapshot_path: PathBuf,
    aof: Option<Aof>,
    checkpoint_interval: Option<Duration>,
    last_checkpoint: Instant,
    /// Mutations applied since the last snapshot
    dirty: bool,
}

impl Durability {
    /// Append records; a failing log is switched off
    fn log(&mut self, records: &[Vec<u8>]) {
        let Some(aof) = self.aof.as_mut() else { return };
        if let Err(e) = records.iter().try_for_each(|r| aof.append(r)) {
            error!("append to {} failed, disabling the log: {}", aof.path().display(), e);
            self.aof = None;
        }
    }

    fn checkpoint_due(&self, now: Instant) -> bool {
        self.dirty
            && self
                .checkpoint_interval
                .map_or(false, |every| now.saturating_duration_since(self.last_checkpoint) >= every)
    }

    /// Snapshot the keyspace, then start a fresh log
    ///
    /// A failed attempt still counts towards the interval, so the next
    /// automatic try waits a full period.
    fn checkpoint(&mut self, dict: &Dict, now: Instant) -> Result<usize, PersistError> {
        self.last_checkpoint = now;
        let saved = snapshot::save(dict, &self.snapshot_path, now)?;
        self.dirty = false;
        if let Some(aof) = self.aof.as_mut() {
            if let Err(e) = aof.truncate() {
                error!("truncating {} failed, disabling the log: {}", aof.path().display(), e);
                self.aof = None;
            }
        }
        Ok(saved)
    }
}

struct State {
    dict: Dict,
    durability: Option<Durability>,
}

impl State {
    fn save(&mut self, now: Instant) -> Result<usize, PersistError> {
        match self.durability.as_mut() {
            Some(d) => d.checkpoint(&self.dict, now),
            None => Err(PersistError::Disabled),
        }
    }
}

/// A shard represents a single execution unit
///
/// It is shared between connection threads through an `Arc`; all access
/// goes through the internal lock.
#[repr(align(64))]
pub struct Shard {
    /// Unique identifier for this shard
    pub id: usize,
    state: Mutex<State>,
}

impl Shard {
    /// Create an in-memory shard with no durability
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: Mutex::new(State { dict: Dict::default(), durability: None }),
        }
    }

    /// Rebuild a shard from disk and keep it durable from then on
    ///
    /// Loads the snapshot (a missing or unreadable one means an empty
    /// keyspace), replays the log tail with logging off, then reopens the
    /// log for appending. Nothing here is fatal; problems are logged and
    /// the shard starts with whatever could be recovered.
    ///
    /// # Arguments
    /// * `id` - Unique identifier for this shard
    /// * `cfg` - snapshot and log locations, fsync and checkpoint policy
    pub fn open(id: usize, cfg: &PersistenceConfig) -> Self {
        let now = Instant::now();
        let mut dict = match snapshot::load(&cfg.snapshot_path, now) {
            Ok(Some(dict)) => dict,
            Ok(None) => Dict::default(),
            Err(e) => {
                warn!(
                    "ignoring unreadable snapshot {}: {}",
                    cfg.snapshot_path.display(),
                    e
                );
                Dict::default()
            }
        };

        let aof = cfg.aof_path.as_ref().and_then(|path| {
            match aof::read_records(path) {
                Ok(records) => {
                    let applied = replay(&mut dict, records);
                    info!("replayed {} records from {}", applied, path.display());
                }
                Err(e) => warn!("skipping replay of {}: {}", path.display(), e),
            }
            Aof::open(path, cfg.fsync)
                .map_err(|e| warn!("cannot open {}, running without a log: {}", path.display(), e))
                .ok()
        });

        let durability = Durability {
            snapshot_path: cfg.snapshot_path.clone(),
            aof,
            checkpoint_interval: cfg.checkpoint_interval,
            last_checkpoint: Instant::now(),
            dirty: false,
        };
        Self {
            id,
            state: Mutex::new(State { dict, durability: Some(durability) }),
        }
    }

    /// Execute a command and return its typed reply
    ///
    /// Successful mutations are appended to the log before the lock is
    /// released. `SAVE` and `SHUTDOWN` write a snapshot and reply with an
    /// error if that fails.
    pub fn exec(&self, cmd: Cmd) -> Reply {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Instant::now();

        match cmd {
            Cmd::Save => return persist_reply(state.save(now)),
            Cmd::Shutdown => {
                let reply = match state.durability {
                    Some(_) => persist_reply(state.save(now)),
                    None => Reply::ok(),
                };
                if !reply.is_error() {
                    info!("shard {} shut down", self.id);
                }
                return reply;
            }
            _ => {}
        }

        let logging = state.durability.as_ref().map_or(false, |d| d.aof.is_some());
        let mut journal = Journal::new(logging);
        let reply = apply(&mut state.dict, cmd, now, &mut journal);

        if let Some(d) = state.durability.as_mut() {
            if journal.mutated {
                d.dirty = true;
                d.log(&journal.records);
            }
            if d.checkpoint_due(now) {
                if let Err(e) = d.checkpoint(&state.dict, now) {
                    error!("checkpoint failed: {}", e);
                }
            }
        }
        reply
    }

    /// Execute a command and write the RESP reply directly to `out`
    pub fn exec_into(&self, cmd: Cmd, out: &mut BytesMut) {
        self.exec(cmd).encode(out);
    }

    /// Validate a raw argument vector and execute it
    pub fn execute(&self, args: Vec<Bytes>) -> Reply {
        match Cmd::parse(args) {
            Ok(cmd) => self.exec(cmd),
            Err(e) => StoreError::from(e).into(),
        }
    }

    /// Write a snapshot now and truncate the log
    pub fn save(&self) -> Result<usize, PersistError> {
        self.state.lock().save(Instant::now())
    }

    /// Timer hook: checkpoint if the interval has elapsed since the last
    /// one and something changed
    pub fn tick(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Instant::now();
        if let Some(d) = state.durability.as_mut() {
            if d.checkpoint_due(now) {
                debug!("checkpoint timer fired on shard {}", self.id);
                if let Err(e) = d.checkpoint(&state.dict, now) {
                    error!("checkpoint failed: {}", e);
                }
            }
        }
    }

    /// Final snapshot before the process exits
    ///
    /// If the snapshot can't be written the log is synced instead, so
    /// records still queued for the background writer reach disk.
    pub fn shutdown(&self) -> Result<(), PersistError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(d) = state.durability.as_mut() else { return Ok(()) };
        let saved = d.checkpoint(&state.dict, Instant::now());
        if saved.is_err() {
            if let Some(aof) = d.aof.as_mut() {
                if let Err(e) = aof.sync() {
                    error!("final sync of {} failed: {}", aof.path().display(), e);
                }
            }
        }
        info!("shard {} shut down", self.id);
        saved.map(|_| ())
    }
}

fn persist_reply(r: Result<usize, PersistError>) -> Reply {
    match r {
        Ok(_) => Reply::ok(),
        Err(e) => {
            error!("snapshot failed: {}", e);
            StoreError::Persistence(e.to_string()).into()
        }
    }
}

/// Apply logged records on top of a freshly loaded keyspace
///
/// Records go through the same path as live commands; only mutating
/// commands are considered. Returns how many were applied.
fn replay(dict: &mut Dict, records: Vec<Vec<Bytes>>) -> usize {
    let mut applied = 0;
    for args in records {
        let cmd = match Cmd::parse(args) {
            Ok(cmd) if cmd.is_write() => cmd,
            Ok(cmd) => {
                debug!("skipping non-mutating record {:?}", cmd);
                continue;
            }
            Err(e) => {
                warn!("skipping invalid log record: {}", e);
                continue;
            }
        };
        let reply = apply(dict, cmd, Instant::now(), &mut Journal::new(false));
        if let Reply::Error(e) = reply {
            debug!("replayed record failed: {}", e);
        } else {
            applied += 1;
        }
    }
    applied
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

fn int(n: usize) -> Reply {
    Reply::Integer(n as i64)
}

fn num(i: i64) -> Bytes {
    Bytes::from(i.to_string())
}

fn reply<T>(r: StoreResult<T>, f: impl FnOnce(T) -> Reply) -> Reply {
    r.map_or_else(Reply::from, f)
}

/// Run one command against the keyspace, recording its effects
fn apply(dict: &mut Dict, cmd: Cmd, now: Instant, j: &mut Journal) -> Reply {
    match cmd {
        Cmd::Ping(None) => Reply::Simple("PONG"),
        Cmd::Ping(Some(msg)) | Cmd::Echo(msg) => Reply::Bulk(msg),

        //
        // Keys and strings
        //
        Cmd::Get(k) => reply(dict.get(&k, now), Reply::bulk_or_null),

        Cmd::Set(k, v) => {
            dict.set(k.clone(), &v);
            j.record("SET", &[&k, &v]);
            Reply::ok()
        }

        Cmd::Del(keys) => {
            let mut removed = 0;
            for k in &keys {
                if dict.del(k, now) {
                    j.record("DEL", &[k]);
                    removed += 1;
                }
            }
            int(removed)
        }

        Cmd::Exists(keys) => int(keys.iter().filter(|k| dict.exists(k, now)).count()),

        Cmd::IncrBy { name, key, delta } => match dict.incr_by(&key, delta, now) {
            Ok(v) => {
                match name {
                    "INCR" | "DECR" => j.record(name, &[&key]),
                    // DECRBY carries the positive amount
                    "DECRBY" => j.record(name, &[&key, &num(-delta)]),
                    _ => j.record(name, &[&key, &num(delta)]),
                }
                Reply::Integer(v)
            }
            Err(e) => e.into(),
        },

        Cmd::Append(k, v) => match dict.append(&k, &v, now) {
            Ok(len) => {
                j.record("APPEND", &[&k, &v]);
                int(len)
            }
            Err(e) => e.into(),
        },

        Cmd::Strlen(k) => reply(dict.strlen(&k, now), int),

        Cmd::MGet(keys) => Reply::Array(
            dict.mget(&keys, now)
                .into_iter()
                .map(Reply::bulk_or_null)
                .collect(),
        ),

        Cmd::MSet(pairs) => {
            dict.mset(&pairs);
            for (k, v) in &pairs {
                j.record("SET", &[k, v]);
            }
            Reply::ok()
        }

        Cmd::GetRange(k, start, end) => reply(dict.getrange(&k, start, end, now), Reply::Bulk),

        Cmd::SetRange(k, offset, v) => match dict.setrange(&k, offset, &v, now) {
            Ok(len) => {
                j.record("SETRANGE", &[&k, &num(offset as i64), &v]);
                int(len)
            }
            Err(e) => e.into(),
        },

        //
        // Expiration
        //
        Cmd::Expire(k, seconds) => {
            let at_ms = unix_ms().saturating_add(seconds.saturating_mul(1000));
            if dict.expire(&k, seconds, now) {
                j.record("PEXPIREAT", &[&k, &num(at_ms)]);
                Reply::Integer(1)
            } else {
                Reply::Integer(0)
            }
        }

        Cmd::PExpireAt(k, at_ms) => {
            let at = deadline_after(now, at_ms.saturating_sub(unix_ms()));
            if dict.expire_at(&k, at, now) {
                j.record("PEXPIREAT", &[&k, &num(at_ms)]);
                Reply::Integer(1)
            } else {
                Reply::Integer(0)
            }
        }

        Cmd::Ttl(k) => Reply::Integer(dict.ttl(&k, now)),

        Cmd::Persist(k) => {
            if dict.persist(&k, now) {
                j.record("PERSIST", &[&k]);
                Reply::Integer(1)
            } else {
                Reply::Integer(0)
            }
        }

        Cmd::Type(k) => Reply::Simple(dict.kind(&k, now).map_or("none", Kind::name)),

        //
        // Lists
        //
        Cmd::LPush(k, values) => match dict.lpush(&k, &values, now) {
            Ok(len) => {
                for v in &values {
                    j.record("LPUSH", &[&k, v]);
                }
                int(len)
            }
            Err(e) => e.into(),
        },

        Cmd::RPush(k, values) => match dict.rpush(&k, &values, now) {
            Ok(len) => {
                for v in &values {
                    j.record("RPUSH", &[&k, v]);
                }
                int(len)
            }
            Err(e) => e.into(),
        },

        Cmd::LPop(k) => match dict.lpop(&k, now) {
            Ok(Some(v)) => {
                j.record("LPOP", &[&k]);
                Reply::Bulk(v)
            }
            Ok(None) => Reply::Null,
            Err(e) => e.into(),
        },

        Cmd::RPop(k) => match dict.rpop(&k, now) {
            Ok(Some(v)) => {
                j.record("RPOP", &[&k]);
                Reply::Bulk(v)
            }
            Ok(None) => Reply::Null,
            Err(e) => e.into(),
        },

        Cmd::LLen(k) => reply(dict.llen(&k, now), int),
        Cmd::LRange(k, start, stop) => reply(dict.lrange(&k, start, stop, now), Reply::bulks),
        Cmd::LIndex(k, idx) => reply(dict.lindex(&k, idx, now), Reply::bulk_or_null),

        Cmd::LSet(k, idx, v) => match dict.lset(&k, idx, v.clone(), now) {
            Ok(()) => {
                j.record("LSET", &[&k, &num(idx), &v]);
                Reply::ok()
            }
            Err(e) => e.into(),
        },

        //
        // Sets
        //
        Cmd::SAdd(k, members) => match dict.sadd(&k, &members, now) {
            Ok(added) => {
                for m in &added {
                    j.record("SADD", &[&k, m]);
                }
                int(added.len())
            }
            Err(e) => e.into(),
        },

        Cmd::SRem(k, members) => match dict.srem(&k, &members, now) {
            Ok(removed) => {
                for m in &removed {
                    j.record("SREM", &[&k, m]);
                }
                int(removed.len())
            }
            Err(e) => e.into(),
        },

        Cmd::SMembers(k) => reply(dict.smembers(&k, now), Reply::bulks),
        Cmd::SIsMember(k, m) => reply(dict.sismember(&k, &m, now), |b| Reply::Integer(b as i64)),
        Cmd::SCard(k) => reply(dict.scard(&k, now), int),

        //
        // Hashes
        //
        Cmd::HSet(k, f, v) => match dict.hset(&k, f.clone(), v.clone(), now) {
            Ok(created) => {
                j.record("HSET", &[&k, &f, &v]);
                Reply::Integer(created as i64)
            }
            Err(e) => e.into(),
        },

        Cmd::HGet(k, f) => reply(dict.hget(&k, &f, now), Reply::bulk_or_null),

        Cmd::HDel(k, fields) => match dict.hdel(&k, &fields, now) {
            Ok(removed) => {
                for f in &removed {
                    j.record("HDEL", &[&k, f]);
                }
                int(removed.len())
            }
            Err(e) => e.into(),
        },

        Cmd::HGetAll(k) => reply(dict.hgetall(&k, now), |pairs| {
            Reply::bulks(pairs.into_iter().flat_map(|(f, v)| [f, v]))
        }),
        Cmd::HKeys(k) => reply(dict.hkeys(&k, now), Reply::bulks),
        Cmd::HVals(k) => reply(dict.hvals(&k, now), Reply::bulks),
        Cmd::HLen(k) => reply(dict.hlen(&k, now), int),
        Cmd::HExists(k, f) => reply(dict.hexists(&k, &f, now), |b| Reply::Integer(b as i64)),

        Cmd::DbSize => int(dict.len(now)),

        // Handled by `Shard::exec`, never logged
        Cmd::Save | Cmd::Shutdown => Reply::Error("ERR command not allowed here".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(shard: &Shard, line: &str) -> Reply {
        shard.execute(
            line.split_whitespace()
                .map(|s| Bytes::copy_from_slice(s.as_bytes()))
                .collect(),
        )
    }

    #[test]
    fn test_shard_alignment() {
        assert_eq!(std::mem::align_of::<Shard>(), 64, "Shard struct should be aligned to 64 bytes");
    }

    #[test]
    fn save_without_persistence_is_an_error() {
        let shard = Shard::new(0);
        assert!(run(&shard, "SAVE").is_error());
        assert_eq!(run(&shard, "SHUTDOWN"), Reply::ok());
    }

    #[test]
    fn only_effects_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PersistenceConfig::in_dir(dir.path());
        let shard = Shard::open(0, &cfg);

        run(&shard, "SADD s a a b");
        run(&shard, "SREM s zz");
        run(&shard, "DEL nope s");
        run(&shard, "SET str v");
        assert!(run(&shard, "LPUSH str x").is_error());
        run(&shard, "EXPIRE str 100");
        run(&shard, "DECRBY n 3");

        let records = aof::read_records(cfg.aof_path.as_ref().unwrap()).unwrap();
        let names: Vec<String> = records
            .iter()
            .map(|r| String::from_utf8_lossy(&r[0]).into_owned())
            .collect();
        assert_eq!(names, ["SADD", "SADD", "DEL", "SET", "PEXPIREAT", "DECRBY"]);
        assert_eq!(&records[5][2][..], b"3");
    }

    #[test]
    fn save_truncates_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PersistenceConfig::in_dir(dir.path());
        let shard = Shard::open(0, &cfg);
        run(&shard, "RPUSH l a b");
        assert_eq!(run(&shard, "SAVE"), Reply::ok());

        assert!(aof::read_records(cfg.aof_path.as_ref().unwrap()).unwrap().is_empty());
        assert!(cfg.snapshot_path.exists());
    }

    #[test]
    fn elapsed_interval_triggers_checkpoint_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PersistenceConfig {
            checkpoint_interval: Some(Duration::ZERO),
            ..PersistenceConfig::in_dir(dir.path())
        };
        let shard = Shard::open(0, &cfg);
        run(&shard, "SET k v");

        assert!(cfg.snapshot_path.exists());
        assert!(aof::read_records(cfg.aof_path.as_ref().unwrap()).unwrap().is_empty());
    }

    #[test]
    fn reads_do_not_mark_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PersistenceConfig {
            checkpoint_interval: Some(Duration::ZERO),
            ..PersistenceConfig::in_dir(dir.path())
        };
        let shard = Shard::open(0, &cfg);
        run(&shard, "GET k");
        shard.tick();
        assert!(!cfg.snapshot_path.exists());
    }

    /// A snapshot target that can't be replaced: a non-empty directory
    fn blocked_target(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("dump.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();
        path
    }

    #[test]
    fn failed_checkpoint_waits_a_full_interval() {
        let dir = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let every = Duration::from_secs(60);
        let mut d = Durability {
            snapshot_path: blocked_target(dir.path()),
            aof: None,
            checkpoint_interval: Some(every),
            last_checkpoint: start,
            dirty: true,
        };
        let mut dict = Dict::default();
        dict.set(Bytes::from_static(b"k"), b"v");

        let due = start + every;
        assert!(d.checkpoint_due(due));
        assert!(d.checkpoint(&dict, due).is_err());
        assert!(d.dirty);
        assert!(!d.checkpoint_due(due));
        assert!(!d.checkpoint_due(due + every / 2));
        assert!(d.checkpoint_due(due + every));
    }

    #[test]
    fn unwritable_snapshot_is_not_retried_on_every_write() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PersistenceConfig {
            snapshot_path: blocked_target(dir.path()),
            checkpoint_interval: Some(Duration::ZERO),
            ..PersistenceConfig::in_dir(dir.path())
        };
        let tmp = dir.path().join("dump.json.tmp");
        let shard = Shard::open(0, &cfg);
        for i in 0..2000 {
            shard.state.lock().dict.set(Bytes::from(format!("k{}", i)), b"v");
        }

        run(&shard, "SET first v");
        assert!(tmp.exists(), "first checkpoint should have been attempted");

        if let Some(d) = shard.state.lock().durability.as_mut() {
            d.checkpoint_interval = Some(Duration::from_secs(3600));
        }
        for i in 0..5 {
            std::fs::remove_file(&tmp).ok();
            assert_eq!(run(&shard, &format!("SET again{} v", i)), Reply::ok());
            shard.tick();
            assert!(!tmp.exists(), "write {} re-serialized the keyspace", i);
        }
        assert_eq!(aof::read_records(cfg.aof_path.as_ref().unwrap()).unwrap().len(), 6);
    }

    #[test]
    fn failed_shutdown_snapshot_still_syncs_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PersistenceConfig {
            snapshot_path: blocked_target(dir.path()),
            fsync: crate::aof::FsyncPolicy::Everysec,
            ..PersistenceConfig::in_dir(dir.path())
        };
        let shard = Shard::open(0, &cfg);
        for i in 0..50 {
            run(&shard, &format!("RPUSH l {}", i));
        }
        assert!(shard.shutdown().is_err());
        // writer thread still running
        assert_eq!(aof::read_records(cfg.aof_path.as_ref().unwrap()).unwrap().len(), 50);
    }
}
