/*!
 * Snapshot Persistence
 *
 * A snapshot is a JSON document holding every live key at one point in
 * time:
 *
 * ```json
 * {
 *   "counter": { "type": "integer", "value": 6, "ttl": -1 },
 *   "greeting": { "type": "string", "value": "hello", "ttl": 120 },
 *   "queue": { "type": "list", "value": ["a", "b"], "ttl": -1 }
 * }
 * ```
 *
 * `ttl` is `-1` for keys without expiration, otherwise the remaining
 * seconds rounded up. Entries whose key or payload is not valid UTF-8 are
 * written hex-encoded and carry `"encoding": "hex"`.
 */

use crate::error::PersistError;
use crate::storage::Dict;
use crate::value::{Data, HashData, SetData, Value};
use bytes::Bytes;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    String,
    Integer,
    List,
    Set,
    Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Encoding {
    Hex,
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    #[serde(rename = "type")]
    kind: EntryKind,
    value: Json,
    ttl: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encoding: Option<Encoding>,
}

/// Byte strings rendered as JSON text, either verbatim or hex
struct Codec(Option<Encoding>);

impl Codec {
    fn for_value(key: &[u8], v: &Value) -> Self {
        let utf8 = |b: &[u8]| std::str::from_utf8(b).is_ok();
        let clean = utf8(key)
            && match &v.data {
                Data::Str(s) => utf8(s),
                Data::Int(_) => true,
                Data::List(l) => l.iter().all(|e| utf8(e)),
                Data::Set(s) => s.iter().all(|e| utf8(e)),
                Data::Hash(h) => h.iter().all(|(f, x)| utf8(f) && utf8(x)),
            };
        Codec(if clean { None } else { Some(Encoding::Hex) })
    }

    fn text(&self, b: &[u8]) -> String {
        match self.0 {
            Some(Encoding::Hex) => hex::encode(b),
            None => String::from_utf8_lossy(b).into_owned(),
        }
    }

    fn bytes(&self, s: &str) -> Result<Bytes, String> {
        match self.0 {
            Some(Encoding::Hex) => hex::decode(s).map(Bytes::from).map_err(|e| e.to_string()),
            None => Ok(Bytes::copy_from_slice(s.as_bytes())),
        }
    }
}

fn encode_entry(key: &[u8], v: &Value, now: Instant) -> (String, Entry) {
    let codec = Codec::for_value(key, v);
    let (kind, value) = match &v.data {
        Data::Str(s) => (EntryKind::String, Json::String(codec.text(s))),
        Data::Int(i) => (EntryKind::Integer, Json::from(*i)),
        Data::List(l) => (
            EntryKind::List,
            Json::Array(l.iter().map(|e| Json::String(codec.text(e))).collect()),
        ),
        Data::Set(s) => {
            let mut members: Vec<String> = s.iter().map(|e| codec.text(e)).collect();
            members.sort();
            (EntryKind::Set, Json::from(members))
        }
        Data::Hash(h) => {
            let fields: serde_json::Map<String, Json> = h
                .iter()
                .map(|(f, x)| (codec.text(f), Json::String(codec.text(x))))
                .collect();
            (EntryKind::Hash, Json::Object(fields))
        }
    };
    let ttl = match v.remaining_ms(now) {
        None => -1,
        Some(ms) => ms.div_ceil(1000) as i64,
    };
    let entry = Entry { kind, value, ttl, encoding: codec.0 };
    (codec.text(key), entry)
}

fn decode_strings(value: &Json, codec: &Codec) -> Result<Vec<Bytes>, String> {
    value
        .as_array()
        .ok_or("expected an array")?
        .iter()
        .map(|e| e.as_str().ok_or_else(|| "expected a string element".to_string()).and_then(|s| codec.bytes(s)))
        .collect()
}

fn decode_entry(name: &str, entry: &Entry) -> Result<(Bytes, Data), String> {
    let codec = Codec(entry.encoding);
    let key = codec.bytes(name)?;
    let data = match entry.kind {
        EntryKind::String => {
            let s = entry.value.as_str().ok_or("expected a string")?;
            Data::Str(codec.bytes(s)?.to_vec())
        }
        EntryKind::Integer => Data::Int(entry.value.as_i64().ok_or("expected an integer")?),
        EntryKind::List => Data::List(decode_strings(&entry.value, &codec)?.into_iter().collect::<VecDeque<_>>()),
        EntryKind::Set => Data::Set(decode_strings(&entry.value, &codec)?.into_iter().collect::<SetData>()),
        EntryKind::Hash => {
            let obj = entry.value.as_object().ok_or("expected an object")?;
            let mut h = HashData::default();
            for (f, x) in obj {
                let x = x.as_str().ok_or("expected a string field value")?;
                h.insert(codec.bytes(f)?, codec.bytes(x)?);
            }
            Data::Hash(h)
        }
    };
    Ok((key, data))
}

/// Write every live key of `dict` to `path`, atomically replacing it
///
/// The document goes to `<path>.tmp` first, is synced, then renamed over
/// the target, so a crash mid-save leaves the previous snapshot intact.
///
/// # Returns
/// * number of keys written
pub fn save(dict: &Dict, path: impl AsRef<Path>, now: Instant) -> Result<usize, PersistError> {
    let path = path.as_ref();
    let doc: BTreeMap<String, Entry> = dict
        .iter()
        .filter(|(_, v)| !v.is_expired(now))
        .map(|(k, v)| encode_entry(k, v, now))
        .collect();

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut w, &doc)?;
        w.write_all(b"\n")?;
        let f = w.into_inner().map_err(|e| e.into_error())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent(path)?;

    info!("saved {} keys to {}", doc.len(), path.display());
    Ok(doc.len())
}

/// Flush the directory entry created by the rename
#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Load a snapshot into a fresh `Dict`
///
/// # Returns
/// * `Ok(None)` if no snapshot exists (cold start)
/// * `Ok(Some(dict))` otherwise; individual malformed or already expired
///   entries are skipped with a warning
/// * `Err(...)` if the file can't be read or isn't a JSON object
pub fn load(path: impl AsRef<Path>, now: Instant) -> Result<Option<Dict>, PersistError> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("no snapshot at {}", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let doc: serde_json::Map<String, Json> = serde_json::from_reader(BufReader::new(file))?;

    let mut dict = Dict::default();
    for (name, raw) in doc {
        let entry: Entry = match serde_json::from_value(raw) {
            Ok(e) => e,
            Err(e) => {
                warn!("{}", PersistError::InvalidEntry { key: name, reason: e.to_string() });
                continue;
            }
        };
        if entry.ttl == 0 || entry.ttl < -1 {
            debug!("skipping expired snapshot entry '{}'", name);
            continue;
        }
        match decode_entry(&name, &entry) {
            Ok((key, data)) => {
                let mut v = Value::new(data);
                if entry.ttl > 0 {
                    v.set_expiration(entry.ttl, now);
                }
                dict.insert(key, v);
            }
            Err(reason) => {
                warn!("{}", PersistError::InvalidEntry { key: name, reason });
            }
        }
    }

    info!("loaded {} keys from {}", dict.iter().count(), path.display());
    Ok(Some(dict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn round_trip_all_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let now = Instant::now();

        let mut d = Dict::default();
        d.set(b("s"), b"hello world");
        d.incr_by(&b("n"), -42, now).unwrap();
        d.rpush(&b("l"), &[b("a"), b("b"), b("c")], now).unwrap();
        d.sadd(&b("set"), &[b("x"), b("y")], now).unwrap();
        d.hset(&b("h"), b("f"), b("v"), now).unwrap();
        d.set(b("bin"), &[0xff, 0x00, 0x10]);
        d.set(b("ttl"), b"soon");
        d.expire(b"ttl", 100, now);
        d.set(b("gone"), b"x");
        d.expire(b"gone", 1, now);

        let later = now + Duration::from_secs(2);
        assert_eq!(save(&d, &path, later).unwrap(), 7);

        let mut loaded = load(&path, later).unwrap().unwrap();
        assert_eq!(loaded.get(b"s", later).unwrap(), Some(b("hello world")));
        assert_eq!(loaded.get(b"n", later).unwrap(), Some(b("-42")));
        assert_eq!(loaded.lrange(b"l", 0, -1, later).unwrap(), vec![b("a"), b("b"), b("c")]);
        assert_eq!(loaded.scard(b"set", later), Ok(2));
        assert_eq!(loaded.hget(b"h", b"f", later).unwrap(), Some(b("v")));
        assert_eq!(loaded.get(b"bin", later).unwrap().unwrap(), Bytes::from_static(&[0xff, 0x00, 0x10]));
        let ttl = loaded.ttl(b"ttl", later);
        assert!(ttl > 95 && ttl <= 98, "ttl was {}", ttl);
        assert!(!loaded.exists(b"gone", later));
    }

    #[test]
    fn document_shape_matches_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let now = Instant::now();
        let mut d = Dict::default();
        d.incr_by(&b("counter"), 6, now).unwrap();
        save(&d, &path, now).unwrap();

        let doc: Json = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["counter"]["type"], "integer");
        assert_eq!(doc["counter"]["value"], 6);
        assert_eq!(doc["counter"]["ttl"], -1);
        assert!(doc["counter"].get("encoding").is_none());
    }

    #[test]
    fn missing_snapshot_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path().join("none.json"), Instant::now()).unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_is_an_error_and_bad_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load(&path, Instant::now()).is_err());

        fs::write(
            &path,
            r#"{"ok": {"type": "string", "value": "v", "ttl": -1},
                "bad": {"type": "integer", "value": "nope", "ttl": -1},
                "old": {"type": "string", "value": "v", "ttl": 0}}"#,
        )
        .unwrap();
        let now = Instant::now();
        let mut d = load(&path, now).unwrap().unwrap();
        assert_eq!(d.len(now), 1);
        assert!(d.exists(b"ok", now));
    }

    #[test]
    fn unknown_type_or_missing_ttl_drops_only_that_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        fs::write(
            &path,
            r#"{"a": {"type": "string", "value": "v", "ttl": -1},
                "b": {"type": "zset", "value": ["m"], "ttl": -1},
                "c": {"type": "string", "value": "v"},
                "d": {"type": "string", "value": "v", "ttl": "soon"},
                "e": 7}"#,
        )
        .unwrap();
        let now = Instant::now();
        let mut d = load(&path, now).unwrap().unwrap();
        assert_eq!(d.len(now), 1);
        assert_eq!(d.get(b"a", now).unwrap(), Some(b("v")));
    }

    #[test]
    fn save_replaces_previous_snapshot_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.json");
        let now = Instant::now();
        let mut d = Dict::default();
        d.set(b("k"), b"old");
        save(&d, &path, now).unwrap();
        d.set(b("k"), b"new");
        d.set(b("k2"), b"x");
        assert_eq!(save(&d, &path, now).unwrap(), 2);

        assert!(!dir.path().join("dump.json.tmp").exists());
        let mut loaded = load(&path, now).unwrap().unwrap();
        assert_eq!(loaded.get(b"k", now).unwrap(), Some(b("new")));
    }

    #[test]
    fn save_in_working_directory_syncs_current_dir() {
        assert!(sync_parent(Path::new("dump.json")).is_ok());
    }
}
