/*!
 * In-Memory Storage Implementation
 *
 * This module provides the keyspace for tinyredis: a dictionary from key
 * to typed `Value`, plus the typed command API the shard executes against.
 *
 * Every operation purges the keys it touches if they have expired before
 * doing anything else (lazy expiration). There is no background sweep.
 * Operations return typed results; rendering to RESP happens elsewhere.
 */

use crate::error::{ArgError, StoreError, StoreResult};
use crate::value::{AHash, Data, HashData, Kind, SetData, Value};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Largest string SETRANGE may grow a value to (512 MiB, as in Redis)
pub const MAX_STRING_LEN: usize = 512 * 1024 * 1024;

/// The keyspace
///
/// Not synchronized on its own; the shard wraps it in a mutex so that a
/// whole command runs as one critical section.
#[derive(Default, Debug)]
pub struct Dict {
    /// Internal HashMap with AHash for fast lookups
    pub(crate) inner: HashMap<Bytes, Value, AHash>,
}

fn as_list(d: &mut Data) -> Option<&mut VecDeque<Bytes>> {
    match d {
        Data::List(l) => Some(l),
        _ => None,
    }
}

fn as_set(d: &mut Data) -> Option<&mut SetData> {
    match d {
        Data::Set(s) => Some(s),
        _ => None,
    }
}

fn as_hash(d: &mut Data) -> Option<&mut HashData> {
    match d {
        Data::Hash(h) => Some(h),
        _ => None,
    }
}

/// Parse a string payload that is the canonical decimal form of an i64
fn parse_canonical_int(s: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(s).ok()?;
    let i: i64 = text.parse().ok()?;
    (i.to_string() == text).then_some(i)
}

/// Resolve a Redis-style inclusive range against a sequence length
///
/// Negative indexes count from the end (`len + idx`); the result is then
/// clamped to `[0, len - 1]`. Returns `None` when the range is empty.
pub fn clamp_range(start: i64, end: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let mut s = if start < 0 { len.saturating_add(start) } else { start };
    let mut e = if end < 0 { len.saturating_add(end) } else { end };
    if s < 0 {
        s = 0;
    }
    if e >= len {
        e = len - 1;
    }
    if s > e || s >= len {
        return None;
    }
    Some((s as usize, e as usize))
}

/// Resolve a single list index, negative counting from the tail
fn resolve_index(idx: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if idx < 0 { len.saturating_add(idx) } else { idx };
    (0..len).contains(&i).then_some(i as usize)
}

impl Dict {
    /// Remove `k` if it has expired. Returns true if it was removed.
    #[inline]
    fn purge(&mut self, k: &[u8], now: Instant) -> bool {
        if self.inner.get(k).map_or(false, |v| v.is_expired(now)) {
            self.inner.remove(k);
            true
        } else {
            false
        }
    }

    /// Live value for `k` after lazy expiration
    pub fn get_value(&mut self, k: &[u8], now: Instant) -> Option<&Value> {
        self.purge(k, now);
        self.inner.get(k)
    }

    fn collection_mut<T>(
        &mut self,
        k: &[u8],
        now: Instant,
        pick: fn(&mut Data) -> Option<&mut T>,
    ) -> StoreResult<Option<&mut T>> {
        self.purge(k, now);
        match self.inner.get_mut(k) {
            None => Ok(None),
            Some(v) => pick(&mut v.data).map(Some).ok_or(StoreError::WrongType),
        }
    }

    fn collection_or_create<T>(
        &mut self,
        k: &Bytes,
        now: Instant,
        empty: fn() -> Value,
        pick: fn(&mut Data) -> Option<&mut T>,
    ) -> StoreResult<&mut T> {
        self.purge(k, now);
        let v = self.inner.entry(k.clone()).or_insert_with(empty);
        pick(&mut v.data).ok_or(StoreError::WrongType)
    }

    /// Collections emptied by a removal leave the keyspace
    fn drop_if_empty(&mut self, k: &[u8]) {
        if self.inner.get(k).map_or(false, Value::is_empty_collection) {
            self.inner.remove(k);
        }
    }

    /// Insert a fully formed value, replacing any previous one
    pub fn insert(&mut self, k: Bytes, v: Value) {
        self.inner.insert(k, v);
    }

    /// Iterate every stored entry, expired or not
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Value)> {
        self.inner.iter()
    }

    /// Number of live keys. Expired entries are purged first.
    pub fn len(&mut self, now: Instant) -> usize {
        self.inner.retain(|_, v| !v.is_expired(now));
        self.inner.len()
    }

    //
    // Keys and strings
    //

    /// GET: string and integer values as bytes
    ///
    /// # Returns
    /// * `Ok(None)` if the key doesn't exist
    /// * `Err(WrongType)` for collection values
    pub fn get(&mut self, k: &[u8], now: Instant) -> StoreResult<Option<Bytes>> {
        match self.get_value(k, now) {
            None => Ok(None),
            Some(v) => v.as_bytes().map(Some).ok_or(StoreError::WrongType),
        }
    }

    /// SET: replace the key with a fresh string, dropping any expiration
    pub fn set(&mut self, k: Bytes, v: &[u8]) {
        self.inner.insert(k, Value::string(v));
    }

    /// DEL: true if a live key was removed
    pub fn del(&mut self, k: &[u8], now: Instant) -> bool {
        if self.purge(k, now) {
            return false;
        }
        self.inner.remove(k).is_some()
    }

    pub fn exists(&mut self, k: &[u8], now: Instant) -> bool {
        self.get_value(k, now).is_some()
    }

    /// INCRBY / DECRBY core
    ///
    /// An absent key starts at `delta`. A string holding the canonical
    /// decimal form of an i64 is promoted to an integer first. Overflow is
    /// reported and leaves the value untouched.
    pub fn incr_by(&mut self, k: &Bytes, delta: i64, now: Instant) -> StoreResult<i64> {
        self.purge(k, now);
        match self.inner.get_mut(k.as_ref()) {
            None => {
                self.inner.insert(k.clone(), Value::integer(delta));
                Ok(delta)
            }
            Some(v) => {
                let current = match &v.data {
                    Data::Int(i) => *i,
                    Data::Str(s) => parse_canonical_int(s).ok_or(StoreError::WrongType)?,
                    _ => return Err(StoreError::WrongType),
                };
                let next = current.checked_add(delta).ok_or(StoreError::Overflow)?;
                v.data = Data::Int(next);
                Ok(next)
            }
        }
    }

    /// APPEND: returns the resulting length
    pub fn append(&mut self, k: &Bytes, suffix: &[u8], now: Instant) -> StoreResult<usize> {
        self.purge(k, now);
        match self.inner.get_mut(k.as_ref()) {
            None => {
                self.inner.insert(k.clone(), Value::string(suffix));
                Ok(suffix.len())
            }
            Some(Value { data: Data::Str(s), .. }) => {
                s.extend_from_slice(suffix);
                Ok(s.len())
            }
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn strlen(&mut self, k: &[u8], now: Instant) -> StoreResult<usize> {
        match self.get_value(k, now) {
            None => Ok(0),
            Some(Value { data: Data::Str(s), .. }) => Ok(s.len()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// MGET: each key looked up independently; missing, expired and
    /// non-string entries come back as `None`
    pub fn mget(&mut self, keys: &[Bytes], now: Instant) -> Vec<Option<Bytes>> {
        keys.iter()
            .map(|k| self.get_value(k, now).and_then(Value::as_bytes))
            .collect()
    }

    pub fn mset(&mut self, pairs: &[(Bytes, Bytes)]) {
        for (k, v) in pairs {
            self.set(k.clone(), v);
        }
    }

    /// GETRANGE with inclusive, clamped, possibly negative bounds
    pub fn getrange(&mut self, k: &[u8], start: i64, end: i64, now: Instant) -> StoreResult<Bytes> {
        let s = match self.get_value(k, now) {
            None => return Ok(Bytes::new()),
            Some(Value { data: Data::Str(s), .. }) => s,
            Some(_) => return Err(StoreError::WrongType),
        };
        Ok(match clamp_range(start, end, s.len()) {
            Some((a, b)) => Bytes::copy_from_slice(&s[a..=b]),
            None => Bytes::new(),
        })
    }

    /// SETRANGE: overwrite at `offset`, zero padding any gap
    pub fn setrange(&mut self, k: &Bytes, offset: usize, patch: &[u8], now: Instant) -> StoreResult<usize> {
        let end = offset
            .checked_add(patch.len())
            .filter(|&n| n <= MAX_STRING_LEN)
            .ok_or(ArgError::Offset)?;
        self.purge(k, now);
        let s = match self
            .inner
            .entry(k.clone())
            .or_insert_with(|| Value::string(Vec::new()))
        {
            Value { data: Data::Str(s), .. } => s,
            _ => return Err(StoreError::WrongType),
        };
        if s.len() < end {
            s.resize(end, 0);
        }
        s[offset..end].copy_from_slice(patch);
        Ok(s.len())
    }

    //
    // Expiration
    //

    /// EXPIRE: false if the key is absent
    pub fn expire(&mut self, k: &[u8], seconds: i64, now: Instant) -> bool {
        self.purge(k, now);
        match self.inner.get_mut(k) {
            Some(v) => {
                v.set_expiration(seconds, now);
                true
            }
            None => false,
        }
    }

    /// Set an absolute deadline; false if the key is absent
    pub fn expire_at(&mut self, k: &[u8], at: Instant, now: Instant) -> bool {
        self.purge(k, now);
        match self.inner.get_mut(k) {
            Some(v) => {
                v.expires_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// TTL: `-2` absent, `-1` no expiration, else whole seconds left
    pub fn ttl(&mut self, k: &[u8], now: Instant) -> i64 {
        match self.get_value(k, now) {
            None => -2,
            Some(v) => v.remaining_ttl(now),
        }
    }

    /// PERSIST: true only if the key existed and had an expiration
    pub fn persist(&mut self, k: &[u8], now: Instant) -> bool {
        self.purge(k, now);
        match self.inner.get_mut(k) {
            Some(v) if v.expires_at.is_some() => {
                v.persist();
                true
            }
            _ => false,
        }
    }

    pub fn kind(&mut self, k: &[u8], now: Instant) -> Option<Kind> {
        self.get_value(k, now).map(Value::kind)
    }

    //
    // Lists
    //

    /// LPUSH: each value goes to the front in turn, so the final order is
    /// the reverse of the arguments
    pub fn lpush(&mut self, k: &Bytes, values: &[Bytes], now: Instant) -> StoreResult<usize> {
        let list = self.collection_or_create(k, now, Value::list, as_list)?;
        for v in values {
            list.push_front(v.clone());
        }
        Ok(list.len())
    }

    pub fn rpush(&mut self, k: &Bytes, values: &[Bytes], now: Instant) -> StoreResult<usize> {
        let list = self.collection_or_create(k, now, Value::list, as_list)?;
        list.extend(values.iter().cloned());
        Ok(list.len())
    }

    pub fn lpop(&mut self, k: &[u8], now: Instant) -> StoreResult<Option<Bytes>> {
        let popped = match self.collection_mut(k, now, as_list)? {
            None => return Ok(None),
            Some(list) => list.pop_front(),
        };
        self.drop_if_empty(k);
        Ok(popped)
    }

    pub fn rpop(&mut self, k: &[u8], now: Instant) -> StoreResult<Option<Bytes>> {
        let popped = match self.collection_mut(k, now, as_list)? {
            None => return Ok(None),
            Some(list) => list.pop_back(),
        };
        self.drop_if_empty(k);
        Ok(popped)
    }

    pub fn llen(&mut self, k: &[u8], now: Instant) -> StoreResult<usize> {
        Ok(self.collection_mut(k, now, as_list)?.map_or(0, |l| l.len()))
    }

    /// LRANGE: out-of-range bounds yield an empty result, never an error
    pub fn lrange(&mut self, k: &[u8], start: i64, stop: i64, now: Instant) -> StoreResult<Vec<Bytes>> {
        let list = match self.collection_mut(k, now, as_list)? {
            None => return Ok(Vec::new()),
            Some(l) => l,
        };
        Ok(match clamp_range(start, stop, list.len()) {
            Some((a, b)) => list.range(a..=b).cloned().collect(),
            None => Vec::new(),
        })
    }

    pub fn lindex(&mut self, k: &[u8], idx: i64, now: Instant) -> StoreResult<Option<Bytes>> {
        let list = match self.collection_mut(k, now, as_list)? {
            None => return Ok(None),
            Some(l) => l,
        };
        Ok(resolve_index(idx, list.len()).and_then(|i| list.get(i).cloned()))
    }

    /// LSET: `NoSuchKey` for an absent key, `IndexOutOfRange` past either end
    pub fn lset(&mut self, k: &[u8], idx: i64, v: Bytes, now: Instant) -> StoreResult<()> {
        let list = self.collection_mut(k, now, as_list)?.ok_or(StoreError::NoSuchKey)?;
        let i = resolve_index(idx, list.len()).ok_or(StoreError::IndexOutOfRange)?;
        list[i] = v;
        Ok(())
    }

    //
    // Sets
    //

    /// SADD: returns the members that were not already present
    pub fn sadd(&mut self, k: &Bytes, members: &[Bytes], now: Instant) -> StoreResult<Vec<Bytes>> {
        let set = self.collection_or_create(k, now, Value::set, as_set)?;
        Ok(members.iter().filter(|m| set.insert((*m).clone())).cloned().collect())
    }

    /// SREM: returns the members actually removed
    pub fn srem(&mut self, k: &[u8], members: &[Bytes], now: Instant) -> StoreResult<Vec<Bytes>> {
        let removed = match self.collection_mut(k, now, as_set)? {
            None => return Ok(Vec::new()),
            Some(set) => members.iter().filter(|m| set.remove(*m)).cloned().collect(),
        };
        self.drop_if_empty(k);
        Ok(removed)
    }

    pub fn smembers(&mut self, k: &[u8], now: Instant) -> StoreResult<Vec<Bytes>> {
        Ok(self
            .collection_mut(k, now, as_set)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn sismember(&mut self, k: &[u8], m: &[u8], now: Instant) -> StoreResult<bool> {
        Ok(self.collection_mut(k, now, as_set)?.map_or(false, |s| s.contains(m)))
    }

    pub fn scard(&mut self, k: &[u8], now: Instant) -> StoreResult<usize> {
        Ok(self.collection_mut(k, now, as_set)?.map_or(0, |s| s.len()))
    }

    //
    // Hashes
    //

    /// HSET: true if the field is new, false if it was overwritten
    pub fn hset(&mut self, k: &Bytes, field: Bytes, v: Bytes, now: Instant) -> StoreResult<bool> {
        let hash = self.collection_or_create(k, now, Value::hash, as_hash)?;
        Ok(hash.insert(field, v).is_none())
    }

    pub fn hget(&mut self, k: &[u8], field: &[u8], now: Instant) -> StoreResult<Option<Bytes>> {
        Ok(self.collection_mut(k, now, as_hash)?.and_then(|h| h.get(field).cloned()))
    }

    /// HDEL: returns the fields actually removed
    pub fn hdel(&mut self, k: &[u8], fields: &[Bytes], now: Instant) -> StoreResult<Vec<Bytes>> {
        let removed = match self.collection_mut(k, now, as_hash)? {
            None => return Ok(Vec::new()),
            Some(hash) => fields.iter().filter(|f| hash.remove(*f).is_some()).cloned().collect(),
        };
        self.drop_if_empty(k);
        Ok(removed)
    }

    pub fn hgetall(&mut self, k: &[u8], now: Instant) -> StoreResult<Vec<(Bytes, Bytes)>> {
        Ok(self
            .collection_mut(k, now, as_hash)?
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    pub fn hkeys(&mut self, k: &[u8], now: Instant) -> StoreResult<Vec<Bytes>> {
        Ok(self
            .collection_mut(k, now, as_hash)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    pub fn hvals(&mut self, k: &[u8], now: Instant) -> StoreResult<Vec<Bytes>> {
        Ok(self
            .collection_mut(k, now, as_hash)?
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default())
    }

    pub fn hlen(&mut self, k: &[u8], now: Instant) -> StoreResult<usize> {
        Ok(self.collection_mut(k, now, as_hash)?.map_or(0, |h| h.len()))
    }

    pub fn hexists(&mut self, k: &[u8], field: &[u8], now: Instant) -> StoreResult<bool> {
        Ok(self.collection_mut(k, now, as_hash)?.map_or(false, |h| h.contains_key(field)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn clamp_range_resolves_negative_and_clamps() {
        assert_eq!(clamp_range(-1, -1, 5), Some((4, 4)));
        assert_eq!(clamp_range(0, -1, 5), Some((0, 4)));
        assert_eq!(clamp_range(-100, 100, 5), Some((0, 4)));
        assert_eq!(clamp_range(3, 1, 5), None);
        assert_eq!(clamp_range(7, 9, 5), None);
        assert_eq!(clamp_range(0, -1, 0), None);
        assert_eq!(clamp_range(i64::MIN, i64::MAX, 3), Some((0, 2)));
    }

    #[test]
    fn getrange_boundaries() {
        let now = Instant::now();
        let mut d = Dict::default();
        d.set(b("k"), b"hello");
        assert_eq!(d.getrange(b"k", -1, -1, now).unwrap(), b("o"));
        assert_eq!(d.getrange(b"k", 0, -1, now).unwrap(), b("hello"));
        assert_eq!(d.getrange(b"k", 2, 1, now).unwrap(), Bytes::new());
        assert_eq!(d.getrange(b"missing", 0, -1, now).unwrap(), Bytes::new());
    }

    #[test]
    fn setrange_pads_absent_key_with_nuls() {
        let now = Instant::now();
        let mut d = Dict::default();
        assert_eq!(d.setrange(&b("k"), 5, b"hi", now).unwrap(), 7);
        assert_eq!(d.get(b"k", now).unwrap().unwrap(), Bytes::from_static(b"\0\0\0\0\0hi"));

        d.set(b("s"), b"Hello World");
        assert_eq!(d.setrange(&b("s"), 6, b"Redis", now).unwrap(), 11);
        assert_eq!(d.get(b"s", now).unwrap().unwrap(), b("Hello Redis"));
    }

    #[test]
    fn incr_creates_promotes_and_guards_overflow() {
        let now = Instant::now();
        let mut d = Dict::default();
        assert_eq!(d.incr_by(&b("n"), 1, now), Ok(1));
        assert_eq!(d.incr_by(&b("n"), -1, now), Ok(0));
        assert_eq!(d.incr_by(&b("m"), -7, now), Ok(-7));

        d.set(b("s"), b"41");
        assert_eq!(d.incr_by(&b("s"), 1, now), Ok(42));
        assert_eq!(d.kind(b"s", now), Some(Kind::Integer));

        d.set(b("word"), b"hello");
        assert_eq!(d.incr_by(&b("word"), 1, now), Err(StoreError::WrongType));
        d.set(b("padded"), b"007");
        assert_eq!(d.incr_by(&b("padded"), 1, now), Err(StoreError::WrongType));

        d.insert(b("max"), Value::integer(i64::MAX));
        assert_eq!(d.incr_by(&b("max"), 1, now), Err(StoreError::Overflow));
        assert_eq!(d.get(b"max", now).unwrap().unwrap(), Bytes::from(i64::MAX.to_string()));
    }

    #[test]
    fn incr_keeps_expiration() {
        let now = Instant::now();
        let mut d = Dict::default();
        d.incr_by(&b("n"), 5, now).unwrap();
        d.expire(b"n", 100, now);
        d.incr_by(&b("n"), 1, now).unwrap();
        assert_eq!(d.ttl(b"n", now), 100);
    }

    #[test]
    fn set_resets_ttl() {
        let now = Instant::now();
        let mut d = Dict::default();
        d.set(b("k"), b"v");
        assert!(d.expire(b"k", 50, now));
        d.set(b("k"), b"w");
        assert_eq!(d.ttl(b"k", now), -1);
    }

    #[test]
    fn expired_keys_are_absent_on_access() {
        let now = Instant::now();
        let later = now + Duration::from_secs(3);
        let mut d = Dict::default();
        d.set(b("k"), b"v");
        d.expire(b"k", 2, now);
        assert_eq!(d.ttl(b"k", now), 2);
        assert_eq!(d.get(b"k", later).unwrap(), None);
        assert_eq!(d.ttl(b"k", later), -2);
        assert!(!d.del(b"k", later));
        assert_eq!(d.len(later), 0);
    }

    #[test]
    fn expired_key_is_recreated_with_new_kind() {
        let now = Instant::now();
        let later = now + Duration::from_secs(2);
        let mut d = Dict::default();
        d.set(b("k"), b"v");
        d.expire(b"k", 1, now);
        assert_eq!(d.lpush(&b("k"), &[b("x")], later), Ok(1));
        assert_eq!(d.kind(b"k", later), Some(Kind::List));
    }

    #[test]
    fn persist_only_reports_success_when_ttl_existed() {
        let now = Instant::now();
        let mut d = Dict::default();
        assert!(!d.persist(b"none", now));
        d.set(b("k"), b"v");
        assert!(!d.persist(b"k", now));
        d.expire(b"k", 10, now);
        assert!(d.persist(b"k", now));
        assert_eq!(d.ttl(b"k", now), -1);
    }

    #[test]
    fn wrong_type_leaves_value_untouched() {
        let now = Instant::now();
        let mut d = Dict::default();
        d.set(b("a"), b"hello");
        assert_eq!(d.lpush(&b("a"), &[b("x")], now), Err(StoreError::WrongType));
        assert_eq!(d.sadd(&b("a"), &[b("x")], now), Err(StoreError::WrongType));
        assert_eq!(d.hset(&b("a"), b("f"), b("v"), now), Err(StoreError::WrongType));
        assert_eq!(d.get(b"a", now).unwrap().unwrap(), b("hello"));

        d.rpush(&b("l"), &[b("x")], now).unwrap();
        assert_eq!(d.get(b"l", now), Err(StoreError::WrongType));
        assert_eq!(d.append(&b("l"), b"x", now), Err(StoreError::WrongType));
        assert_eq!(d.strlen(b"l", now), Err(StoreError::WrongType));
    }

    #[test]
    fn list_push_pop_and_index() {
        let now = Instant::now();
        let mut d = Dict::default();
        assert_eq!(d.lpush(&b("l"), &[b("x"), b("y")], now), Ok(2));
        assert_eq!(d.lrange(b"l", 0, -1, now).unwrap(), vec![b("y"), b("x")]);
        assert_eq!(d.rpush(&b("l"), &[b("z")], now), Ok(3));
        assert_eq!(d.lindex(b"l", -1, now).unwrap(), Some(b("z")));
        assert_eq!(d.lindex(b"l", 5, now).unwrap(), None);
        assert_eq!(d.lrange(b"l", 5, 10, now).unwrap(), Vec::<Bytes>::new());

        assert_eq!(d.lset(b"l", 1, b("q"), now), Ok(()));
        assert_eq!(d.lset(b"l", 3, b("q"), now), Err(StoreError::IndexOutOfRange));
        assert_eq!(d.lset(b"nope", 0, b("q"), now), Err(StoreError::NoSuchKey));

        assert_eq!(d.lpop(b"l", now).unwrap(), Some(b("y")));
        assert_eq!(d.rpop(b"l", now).unwrap(), Some(b("z")));
        assert_eq!(d.rpop(b"l", now).unwrap(), Some(b("q")));
        assert!(!d.exists(b"l", now));
        assert_eq!(d.lpop(b"l", now).unwrap(), None);
    }

    #[test]
    fn set_members_and_removal_drops_key() {
        let now = Instant::now();
        let mut d = Dict::default();
        assert_eq!(d.sadd(&b("s"), &[b("m1"), b("m1"), b("m2")], now).unwrap().len(), 2);
        assert_eq!(d.scard(b"s", now), Ok(2));
        assert_eq!(d.sismember(b"s", b"m1", now), Ok(true));
        let mut members = d.smembers(b"s", now).unwrap();
        members.sort();
        assert_eq!(members, vec![b("m1"), b("m2")]);
        assert_eq!(d.srem(b"s", &[b("m1"), b("zz")], now).unwrap(), vec![b("m1")]);
        assert_eq!(d.srem(b"s", &[b("m2")], now).unwrap().len(), 1);
        assert!(!d.exists(b"s", now));
    }

    #[test]
    fn hash_fields() {
        let now = Instant::now();
        let mut d = Dict::default();
        assert_eq!(d.hset(&b("h"), b("f"), b("v"), now), Ok(true));
        assert_eq!(d.hset(&b("h"), b("f"), b("v2"), now), Ok(false));
        assert_eq!(d.hget(b"h", b"f", now).unwrap(), Some(b("v2")));
        assert_eq!(d.hlen(b"h", now), Ok(1));
        assert_eq!(d.hexists(b"h", b"g", now), Ok(false));
        assert_eq!(d.hgetall(b"h", now).unwrap(), vec![(b("f"), b("v2"))]);
        assert_eq!(d.hdel(b"h", &[b("f")], now).unwrap(), vec![b("f")]);
        assert!(!d.exists(b"h", now));
    }

    #[test]
    fn mget_renders_only_strings_and_integers() {
        let now = Instant::now();
        let mut d = Dict::default();
        d.set(b("a"), b"1x");
        d.incr_by(&b("n"), 3, now).unwrap();
        d.rpush(&b("l"), &[b("x")], now).unwrap();
        let got = d.mget(&[b("a"), b("n"), b("l"), b("missing")], now);
        assert_eq!(got, vec![Some(b("1x")), Some(b("3")), None, None]);
    }
}
