/*!
 * Value Model
 *
 * A stored value is one payload variant plus an optional absolute
 * expiration instant. The kind is derived from the payload, so the two
 * can never disagree.
 */

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::BuildHasherDefault;
use std::time::{Duration, Instant};

pub(crate) type AHash = BuildHasherDefault<ahash::AHasher>;

/// Members of a set payload
pub type SetData = HashSet<Bytes, AHash>;
/// Field map of a hash payload
pub type HashData = HashMap<Bytes, Bytes, AHash>;

/// Expirations are clamped to this many seconds in either direction.
pub const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 3600;

/// Payload of a stored value
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// Byte string, mutated in place by APPEND / SETRANGE
    Str(Vec<u8>),
    /// 64-bit signed integer
    Int(i64),
    /// Double-ended list
    List(VecDeque<Bytes>),
    /// Unordered unique members
    Set(SetData),
    /// Field -> value map
    Hash(HashData),
}

/// Kind reported by TYPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Integer,
    List,
    Set,
    Hash,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::String => "string",
            Kind::Integer => "integer",
            Kind::List => "list",
            Kind::Set => "set",
            Kind::Hash => "hash",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub data: Data,
    pub expires_at: Option<Instant>,
}

impl Value {
    pub fn new(data: Data) -> Self {
        Self { data, expires_at: None }
    }

    pub fn string(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Data::Str(bytes.into()))
    }

    pub fn integer(i: i64) -> Self {
        Self::new(Data::Int(i))
    }

    pub fn list() -> Self {
        Self::new(Data::List(VecDeque::new()))
    }

    pub fn set() -> Self {
        Self::new(Data::Set(SetData::default()))
    }

    pub fn hash() -> Self {
        Self::new(Data::Hash(HashData::default()))
    }

    pub fn kind(&self) -> Kind {
        match self.data {
            Data::Str(_) => Kind::String,
            Data::Int(_) => Kind::Integer,
            Data::List(_) => Kind::List,
            Data::Set(_) => Kind::Set,
            Data::Hash(_) => Kind::Hash,
        }
    }

    /// True once `now` has reached the expiration instant
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    /// Expire `seconds` after `now`. Zero or negative values are taken
    /// literally and make the value expire immediately.
    pub fn set_expiration(&mut self, seconds: i64, now: Instant) {
        self.expires_at = Some(deadline_after(now, seconds.saturating_mul(1000)));
    }

    pub fn persist(&mut self) {
        self.expires_at = None;
    }

    /// Remaining lifetime in whole seconds (floor)
    ///
    /// # Returns
    /// * `-1` if no expiration is set
    /// * `-2` if the value has already expired
    pub fn remaining_ttl(&self, now: Instant) -> i64 {
        match self.expires_at {
            None => -1,
            Some(at) if now >= at => -2,
            Some(at) => (at - now).as_secs() as i64,
        }
    }

    /// Remaining lifetime in milliseconds, `None` without expiration
    pub fn remaining_ms(&self, now: Instant) -> Option<u64> {
        self.expires_at
            .map(|at| at.saturating_duration_since(now).as_millis() as u64)
    }

    /// Collections with no elements must not stay in the keyspace
    pub fn is_empty_collection(&self) -> bool {
        match &self.data {
            Data::List(l) => l.is_empty(),
            Data::Set(s) => s.is_empty(),
            Data::Hash(h) => h.is_empty(),
            Data::Str(_) | Data::Int(_) => false,
        }
    }

    /// String and integer values rendered as bytes, `None` for collections
    pub fn as_bytes(&self) -> Option<Bytes> {
        match &self.data {
            Data::Str(s) => Some(Bytes::copy_from_slice(s)),
            Data::Int(i) => Some(Bytes::from(i.to_string())),
            _ => None,
        }
    }
}

/// Instant `ms` milliseconds away from `now`, clamped to `MAX_TTL_SECS`.
///
/// Instants before the monotonic clock origin cannot be represented, so
/// deadlines in the past fall back to `now`, which is already expired.
pub fn deadline_after(now: Instant, ms: i64) -> Instant {
    let ms = ms.clamp(-MAX_TTL_SECS * 1000, MAX_TTL_SECS * 1000);
    if ms >= 0 {
        now + Duration::from_millis(ms as u64)
    } else {
        now.checked_sub(Duration::from_millis(ms.unsigned_abs()))
            .unwrap_or(now)
    }
}
