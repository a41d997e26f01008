/*!
 * Command Model
 *
 * Turns a decoded argument vector into a validated `Cmd`. Arity and
 * numeric arguments are checked here, so a malformed request is rejected
 * before the store is touched.
 */

use crate::error::ArgError;
use bytes::Bytes;

/// Commands supported by tinyredis
///
/// Keys, values, fields and members are kept as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Cmd {
    Ping(Option<Bytes>),
    Echo(Bytes),

    Get(Bytes),
    Set(Bytes, Bytes),
    Del(Vec<Bytes>),
    Exists(Vec<Bytes>),
    /// INCR, DECR, INCRBY and DECRBY; `name` is the command as received so
    /// the log records exactly what was applied
    IncrBy { name: &'static str, key: Bytes, delta: i64 },
    Append(Bytes, Bytes),
    Strlen(Bytes),
    MGet(Vec<Bytes>),
    MSet(Vec<(Bytes, Bytes)>),
    GetRange(Bytes, i64, i64),
    SetRange(Bytes, usize, Bytes),

    Expire(Bytes, i64),
    /// Absolute deadline in unix milliseconds
    PExpireAt(Bytes, i64),
    Ttl(Bytes),
    Persist(Bytes),
    Type(Bytes),

    LPush(Bytes, Vec<Bytes>),
    RPush(Bytes, Vec<Bytes>),
    LPop(Bytes),
    RPop(Bytes),
    LLen(Bytes),
    LRange(Bytes, i64, i64),
    LIndex(Bytes, i64),
    LSet(Bytes, i64, Bytes),

    SAdd(Bytes, Vec<Bytes>),
    SRem(Bytes, Vec<Bytes>),
    SMembers(Bytes),
    SIsMember(Bytes, Bytes),
    SCard(Bytes),

    HSet(Bytes, Bytes, Bytes),
    HGet(Bytes, Bytes),
    HDel(Bytes, Vec<Bytes>),
    HGetAll(Bytes),
    HKeys(Bytes),
    HVals(Bytes),
    HLen(Bytes),
    HExists(Bytes, Bytes),

    DbSize,
    Save,
    Shutdown,
}

/// Arity rule: exactly `n` arguments, or at least `n` (command name included)
enum Arity {
    Exact(usize),
    AtLeast(usize),
}

fn check(name: &str, args: &[Bytes], arity: Arity) -> Result<(), ArgError> {
    let ok = match arity {
        Arity::Exact(n) => args.len() == n,
        Arity::AtLeast(n) => args.len() >= n,
    };
    if ok {
        Ok(())
    } else {
        Err(ArgError::Arity(name.to_ascii_lowercase()))
    }
}

/// Parse a decimal i64 argument
pub fn parse_int(b: &[u8]) -> Result<i64, ArgError> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(ArgError::NotInteger)
}

impl Cmd {
    /// Validate an argument vector; the first element is the command name
    /// and is matched case-insensitively
    pub fn parse(args: Vec<Bytes>) -> Result<Cmd, ArgError> {
        let name = match args.first() {
            Some(n) => String::from_utf8_lossy(n).to_ascii_uppercase(),
            None => return Err(ArgError::UnknownCommand(String::new())),
        };
        let a = &args;
        let n = name.as_str();

        let cmd = match n {
            "PING" => {
                check(n, a, Arity::AtLeast(1))?;
                if a.len() > 2 {
                    return Err(ArgError::Arity("ping".into()));
                }
                Cmd::Ping(a.get(1).cloned())
            }
            "ECHO" => {
                check(n, a, Arity::Exact(2))?;
                Cmd::Echo(a[1].clone())
            }

            "GET" => single(n, a, Cmd::Get)?,
            "SET" => {
                check(n, a, Arity::Exact(3))?;
                Cmd::Set(a[1].clone(), a[2].clone())
            }
            "DEL" => {
                check(n, a, Arity::AtLeast(2))?;
                Cmd::Del(a[1..].to_vec())
            }
            "EXISTS" => {
                check(n, a, Arity::AtLeast(2))?;
                Cmd::Exists(a[1..].to_vec())
            }
            "INCR" | "DECR" => {
                check(n, a, Arity::Exact(2))?;
                let (name, delta) = if n == "INCR" { ("INCR", 1) } else { ("DECR", -1) };
                Cmd::IncrBy { name, key: a[1].clone(), delta }
            }
            "INCRBY" => {
                check(n, a, Arity::Exact(3))?;
                let delta = parse_int(&a[2])?;
                Cmd::IncrBy { name: "INCRBY", key: a[1].clone(), delta }
            }
            "DECRBY" => {
                check(n, a, Arity::Exact(3))?;
                let delta = parse_int(&a[2])?.checked_neg().ok_or(ArgError::NotInteger)?;
                Cmd::IncrBy { name: "DECRBY", key: a[1].clone(), delta }
            }
            "APPEND" => {
                check(n, a, Arity::Exact(3))?;
                Cmd::Append(a[1].clone(), a[2].clone())
            }
            "STRLEN" => single(n, a, Cmd::Strlen)?,
            "MGET" => {
                check(n, a, Arity::AtLeast(2))?;
                Cmd::MGet(a[1..].to_vec())
            }
            "MSET" => {
                check(n, a, Arity::AtLeast(3))?;
                if a.len() % 2 == 0 {
                    return Err(ArgError::Arity("mset".into()));
                }
                Cmd::MSet(a[1..].chunks(2).map(|p| (p[0].clone(), p[1].clone())).collect())
            }
            "GETRANGE" => {
                check(n, a, Arity::Exact(4))?;
                Cmd::GetRange(a[1].clone(), parse_int(&a[2])?, parse_int(&a[3])?)
            }
            "SETRANGE" => {
                check(n, a, Arity::Exact(4))?;
                let offset = usize::try_from(parse_int(&a[2])?).map_err(|_| ArgError::Offset)?;
                Cmd::SetRange(a[1].clone(), offset, a[3].clone())
            }

            "EXPIRE" => {
                check(n, a, Arity::Exact(3))?;
                Cmd::Expire(a[1].clone(), parse_int(&a[2])?)
            }
            "PEXPIREAT" => {
                check(n, a, Arity::Exact(3))?;
                Cmd::PExpireAt(a[1].clone(), parse_int(&a[2])?)
            }
            "TTL" => single(n, a, Cmd::Ttl)?,
            "PERSIST" => single(n, a, Cmd::Persist)?,
            "TYPE" => single(n, a, Cmd::Type)?,

            "LPUSH" => {
                check(n, a, Arity::AtLeast(3))?;
                Cmd::LPush(a[1].clone(), a[2..].to_vec())
            }
            "RPUSH" => {
                check(n, a, Arity::AtLeast(3))?;
                Cmd::RPush(a[1].clone(), a[2..].to_vec())
            }
            "LPOP" => single(n, a, Cmd::LPop)?,
            "RPOP" => single(n, a, Cmd::RPop)?,
            "LLEN" => single(n, a, Cmd::LLen)?,
            "LRANGE" => {
                check(n, a, Arity::Exact(4))?;
                Cmd::LRange(a[1].clone(), parse_int(&a[2])?, parse_int(&a[3])?)
            }
            "LINDEX" => {
                check(n, a, Arity::Exact(3))?;
                Cmd::LIndex(a[1].clone(), parse_int(&a[2])?)
            }
            "LSET" => {
                check(n, a, Arity::Exact(4))?;
                Cmd::LSet(a[1].clone(), parse_int(&a[2])?, a[3].clone())
            }

            "SADD" => {
                check(n, a, Arity::AtLeast(3))?;
                Cmd::SAdd(a[1].clone(), a[2..].to_vec())
            }
            "SREM" => {
                check(n, a, Arity::AtLeast(3))?;
                Cmd::SRem(a[1].clone(), a[2..].to_vec())
            }
            "SMEMBERS" => single(n, a, Cmd::SMembers)?,
            "SISMEMBER" => {
                check(n, a, Arity::Exact(3))?;
                Cmd::SIsMember(a[1].clone(), a[2].clone())
            }
            "SCARD" => single(n, a, Cmd::SCard)?,

            "HSET" => {
                check(n, a, Arity::Exact(4))?;
                Cmd::HSet(a[1].clone(), a[2].clone(), a[3].clone())
            }
            "HGET" => {
                check(n, a, Arity::Exact(3))?;
                Cmd::HGet(a[1].clone(), a[2].clone())
            }
            "HDEL" => {
                check(n, a, Arity::AtLeast(3))?;
                Cmd::HDel(a[1].clone(), a[2..].to_vec())
            }
            "HGETALL" => single(n, a, Cmd::HGetAll)?,
            "HKEYS" => single(n, a, Cmd::HKeys)?,
            "HVALS" => single(n, a, Cmd::HVals)?,
            "HLEN" => single(n, a, Cmd::HLen)?,
            "HEXISTS" => {
                check(n, a, Arity::Exact(3))?;
                Cmd::HExists(a[1].clone(), a[2].clone())
            }

            "DBSIZE" => {
                check(n, a, Arity::Exact(1))?;
                Cmd::DbSize
            }
            "SAVE" => {
                check(n, a, Arity::Exact(1))?;
                Cmd::Save
            }
            "SHUTDOWN" => Cmd::Shutdown,

            _ => return Err(ArgError::UnknownCommand(String::from_utf8_lossy(&a[0]).into_owned())),
        };
        Ok(cmd)
    }

    /// True for commands that may change the keyspace
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Cmd::Set(..)
                | Cmd::Del(_)
                | Cmd::IncrBy { .. }
                | Cmd::Append(..)
                | Cmd::MSet(_)
                | Cmd::SetRange(..)
                | Cmd::Expire(..)
                | Cmd::PExpireAt(..)
                | Cmd::Persist(_)
                | Cmd::LPush(..)
                | Cmd::RPush(..)
                | Cmd::LPop(_)
                | Cmd::RPop(_)
                | Cmd::LSet(..)
                | Cmd::SAdd(..)
                | Cmd::SRem(..)
                | Cmd::HSet(..)
                | Cmd::HDel(..)
        )
    }
}

/// Commands taking exactly one key
fn single(name: &str, a: &[Bytes], f: fn(Bytes) -> Cmd) -> Result<Cmd, ArgError> {
    check(name, a, Arity::Exact(2))?;
    Ok(f(a[1].clone()))
}
