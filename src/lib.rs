// Core modules for the tinyredis key-value store
pub mod error; // StoreError / ArgError / PersistError / ConfigError
pub mod value; // Value + Data sum type, expiration
pub mod storage; // Dict: keyspace and typed command API
pub mod command; // Cmd enum + argument validation
pub mod protocol; // RESP / inline decoder + Reply encoder
pub mod aof; // append-only log writer and reader
pub mod snapshot; // JSON snapshot save / load
pub mod shard; // Shard::exec (locking, logging, checkpoints)
pub mod config; // CLI, config file and environment
pub mod net; // listener + per-connection loop

// Re-export the main entry points for easier access
pub use aof::{Aof, FsyncPolicy};
pub use command::Cmd;
pub use config::{Cli, Config, PersistenceConfig};
pub use error::{ArgError, ConfigError, PersistError, StoreError, StoreResult};
pub use protocol::{parse_many, parse_one, Reply};
pub use shard::Shard;
pub use storage::Dict;
pub use value::{Data, Kind, Value};
