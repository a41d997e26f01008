/*!
 * Append-Only File (AOF) Persistence
 *
 * Every successful mutation is appended to the log as a RESP array of
 * bulk strings, so values containing spaces, newlines or arbitrary bytes
 * replay exactly. On startup the log is decoded with the same parser as
 * wire input; legacy plain-text lines therefore replay too.
 *
 * Two fsync policies are supported:
 * * `always` - every append is written, flushed and synced before the
 *   command's reply is produced
 * * `everysec` - appends are handed to a background writer thread that
 *   syncs once per second
 */

use crate::error::PersistError;
use crate::protocol::parse_one;
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::channel::{bounded, unbounded, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// When appended records reach stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// Sync before every reply
    #[default]
    Always,
    /// Background thread syncs once per second
    Everysec,
}

/// Messages for the background writer thread
enum AofOp {
    Write(Vec<u8>),
    Truncate(Sender<io::Result<()>>),
    Sync(Sender<io::Result<()>>),
    Close,
}

enum Sink {
    Direct(File),
    Background {
        tx: Sender<AofOp>,
        handle: Option<JoinHandle<()>>,
    },
}

/// Handle for the append-only log
pub struct Aof {
    path: PathBuf,
    sink: Sink,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Aof {
    /// Open (or create) the log at `path` in append mode
    ///
    /// # Arguments
    /// * `path` - File path for the AOF file
    /// * `policy` - fsync policy; `Everysec` spawns the writer thread
    pub fn open(path: impl AsRef<Path>, policy: FsyncPolicy) -> io::Result<Aof> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        let sink = match policy {
            FsyncPolicy::Always => Sink::Direct(file),
            FsyncPolicy::Everysec => {
                let (tx, handle) = spawn_writer(file)?;
                Sink::Background { tx, handle: Some(handle) }
            }
        };
        debug!("opened append log {} ({:?})", path.display(), policy);
        Ok(Aof { path, sink })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one encoded record
    pub fn append(&mut self, record: &[u8]) -> io::Result<()> {
        match &mut self.sink {
            Sink::Direct(f) => {
                f.write_all(record)?;
                f.flush()?;
                f.sync_data()
            }
            Sink::Background { tx, .. } => tx
                .send(AofOp::Write(record.to_vec()))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "aof writer has stopped")),
        }
    }

    /// Discard the log contents; later appends start a fresh log
    pub fn truncate(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Direct(f) => {
                f.set_len(0)?;
                f.sync_all()
            }
            Sink::Background { tx, .. } => round_trip(tx, AofOp::Truncate),
        }
    }

    /// Force everything appended so far to stable storage
    pub fn sync(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Direct(f) => f.sync_data(),
            Sink::Background { tx, .. } => round_trip(tx, AofOp::Sync),
        }
    }
}

impl Drop for Aof {
    fn drop(&mut self) {
        if let Sink::Background { tx, handle } = &mut self.sink {
            let _ = tx.send(AofOp::Close);
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
    }
}

/// Send a request to the writer thread and wait for its answer
fn round_trip(tx: &Sender<AofOp>, op: fn(Sender<io::Result<()>>) -> AofOp) -> io::Result<()> {
    let (done_tx, done_rx) = bounded(1);
    let stopped = || io::Error::new(io::ErrorKind::BrokenPipe, "aof writer has stopped");
    tx.send(op(done_tx)).map_err(|_| stopped())?;
    done_rx.recv().map_err(|_| stopped())?
}

/// Spawn the background writer used by the `everysec` policy
///
/// Records are written as they arrive; the file is flushed and synced
/// when at least one second has passed since the last sync, and also
/// while idle so nothing sits unsynced for long.
fn spawn_writer(mut f: File) -> io::Result<(Sender<AofOp>, JoinHandle<()>)> {
    let (tx, rx) = unbounded::<AofOp>();
    let handle = std::thread::Builder::new()
        .name("aof-writer".into())
        .spawn(move || {
            let mut last = Instant::now();
            let mut dirty = false;
            loop {
                match rx.recv_timeout(Duration::from_millis(1000)) {
                    Ok(AofOp::Write(buf)) => {
                        if let Err(e) = f.write_all(&buf) {
                            error!("aof write failed: {}", e);
                        }
                        dirty = true;
                    }
                    Ok(AofOp::Truncate(done)) => {
                        let _ = done.send(f.set_len(0).and_then(|_| f.sync_all()));
                        dirty = false;
                        last = Instant::now();
                    }
                    Ok(AofOp::Sync(done)) => {
                        let _ = done.send(f.flush().and_then(|_| f.sync_data()));
                        dirty = false;
                        last = Instant::now();
                    }
                    Ok(AofOp::Close) | Err(RecvTimeoutError::Disconnected) => {
                        let _ = f.flush();
                        let _ = f.sync_data();
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }

                if dirty && last.elapsed() >= Duration::from_millis(1000) {
                    let _ = f.flush();
                    if let Err(e) = f.sync_data() {
                        error!("aof fsync failed: {}", e);
                    }
                    dirty = false;
                    last = Instant::now();
                }
            }
        })?;
    Ok((tx, handle))
}

/// Encode one log record as a RESP array of bulk strings
///
/// Format: *<n>\r\n$<len>\r\n<arg>\r\n... - binary safe, unlike space
/// separated text.
pub fn emit(args: &[&[u8]]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.put_u8(b'*');
    out.put_slice(args.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    for a in args {
        out.put_u8(b'$');
        out.put_slice(a.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(a);
        out.put_slice(b"\r\n");
    }
    out.to_vec()
}

/// Read every complete record from the log at `path`
///
/// A missing file yields no records. A truncated final record, as left by
/// a crash mid-append, is dropped with a warning. A record that cannot be
/// decoded stops reading; the records before it are still returned.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<Vec<Bytes>>, PersistError> {
    let path = path.as_ref();
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_end(&mut data)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    let mut records = Vec::new();
    let mut cursor = 0;
    while cursor < data.len() {
        match parse_one(&data[cursor..]) {
            Ok(Some((consumed, args))) => {
                cursor += consumed;
                if !args.is_empty() {
                    records.push(args);
                }
            }
            Ok(None) => {
                warn!(
                    "ignoring truncated record at byte {} of {}",
                    cursor,
                    path.display()
                );
                break;
            }
            Err(e) => {
                warn!(
                    "stopping replay at byte {} of {}: {}",
                    cursor,
                    path.display(),
                    e
                );
                break;
            }
        }
    }
    info!("read {} records from {}", records.len(), path.display());
    Ok(records)
}
