/*!
 * Network Layer
 *
 * TCP listener and per-connection request loop. Every accepted client
 * gets its own thread; all of them share one `Arc<Shard>`, which
 * serializes command execution.
 */

use crate::command::Cmd;
use crate::error::StoreError;
use crate::protocol::{parse_many, write_error, Reply};
use crate::shard::Shard;
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use crossbeam::channel::Sender;
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

/// Size of read buffer for incoming data
const READ_BUF: usize = 4096;

/// Bind a TCP listener with SO_REUSEADDR and a deep accept backlog
pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("cannot bind {}", addr))?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Accept connections forever, one thread per client
///
/// # Arguments
/// * `listener` - bound listener, see [`bind`]
/// * `shard` - shared execution unit
/// * `shutdown` - signalled once a client's `SHUTDOWN` has saved the data
pub fn serve(listener: TcpListener, shard: Arc<Shard>, shutdown: Sender<()>) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    for conn in listener.incoming() {
        let stream = match conn {
            Ok(s) => s,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
        debug!("accepted connection from {}", peer);

        let shard = shard.clone();
        let shutdown = shutdown.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("conn-{}", peer))
            .spawn(move || {
                if let Err(e) = handle_client(stream, &shard, &shutdown) {
                    debug!("connection {} closed with error: {}", peer, e);
                } else {
                    debug!("connection {} closed", peer);
                }
            });
        if let Err(e) = spawned {
            error!("cannot spawn connection thread: {}", e);
        }
    }
    Ok(())
}

/// Request loop for one client
///
/// Reads are appended to a buffer; every complete request in it is
/// executed in order and the replies are written back in one batch. A
/// framing error gets an error reply and closes the connection.
fn handle_client(mut sock: TcpStream, shard: &Shard, shutdown: &Sender<()>) -> Result<()> {
    sock.set_nodelay(true).ok();
    let mut rbuf = BytesMut::with_capacity(READ_BUF);
    let mut wbuf = BytesMut::new();
    let mut reqs: Vec<Vec<Bytes>> = Vec::with_capacity(32);
    let mut tmp_buf = [0u8; READ_BUF];

    loop {
        let n = match sock.read(&mut tmp_buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        rbuf.extend_from_slice(&tmp_buf[..n]);

        let framing = parse_many(&mut rbuf, &mut reqs);
        let mut closing = false;
        for args in reqs.drain(..) {
            match Cmd::parse(args) {
                Ok(Cmd::Shutdown) => {
                    let reply = shard.exec(Cmd::Shutdown);
                    if reply.is_error() {
                        reply.encode(&mut wbuf);
                    } else {
                        info!("shutdown requested by client");
                        let _ = shutdown.send(());
                        closing = true;
                        break;
                    }
                }
                Ok(cmd) => shard.exec_into(cmd, &mut wbuf),
                Err(e) => Reply::from(StoreError::from(e)).encode(&mut wbuf),
            }
        }
        if let Err(e) = framing {
            if !closing {
                write_error(&format!("ERR Protocol error: {}", e), &mut wbuf);
            }
            closing = true;
        }

        if !wbuf.is_empty() {
            sock.write_all(&wbuf)?;
            wbuf.clear();
        }
        if closing {
            return Ok(());
        }
    }
}
