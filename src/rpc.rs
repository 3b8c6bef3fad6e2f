//! Framed TCP front door.
//!
//! Each connection is a sequence of request/response pairs. A frame is a
//! `u32` network-order length followed by exactly that many body bytes; the
//! body is the wire encoding of a command (inbound) or response (outbound).
//! Frames above 100 MiB close the connection. Exactly one response is sent
//! per request, in order.
//!
//! Write commands dispatch into the submit path; read commands are served
//! from the local store. A command that fails to decode is answered with a
//! SerializationError response and the connection is closed.

use crate::command::{self, Command, Response, MAX_MESSAGE_SIZE};
use crate::error::{FsError, Result};
use crate::service::FsService;
use crate::shutdown::ShutdownCoordinator;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Coarse per-operation socket timeout.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Bind the front-door listener with SO_REUSEADDR.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

/// Accept loop: one task per connection, until shutdown.
pub async fn run_rpc_server(
    listener: TcpListener,
    service: FsService,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "front door listening");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        debug!(peer = %peer, "connection accepted");
                        let service = service.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            handle_connection(stream, peer, service, shutdown).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }

    drop(listener);
    info!(addr = %local_addr, "front door stopping, draining connections");
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: FsService,
    shutdown: ShutdownCoordinator,
) {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let body = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(body)) => body,
                Ok(None) => break, // peer closed
                Err(e) => {
                    debug!(peer = %peer, error = %e, "closing connection");
                    break;
                }
            }
        };

        metrics::counter!("replifs_rpc_requests_total").increment(1);

        let cmd: Command = match command::decode_wire(&body) {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(peer = %peer, error = %e, "undecodable command");
                let response = Response::from(&e);
                let _ = write_response(&mut writer, &response).await;
                break;
            }
        };

        debug!(peer = %peer, kind = ?cmd.kind(), path = cmd.path(), "request");
        let response = service.execute(cmd).await;

        if let Err(e) = write_response(&mut writer, &response).await {
            debug!(peer = %peer, error = %e, "response write failed");
            break;
        }
    }

    debug!(peer = %peer, "connection closed");
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed before
/// a new frame began.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FsError::Network(e.to_string())),
    };

    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(FsError::Network(format!("invalid frame length: {}", len)));
    }

    let mut body = vec![0u8; len as usize];
    timeout(SOCKET_TIMEOUT, reader.read_exact(&mut body))
        .await
        .map_err(|_| FsError::Timeout("frame body read timed out".into()))?
        .map_err(|e| FsError::Network(e.to_string()))?;

    Ok(Some(body))
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let body = command::encode_wire(response)?;
    timeout(SOCKET_TIMEOUT, async {
        writer.write_u32(body.len() as u32).await?;
        writer.write_all(&body).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| FsError::Timeout("response write timed out".into()))?
    .map_err(|e| FsError::Network(e.to_string()))?;
    Ok(())
}
