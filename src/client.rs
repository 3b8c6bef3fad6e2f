//! Client library for the framed TCP protocol.
//!
//! One [`FsClient`] wraps one connection; requests are answered in order, so
//! a client can pipeline a sequence of calls over a single stream. Typed
//! methods convert error responses back into [`FsError`]; the raw
//! [`request`](FsClient::request) call exposes the full [`Response`] for
//! callers that need the redirect message on NotLeader.
//!
//! The client never retries: on NotLeader the caller picks the advertised
//! leader and reconnects.

use crate::command::{self, Command, Payload, Response, MAX_MESSAGE_SIZE};
use crate::error::{FsError, Result};
use crate::types::FileInfo;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default timeout for connect and per-request round trips.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one replifs node.
pub struct FsClient {
    stream: TcpStream,
    request_timeout: Duration,
}

impl FsClient {
    /// Connect to a node's front door.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = timeout(DEFAULT_REQUEST_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| FsError::Timeout(format!("connect to {} timed out", addr)))?
            .map_err(|e| FsError::Network(format!("connect to {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| FsError::Network(e.to_string()))?;
        Ok(Self {
            stream,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Send one command and await its response.
    pub async fn request(&mut self, cmd: &Command) -> Result<Response> {
        let body = command::encode_wire(cmd)?;
        if body.len() as u64 > MAX_MESSAGE_SIZE as u64 {
            return Err(FsError::Network(format!(
                "request of {} bytes exceeds frame limit",
                body.len()
            )));
        }

        timeout(self.request_timeout, async {
            self.stream.write_u32(body.len() as u32).await?;
            self.stream.write_all(&body).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| FsError::Timeout("request write timed out".into()))?
        .map_err(|e| FsError::Network(e.to_string()))?;

        let response_body = timeout(self.request_timeout, async {
            let len = self.stream.read_u32().await?;
            if len == 0 || len > MAX_MESSAGE_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid response frame length: {}", len),
                ));
            }
            let mut buf = vec![0u8; len as usize];
            self.stream.read_exact(&mut buf).await?;
            Ok(buf)
        })
        .await
        .map_err(|_| FsError::Timeout("response read timed out".into()))?
        .map_err(|e| FsError::Network(e.to_string()))?;

        command::decode_wire(&response_body)
    }

    async fn call(&mut self, cmd: Command) -> Result<Payload> {
        match self.request(&cmd).await? {
            Response::Ok(payload) => Ok(payload),
            Response::Error { status, message } => Err(FsError::from_status(status, message)),
        }
    }

    pub async fn create_file(&mut self, path: &str) -> Result<()> {
        self.call(Command::CreateFile { path: path.into() }).await?;
        Ok(())
    }

    pub async fn write_file(&mut self, path: &str, data: Vec<u8>) -> Result<()> {
        self.call(Command::WriteFile { path: path.into(), data }).await?;
        Ok(())
    }

    pub async fn append_file(&mut self, path: &str, data: Vec<u8>) -> Result<()> {
        self.call(Command::AppendFile { path: path.into(), data }).await?;
        Ok(())
    }

    pub async fn delete_file(&mut self, path: &str) -> Result<()> {
        self.call(Command::DeleteFile { path: path.into() }).await?;
        Ok(())
    }

    pub async fn create_directory(&mut self, path: &str) -> Result<()> {
        self.call(Command::CreateDir { path: path.into() }).await?;
        Ok(())
    }

    pub async fn delete_directory(&mut self, path: &str) -> Result<()> {
        self.call(Command::DeleteDir { path: path.into() }).await?;
        Ok(())
    }

    pub async fn rename(&mut self, path: &str, new_path: &str) -> Result<()> {
        self.call(Command::Rename {
            path: path.into(),
            new_path: new_path.into(),
        })
        .await?;
        Ok(())
    }

    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        match self.call(Command::ReadFile { path: path.into() }).await? {
            Payload::Data(data) => Ok(data),
            other => Err(unexpected_payload("data", &other)),
        }
    }

    pub async fn list_directory(&mut self, path: &str) -> Result<Vec<FileInfo>> {
        match self.call(Command::ListDir { path: path.into() }).await? {
            Payload::Entries(entries) => Ok(entries),
            other => Err(unexpected_payload("entries", &other)),
        }
    }

    pub async fn stat(&mut self, path: &str) -> Result<FileInfo> {
        match self.call(Command::Stat { path: path.into() }).await? {
            Payload::Info(info) => Ok(info),
            other => Err(unexpected_payload("file info", &other)),
        }
    }

    pub async fn exists(&mut self, path: &str) -> Result<bool> {
        match self.call(Command::Exists { path: path.into() }).await? {
            Payload::Flag(value) => Ok(value),
            other => Err(unexpected_payload("flag", &other)),
        }
    }
}

fn unexpected_payload(expected: &str, got: &Payload) -> FsError {
    FsError::Serialization(format!(
        "expected {} payload, got {:?}",
        expected,
        std::mem::discriminant(got)
    ))
}
