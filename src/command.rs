//! Commands, responses, and their two codecs.
//!
//! Two encodings coexist and never mix on a link:
//!
//! - The **log encoding** is the durability contract inside the Raft log:
//!   `kind:u8 | path_len:u32 LE | path | payload_len:u32 LE | payload`.
//!   A Rename carries its destination path as the payload. Decoding is
//!   strict: short buffers, trailing bytes, and unknown kinds all fail.
//! - The **wire encoding** (client connections) is a bincode-tagged record,
//!   framed by the transport with a `u32` network-order length prefix. Here
//!   Rename is a structured two-path variant.

use crate::error::{FsError, Result, Status};
use crate::types::FileInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Maximum framed message size on the wire (100 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

/// Command kind tags. The numbering of the write kinds (1..=7) is fixed by
/// the log format and must never change; read kinds extend the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandKind {
    CreateFile = 1,
    WriteFile = 2,
    AppendFile = 3,
    DeleteFile = 4,
    CreateDir = 5,
    DeleteDir = 6,
    Rename = 7,
    ReadFile = 8,
    ListDir = 9,
    Stat = 10,
    Exists = 11,
}

impl CommandKind {
    /// Write kinds must traverse the Raft log; read kinds must not.
    pub fn is_write(&self) -> bool {
        (*self as u8) <= CommandKind::Rename as u8
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CommandKind::CreateFile),
            2 => Some(CommandKind::WriteFile),
            3 => Some(CommandKind::AppendFile),
            4 => Some(CommandKind::DeleteFile),
            5 => Some(CommandKind::CreateDir),
            6 => Some(CommandKind::DeleteDir),
            7 => Some(CommandKind::Rename),
            8 => Some(CommandKind::ReadFile),
            9 => Some(CommandKind::ListDir),
            10 => Some(CommandKind::Stat),
            11 => Some(CommandKind::Exists),
            _ => None,
        }
    }
}

/// A client command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    CreateFile {
        path: String,
    },
    WriteFile {
        path: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    AppendFile {
        path: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    DeleteFile {
        path: String,
    },
    CreateDir {
        path: String,
    },
    DeleteDir {
        path: String,
    },
    Rename {
        path: String,
        new_path: String,
    },
    ReadFile {
        path: String,
    },
    ListDir {
        path: String,
    },
    Stat {
        path: String,
    },
    Exists {
        path: String,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::CreateFile { .. } => CommandKind::CreateFile,
            Command::WriteFile { .. } => CommandKind::WriteFile,
            Command::AppendFile { .. } => CommandKind::AppendFile,
            Command::DeleteFile { .. } => CommandKind::DeleteFile,
            Command::CreateDir { .. } => CommandKind::CreateDir,
            Command::DeleteDir { .. } => CommandKind::DeleteDir,
            Command::Rename { .. } => CommandKind::Rename,
            Command::ReadFile { .. } => CommandKind::ReadFile,
            Command::ListDir { .. } => CommandKind::ListDir,
            Command::Stat { .. } => CommandKind::Stat,
            Command::Exists { .. } => CommandKind::Exists,
        }
    }

    pub fn is_write(&self) -> bool {
        self.kind().is_write()
    }

    /// The primary path of the command.
    pub fn path(&self) -> &str {
        match self {
            Command::CreateFile { path }
            | Command::WriteFile { path, .. }
            | Command::AppendFile { path, .. }
            | Command::DeleteFile { path }
            | Command::CreateDir { path }
            | Command::DeleteDir { path }
            | Command::Rename { path, .. }
            | Command::ReadFile { path }
            | Command::ListDir { path }
            | Command::Stat { path }
            | Command::Exists { path } => path,
        }
    }

    fn log_payload(&self) -> &[u8] {
        match self {
            Command::WriteFile { data, .. } | Command::AppendFile { data, .. } => data,
            Command::Rename { new_path, .. } => new_path.as_bytes(),
            _ => &[],
        }
    }

    /// Serialize for the Raft log.
    ///
    /// `kind:u8 | path_len:u32 LE | path | payload_len:u32 LE | payload`.
    pub fn encode_log(&self) -> Vec<u8> {
        let path = self.path().as_bytes();
        let payload = self.log_payload();

        let mut out = Vec::with_capacity(1 + 4 + path.len() + 4 + payload.len());
        out.push(self.kind() as u8);
        out.extend_from_slice(&(path.len() as u32).to_le_bytes());
        out.extend_from_slice(path);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Deserialize a Raft log entry. Strict: any malformed framing fails.
    pub fn decode_log(bytes: &[u8]) -> Result<Self> {
        // Minimum frame: kind + two zero-length fields.
        if bytes.len() < 9 {
            return Err(FsError::Serialization(format!(
                "log entry too short: {} bytes",
                bytes.len()
            )));
        }

        let kind = CommandKind::from_u8(bytes[0]).ok_or_else(|| {
            FsError::Serialization(format!("unknown command kind: {}", bytes[0]))
        })?;

        let mut pos = 1;
        let path_len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        pos += 4;

        if pos + path_len + 4 > bytes.len() {
            return Err(FsError::Serialization(format!(
                "path length {} exceeds entry size",
                path_len
            )));
        }
        let path = std::str::from_utf8(&bytes[pos..pos + path_len])
            .map_err(|e| FsError::Serialization(format!("path is not UTF-8: {}", e)))?
            .to_string();
        pos += path_len;

        let payload_len =
            u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        pos += 4;

        if pos + payload_len != bytes.len() {
            return Err(FsError::Serialization(format!(
                "payload length {} does not match remaining {} bytes",
                payload_len,
                bytes.len() - pos
            )));
        }
        let payload = bytes[pos..].to_vec();

        let command = match kind {
            CommandKind::CreateFile => Command::CreateFile { path },
            CommandKind::WriteFile => Command::WriteFile { path, data: payload },
            CommandKind::AppendFile => Command::AppendFile { path, data: payload },
            CommandKind::DeleteFile => Command::DeleteFile { path },
            CommandKind::CreateDir => Command::CreateDir { path },
            CommandKind::DeleteDir => Command::DeleteDir { path },
            CommandKind::Rename => {
                let new_path = String::from_utf8(payload).map_err(|e| {
                    FsError::Serialization(format!("rename target is not UTF-8: {}", e))
                })?;
                Command::Rename { path, new_path }
            }
            CommandKind::ReadFile => Command::ReadFile { path },
            CommandKind::ListDir => Command::ListDir { path },
            CommandKind::Stat => Command::Stat { path },
            CommandKind::Exists => Command::Exists { path },
        };
        Ok(command)
    }
}

/// Success payload of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// No payload (writes and other acknowledgements).
    None,
    /// File contents.
    Data(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Directory listing.
    Entries(Vec<FileInfo>),
    /// Stat result.
    Info(FileInfo),
    /// Existence check result.
    Flag(bool),
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok(Payload),
    Error { status: Status, message: String },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(Payload::None)
    }

    pub fn data(data: Vec<u8>) -> Self {
        Response::Ok(Payload::Data(data))
    }

    pub fn entries(entries: Vec<FileInfo>) -> Self {
        Response::Ok(Payload::Entries(entries))
    }

    pub fn info(info: FileInfo) -> Self {
        Response::Ok(Payload::Info(info))
    }

    pub fn flag(value: bool) -> Self {
        Response::Ok(Payload::Flag(value))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn status(&self) -> Status {
        match self {
            Response::Ok(_) => Status::Ok,
            Response::Error { status, .. } => *status,
        }
    }
}

impl From<&FsError> for Response {
    fn from(err: &FsError) -> Self {
        Response::Error {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl From<crate::error::Result<Payload>> for Response {
    fn from(result: crate::error::Result<Payload>) -> Self {
        match result {
            Ok(payload) => Response::Ok(payload),
            Err(e) => Response::from(&e),
        }
    }
}

/// Serialize a command or response body for the wire.
pub fn encode_wire<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a command or response body from the wire.
pub fn decode_wire<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
