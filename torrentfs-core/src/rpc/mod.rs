//! Local RPC: request envelope, wire error tokens, codec, and server.

pub mod codec;
pub mod server;

use serde::Deserialize;

use crate::engine::{EngineError, ReadError};
use crate::index::PathError;
use crate::manager::sources::SourceError;
use crate::manager::{ManagerError, ResolveError};
use crate::session::SessionError;
use crate::torrent::TorrentError;

/// Request envelope. Unknown fields are ignored; every command pulls the
/// arguments it needs.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Request {
    pub id: Option<serde_json::Value>,
    pub cmd: Option<String>,
    pub torrent: Option<String>,
    pub path: Option<String>,
    pub offset: Option<u64>,
    pub size: Option<u64>,
    pub mode: Option<String>,
    pub timeout_s: Option<f64>,
    pub dry_run: Option<bool>,
    pub max_files: Option<u64>,
    pub magnet: Option<String>,
    pub source: Option<String>,
}

/// Maps an error to its wire token (the `error` field).
pub trait WireToken {
    fn wire_token(&self) -> String;
}

impl WireToken for PathError {
    fn wire_token(&self) -> String {
        match self {
            PathError::NotFound { .. } => "FileNotFound".to_string(),
            PathError::NotADirectory { .. } => "NotADirectory".to_string(),
            PathError::IsADirectory { .. } => "IsADirectory".to_string(),
            PathError::Unsafe { .. } => "PathUnsafe".to_string(),
        }
    }
}

impl WireToken for ResolveError {
    fn wire_token(&self) -> String {
        match self {
            ResolveError::Required => "TorrentRequired".to_string(),
            ResolveError::NotFound { token } => format!("TorrentNotFound:{token}"),
            ResolveError::Ambiguous { name } => format!("TorrentNameAmbiguous:{name}"),
        }
    }
}

impl WireToken for SessionError {
    fn wire_token(&self) -> String {
        match self {
            SessionError::Io(e) => format!("IOError:{e}"),
            other => format!("TorrentError:{other}"),
        }
    }
}

impl WireToken for ReadError {
    fn wire_token(&self) -> String {
        match self {
            ReadError::SizeInvalid => "ReadSizeInvalid".to_string(),
            ReadError::WouldBlock => "WouldBlock".to_string(),
            ReadError::Timeout => "Timeout".to_string(),
            ReadError::Cancelled => "Cancelled".to_string(),
            ReadError::Path(e) => e.wire_token(),
            ReadError::Torrent { message } => format!("TorrentError:{message}"),
            ReadError::Session(e) => e.wire_token(),
        }
    }
}

impl WireToken for EngineError {
    fn wire_token(&self) -> String {
        match self {
            EngineError::Path(e) => e.wire_token(),
            EngineError::Session(e) => e.wire_token(),
            EngineError::Io(e) => format!("IOError:{e}"),
        }
    }
}

impl WireToken for TorrentError {
    fn wire_token(&self) -> String {
        match self {
            TorrentError::Io(e) => format!("IOError:{e}"),
            _ => "BadRequest".to_string(),
        }
    }
}

impl WireToken for SourceError {
    fn wire_token(&self) -> String {
        match self {
            SourceError::Unrecognized { .. } | SourceError::Unsupported { .. } => {
                "BadRequest".to_string()
            }
        }
    }
}

impl WireToken for ManagerError {
    fn wire_token(&self) -> String {
        match self {
            ManagerError::Torrent(e) => e.wire_token(),
            ManagerError::Engine(e) => e.wire_token(),
            ManagerError::Session(e) => e.wire_token(),
            ManagerError::Source(e) => e.wire_token(),
            ManagerError::BadRequest { .. } => "BadRequest".to_string(),
            ManagerError::Io(e) => format!("IOError:{e}"),
        }
    }
}
