//! RPC client: one connection, sequential framed calls.

use std::path::Path;

use serde_json::Value;
use tokio::net::UnixStream;

use torrentfs_core::rpc::codec;

/// Client errors: connection and framing problems. Command-level failures
/// come back inside the response envelope instead.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot connect to daemon at {path}: {source}")]
    Connect {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Frame(#[from] codec::FrameError),
}

pub struct RpcClient {
    stream: UnixStream,
}

impl RpcClient {
    /// Connects to the daemon socket.
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: socket_path.display().to_string(),
                source,
            })?;
        Ok(Self { stream })
    }

    /// Sends one request and reads its JSON response.
    pub async fn call(&mut self, request: Value) -> Result<Value, ClientError> {
        codec::write_json(&mut self.stream, &request).await?;
        Ok(codec::read_json(&mut self.stream).await?)
    }

    /// Sends a `read` request and consumes the binary payload tail.
    pub async fn call_read(&mut self, request: Value) -> Result<(Value, Vec<u8>), ClientError> {
        codec::write_json(&mut self.stream, &request).await?;
        let header: Value = codec::read_json(&mut self.stream).await?;
        let data = match header["data_len"].as_u64() {
            Some(len) if len > 0 => codec::read_raw(&mut self.stream, len as usize).await?,
            _ => Vec::new(),
        };
        Ok((header, data))
    }
}
