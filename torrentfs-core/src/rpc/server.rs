//! RPC server: accepts local connections and dispatches commands.
//!
//! Connections are independent tasks; within one connection commands run
//! strictly sequentially, so a slow `read` only delays that connection.
//! Command errors go back as `{ok:false, error}` responses; only framing
//! errors close a connection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::{UnixListener, UnixStream, unix::OwnedReadHalf, unix::OwnedWriteHalf};

use super::codec::{self, FrameError};
use super::{Request, WireToken};
use crate::engine::{CancelToken, ReadMode};
use crate::manager::TorrentManager;

/// Accept loop over a bound Unix listener.
pub struct RpcServer {
    manager: Arc<TorrentManager>,
}

impl RpcServer {
    pub fn new(manager: Arc<TorrentManager>) -> Self {
        Self { manager }
    }

    /// Accepts connections forever, one task per connection.
    pub async fn run(self, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let manager = self.manager.clone();
                    tokio::spawn(async move {
                        handle_connection(manager, stream).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Serves one connection until the peer disconnects or a framing error
/// occurs.
pub async fn handle_connection(manager: Arc<TorrentManager>, stream: UnixStream) {
    let (mut reader, mut writer) = stream.into_split();
    // A frame that arrives while a read is in flight is held here; the
    // protocol forbids pipelining, but a single buffered request keeps the
    // disconnect watch simple.
    let mut pending: Option<Request> = None;

    loop {
        let request = match pending.take() {
            Some(request) => request,
            None => match codec::read_json::<_, Request>(&mut reader).await {
                Ok(request) => request,
                Err(FrameError::Closed) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "closing connection on framing error");
                    break;
                }
            },
        };

        let id = request.id.clone().unwrap_or(Value::Null);
        let Some(cmd) = request.cmd.clone() else {
            if send(&mut writer, fail(&id, "BadRequest", "missing cmd")).await.is_err() {
                break;
            }
            continue;
        };

        if cmd == "read" {
            if !handle_read(&manager, &request, &mut reader, &mut writer, &mut pending).await {
                break;
            }
            continue;
        }

        let response = dispatch(&manager, &cmd, &request, &id).await;
        if send(&mut writer, response).await.is_err() {
            break;
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, response: Value) -> Result<(), FrameError> {
    codec::write_json(writer, &response).await
}

fn ok_with(id: &Value, mut body: serde_json::Map<String, Value>) -> Value {
    body.insert("id".to_string(), id.clone());
    body.insert("ok".to_string(), Value::Bool(true));
    Value::Object(body)
}

fn ok(id: &Value) -> Value {
    ok_with(id, serde_json::Map::new())
}

fn fail(id: &Value, token: impl Into<String>, message: impl Into<String>) -> Value {
    let token: String = token.into();
    let message: String = message.into();
    let mut body = json!({
        "id": id,
        "ok": false,
        "error": token,
    });
    if !message.is_empty() {
        body["message"] = Value::String(message);
    }
    body
}

fn fail_from(id: &Value, error: &(impl WireToken + std::fmt::Display)) -> Value {
    fail(id, error.wire_token(), error.to_string())
}

macro_rules! resolve_or_fail {
    ($manager:expr, $request:expr, $id:expr) => {
        match $manager.resolve($request.torrent.as_deref()).await {
            Ok(engine) => engine,
            Err(e) => return fail_from($id, &e),
        }
    };
}

macro_rules! path_or_fail {
    ($request:expr, $id:expr) => {
        match $request.path.as_deref() {
            Some(path) => path,
            None => return fail($id, "BadRequest", "missing path"),
        }
    };
}

/// Executes every command except `read`, which needs the connection's
/// reader for its disconnect watch.
async fn dispatch(manager: &Arc<TorrentManager>, cmd: &str, request: &Request, id: &Value) -> Value {
    match cmd {
        "hello" => {
            let torrents = manager.list_torrents().await;
            let mut body = serde_json::Map::new();
            body.insert("name".to_string(), json!("torrentfsd"));
            body.insert("torrents".to_string(), json!(torrents));
            ok_with(id, body)
        }

        "torrents" => {
            let torrents = manager.list_torrents().await;
            let mut body = serde_json::Map::new();
            body.insert("torrents".to_string(), json!(torrents));
            ok_with(id, body)
        }

        "config" => {
            let mut config = serde_json::to_value(manager.config()).unwrap_or(Value::Null);
            if let Value::Object(map) = &mut config {
                map.insert(
                    "config_path".to_string(),
                    manager
                        .config_path()
                        .map(|p| Value::String(p.display().to_string()))
                        .unwrap_or(Value::Null),
                );
                map.insert(
                    "max_metadata_bytes".to_string(),
                    json!(manager.config().max_metadata_bytes()),
                );
            }
            let mut body = serde_json::Map::new();
            body.insert("config".to_string(), config);
            ok_with(id, body)
        }

        "status" => {
            let engine = resolve_or_fail!(manager, request, id);
            match engine.status().await {
                Ok(status) => {
                    let mut body = serde_json::Map::new();
                    body.insert("status".to_string(), json!(status));
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        "status-all" => {
            let (totals, torrents) = manager.status_all().await;
            let mut body = serde_json::Map::new();
            body.insert("totals".to_string(), json!(totals));
            body.insert("torrents".to_string(), json!(torrents));
            ok_with(id, body)
        }

        "reannounce" => {
            let engine = resolve_or_fail!(manager, request, id);
            match engine.reannounce().await {
                Ok(()) => ok(id),
                Err(e) => fail_from(id, &e),
            }
        }

        "reannounce-all" => {
            manager.reannounce_all().await;
            ok(id)
        }

        "cache-size" => {
            let usage = manager.cache_usage().await;
            let mut body = serde_json::Map::new();
            body.insert("logical_bytes".to_string(), json!(usage.logical_bytes));
            body.insert("disk_bytes".to_string(), json!(usage.disk_bytes));
            ok_with(id, body)
        }

        "prune-cache" => {
            let dry_run = request.dry_run.unwrap_or(false);
            match manager.prune_cache(dry_run).await {
                Ok(outcome) => {
                    let mut body = serde_json::Map::new();
                    body.insert("removed".to_string(), json!(outcome.removed));
                    body.insert("skipped".to_string(), json!(outcome.skipped));
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        "downloads" => {
            let max_files = request.max_files.unwrap_or(0) as usize;
            let torrents = manager.downloads(max_files).await;
            let mut body = serde_json::Map::new();
            body.insert("torrents".to_string(), json!(torrents));
            ok_with(id, body)
        }

        "peers" => {
            let engine = resolve_or_fail!(manager, request, id);
            match engine.peers().await {
                Ok(peers) => {
                    let mut body = serde_json::Map::new();
                    body.insert("peers".to_string(), json!(peers));
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        "peers-all" => {
            let torrents = manager.peers_all().await;
            let mut body = serde_json::Map::new();
            body.insert("torrents".to_string(), json!(torrents));
            ok_with(id, body)
        }

        "list" => {
            let engine = resolve_or_fail!(manager, request, id);
            let path = request.path.as_deref().unwrap_or("");
            match engine.list(path) {
                Ok(entries) => {
                    let entries: Vec<Value> = entries
                        .iter()
                        .map(|e| {
                            json!({
                                "name": e.name,
                                "type": if e.is_dir { "dir" } else { "file" },
                                "size": e.size,
                            })
                        })
                        .collect();
                    let mut body = serde_json::Map::new();
                    body.insert("entries".to_string(), Value::Array(entries));
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        "stat" => {
            let engine = resolve_or_fail!(manager, request, id);
            let path = path_or_fail!(request, id);
            match engine.stat(path) {
                Ok(stat) => {
                    let mut value = json!({
                        "type": if stat.is_dir { "dir" } else { "file" },
                        "size": stat.size,
                    });
                    if let Some(index) = stat.file_index {
                        value["file_index"] = json!(index);
                    }
                    let mut body = serde_json::Map::new();
                    body.insert("stat".to_string(), value);
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        "file-info" => {
            let engine = resolve_or_fail!(manager, request, id);
            let path = path_or_fail!(request, id);
            match engine.file_info(path).await {
                Ok(info) => {
                    let mut body = serde_json::Map::new();
                    body.insert("info".to_string(), json!(info));
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        "prefetch-info" => {
            let engine = resolve_or_fail!(manager, request, id);
            let path = path_or_fail!(request, id);
            match engine.prefetch_info(path).await {
                Ok(info) => {
                    let mut body = serde_json::Map::new();
                    body.insert("info".to_string(), json!(info));
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        "pin" => {
            let engine = resolve_or_fail!(manager, request, id);
            let path = path_or_fail!(request, id);
            match engine.pin(path).await {
                Ok(()) => ok(id),
                Err(e) => fail_from(id, &e),
            }
        }

        "unpin" => {
            let engine = resolve_or_fail!(manager, request, id);
            let path = path_or_fail!(request, id);
            match engine.unpin(path).await {
                Ok(()) => ok(id),
                Err(e) => fail_from(id, &e),
            }
        }

        "pinned" => {
            let engine = resolve_or_fail!(manager, request, id);
            let pins = engine.pinned().await;
            let mut body = serde_json::Map::new();
            body.insert("pins".to_string(), json!(pins));
            ok_with(id, body)
        }

        "prefetch" => {
            let engine = resolve_or_fail!(manager, request, id);
            let path = request.path.as_deref().unwrap_or("");
            match engine.prefetch_path(path).await {
                Ok(applied) => {
                    let mut body = serde_json::Map::new();
                    body.insert("prefetched".to_string(), json!(applied));
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        "add-magnet" => {
            let Some(magnet) = request.magnet.as_deref() else {
                return fail(id, "BadRequest", "missing magnet");
            };
            match manager.add_magnet(magnet).await {
                Ok(added) => {
                    let mut body = serde_json::Map::new();
                    body.insert("id".to_string(), json!(added.as_str()));
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        "source-add" => {
            let Some(source) = request.source.as_deref() else {
                return fail(id, "BadRequest", "missing source");
            };
            match manager.source_add(source).await {
                Ok(added) => {
                    let mut body = serde_json::Map::new();
                    body.insert("id".to_string(), json!(added.as_str()));
                    ok_with(id, body)
                }
                Err(e) => fail_from(id, &e),
            }
        }

        unknown => fail(id, "UnknownCommand", format!("unknown command {unknown:?}")),
    }
}

/// Runs a `read` while watching the connection for disconnect. Returns
/// false when the connection should close.
///
/// The disconnect watch doubles as the (single-slot) buffer for a frame a
/// client sends early; cancellation-safety of the frame read is only
/// relevant for pipelining clients, which the protocol forbids.
async fn handle_read(
    manager: &Arc<TorrentManager>,
    request: &Request,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    pending: &mut Option<Request>,
) -> bool {
    let id = request.id.clone().unwrap_or(Value::Null);

    let engine = match manager.resolve(request.torrent.as_deref()).await {
        Ok(engine) => engine,
        Err(e) => return send(writer, fail_from(&id, &e)).await.is_ok(),
    };
    let Some(path) = request.path.as_deref() else {
        return send(writer, fail(&id, "BadRequest", "missing path")).await.is_ok();
    };
    let Some(size) = request.size else {
        return send(writer, fail(&id, "BadRequest", "missing size")).await.is_ok();
    };
    let offset = request.offset.unwrap_or(0);
    let Some(mode) = ReadMode::parse(request.mode.as_deref().unwrap_or("auto")) else {
        return send(writer, fail(&id, "BadRequest", "invalid mode")).await.is_ok();
    };
    let timeout = request
        .timeout_s
        .filter(|&t| t > 0.0)
        .map(Duration::from_secs_f64);

    let cancel = CancelToken::new();
    let read = engine.read(path, offset, size, mode, timeout, &cancel);
    tokio::pin!(read);

    let mut closed = false;
    let result = loop {
        tokio::select! {
            result = &mut read => break result,
            next = codec::read_json::<_, Request>(reader), if !closed => match next {
                Ok(early) => {
                    if pending.replace(early).is_some() {
                        tracing::warn!("client pipelined multiple requests during a read; dropping one");
                    }
                }
                Err(_) => {
                    // Peer went away: wake the read so it exits promptly.
                    cancel.cancel();
                    closed = true;
                }
            },
        }
    };

    if closed {
        return false;
    }

    match result {
        Ok(data) => {
            let header = {
                let mut body = serde_json::Map::new();
                body.insert("data_len".to_string(), json!(data.len()));
                ok_with(&id, body)
            };
            if send(writer, header).await.is_err() {
                return false;
            }
            if !data.is_empty() && codec::write_raw(writer, &data).await.is_err() {
                return false;
            }
            true
        }
        Err(e) => send(writer, fail_from(&id, &e)).await.is_ok(),
    }
}

/// Binds the Unix listener, replacing a stale socket file. The socket is
/// group-accessible so local clients under the same group can connect.
pub fn bind_socket(path: &std::path::Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    let permissions = std::os::unix::fs::PermissionsExt::from_mode(0o660);
    std::fs::set_permissions(path, permissions)?;
    Ok(listener)
}
