//! Command helpers: directory walks over the RPC surface, chunked copies,
//! and human-readable formatting.

use std::path::Path;

use serde_json::{Value, json};

use crate::client::{ClientError, RpcClient};

/// Formats a byte count as a binary-prefixed human string.
pub fn fmt_bytes(value: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = value;
    let mut idx = 0;
    while v >= 1024.0 && idx < UNITS.len() - 1 {
        v /= 1024.0;
        idx += 1;
    }
    format!("{v:.2} {}", UNITS[idx])
}

pub fn fmt_rate(value: f64) -> String {
    format!("{}/s", fmt_bytes(value))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// A file discovered by [`walk_files`].
pub struct WalkedFile {
    pub path: String,
    pub size: u64,
}

/// Recursively collects files under `path`, bounded by `max_files`
/// (0 = unlimited) and `max_depth` (-1 = unlimited, 0 = only `path`).
pub async fn walk_files(
    client: &mut RpcClient,
    torrent: &str,
    path: &str,
    max_files: usize,
    max_depth: i64,
) -> Result<(Vec<WalkedFile>, Vec<String>), ClientError> {
    let mut files = Vec::new();
    let mut errors = Vec::new();
    walk_inner(
        client, torrent, path, 0, max_files, max_depth, &mut files, &mut errors,
    )
    .await?;
    Ok((files, errors))
}

async fn walk_inner(
    client: &mut RpcClient,
    torrent: &str,
    path: &str,
    depth: i64,
    max_files: usize,
    max_depth: i64,
    files: &mut Vec<WalkedFile>,
    errors: &mut Vec<String>,
) -> Result<(), ClientError> {
    if max_files > 0 && files.len() >= max_files {
        return Ok(());
    }

    let stat = client
        .call(json!({"cmd": "stat", "torrent": torrent, "path": path}))
        .await?;
    if stat["ok"] != true {
        errors.push(format!("{path}: {}", stat["error"]));
        return Ok(());
    }

    if stat["stat"]["type"] == "file" {
        files.push(WalkedFile {
            path: path.to_string(),
            size: stat["stat"]["size"].as_u64().unwrap_or(0),
        });
        return Ok(());
    }

    if max_depth >= 0 && depth > max_depth {
        return Ok(());
    }
    let listing = client
        .call(json!({"cmd": "list", "torrent": torrent, "path": path}))
        .await?;
    if listing["ok"] != true {
        errors.push(format!("{path}: {}", listing["error"]));
        return Ok(());
    }

    let entries: Vec<Value> = listing["entries"].as_array().cloned().unwrap_or_default();
    for entry in entries {
        if max_files > 0 && files.len() >= max_files {
            return Ok(());
        }
        let name = entry["name"].as_str().unwrap_or_default();
        let child = join_path(path, name);
        if entry["type"] == "dir" {
            Box::pin(walk_inner(
                client,
                torrent,
                &child,
                depth + 1,
                max_files,
                max_depth,
                files,
                errors,
            ))
            .await?;
        } else {
            files.push(WalkedFile {
                path: child,
                size: entry["size"].as_u64().unwrap_or(0),
            });
        }
    }
    Ok(())
}

/// Applies a per-file command (`pin` / `unpin`) over a subtree.
/// Returns `(applied, errors)`.
pub async fn apply_to_tree(
    client: &mut RpcClient,
    torrent: &str,
    path: &str,
    cmd: &str,
    max_files: usize,
    max_depth: i64,
) -> Result<(usize, Vec<String>), ClientError> {
    let stat = client
        .call(json!({"cmd": "stat", "torrent": torrent, "path": path}))
        .await?;
    if stat["ok"] == true && stat["stat"]["type"] == "file" {
        let response = client
            .call(json!({"cmd": cmd, "torrent": torrent, "path": path}))
            .await?;
        return Ok(if response["ok"] == true {
            (1, Vec::new())
        } else {
            (0, vec![format!("{path}: {}", response["error"])])
        });
    }

    let (files, mut errors) = walk_files(client, torrent, path, max_files, max_depth).await?;
    let mut applied = 0;
    for file in files {
        let response = client
            .call(json!({"cmd": cmd, "torrent": torrent, "path": file.path}))
            .await?;
        if response["ok"] == true {
            applied += 1;
        } else {
            errors.push(format!("{}: {}", file.path, response["error"]));
        }
    }
    Ok((applied, errors))
}

/// Copies one remote file to a local path with chunked reads, retrying
/// when a chunk times out (the daemon keeps pulling pieces meanwhile).
pub async fn copy_file(
    client: &mut RpcClient,
    torrent: &str,
    src: &str,
    size: u64,
    dest: &Path,
    chunk_size: u64,
    timeout_s: Option<f64>,
) -> Result<u64, Box<dyn std::error::Error>> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = tokio::fs::File::create(dest).await?;
    let mut offset = 0u64;

    while offset < size {
        let want = chunk_size.min(size - offset);
        let mut request = json!({
            "cmd": "read", "torrent": torrent, "path": src,
            "offset": offset, "size": want, "mode": "auto",
        });
        if let Some(t) = timeout_s {
            request["timeout_s"] = json!(t);
        }
        let (header, data) = client.call_read(request).await?;
        if header["ok"] != true {
            if header["error"] == "Timeout" {
                continue;
            }
            return Err(format!("{src}@{offset}: {}", header["error"]).into());
        }
        if data.is_empty() {
            break;
        }
        tokio::io::AsyncWriteExt::write_all(&mut out, &data).await?;
        offset += data.len() as u64;
        eprint!("\r{src}: {} / {}", fmt_bytes(offset as f64), fmt_bytes(size as f64));
    }
    eprintln!();
    Ok(offset)
}
