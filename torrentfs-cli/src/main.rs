//! torrentfs - thin control CLI for torrentfsd.

mod client;
mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use client::RpcClient;
use commands::{apply_to_tree, copy_file, fmt_bytes, fmt_rate, walk_files};
use torrentfs_core::default_socket_path;

#[derive(Parser)]
#[command(name = "torrentfs")]
#[command(about = "Control CLI for the TorrentFS daemon")]
struct Args {
    /// Daemon socket path.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Torrent name or id. Optional when exactly one torrent is loaded.
    #[arg(long, value_name = "NAME|ID")]
    torrent: Option<String>,

    /// Print raw JSON responses.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List loaded torrents.
    Torrents,
    /// Show the daemon's effective configuration.
    Config,
    /// Show cache size totals.
    CacheSize,
    /// Remove cache directories not owned by any loaded torrent.
    PruneCache {
        #[arg(long)]
        dry_run: bool,
    },
    /// Show one torrent's status (all torrents without --torrent).
    Status,
    /// Aggregate status over all torrents.
    StatusAll,
    /// List active downloads with per-file progress.
    Downloads {
        #[arg(long, default_value_t = 0)]
        max_files: u64,
    },
    /// Force a tracker/DHT announce.
    Reannounce,
    /// Force announces for all torrents.
    ReannounceAll,
    /// List a directory.
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Stat a file or directory.
    Stat { path: String },
    /// Read bytes to stdout.
    Cat {
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 65536)]
        size: u64,
        #[arg(long, default_value = "auto")]
        mode: String,
    },
    /// Copy a file or directory out of the mount to local disk.
    Cp {
        src: String,
        dest: PathBuf,
        #[arg(long, default_value_t = 1024 * 1024)]
        chunk_size: u64,
        /// Per-chunk read timeout in seconds; 0 waits indefinitely.
        #[arg(long, default_value_t = 1.0)]
        read_timeout: f64,
        #[arg(long, default_value_t = 0)]
        max_files: usize,
        #[arg(long, default_value_t = -1)]
        depth: i64,
    },
    /// Sum file sizes under a path.
    Du {
        #[arg(default_value = "")]
        path: String,
        #[arg(long, default_value_t = -1)]
        depth: i64,
    },
    /// Piece-level info for a file.
    FileInfo { path: String },
    /// Computed prefetch ranges for a file.
    PrefetchInfo { path: String },
    /// Pin a file at top priority.
    Pin { path: String },
    /// Pin every file under a directory.
    PinDir {
        path: String,
        #[arg(long, default_value_t = 0)]
        max_files: usize,
        #[arg(long, default_value_t = -1)]
        depth: i64,
    },
    /// Unpin a file.
    Unpin { path: String },
    /// Unpin every file under a directory.
    UnpinDir {
        path: String,
        #[arg(long, default_value_t = 0)]
        max_files: usize,
        #[arg(long, default_value_t = -1)]
        depth: i64,
    },
    /// List pinned files.
    Pinned,
    /// Prefetch a file or directory.
    Prefetch {
        #[arg(default_value = "")]
        path: String,
    },
    /// List connected peers.
    Peers,
    /// Add a torrent from a source string (magnet:, archive:, URL).
    SourceAdd { source: String },
    /// Add a torrent from a magnet link.
    AddMagnet { magnet: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

async fn run(args: Args) -> CliResult {
    let socket = args.socket.clone().unwrap_or_else(default_socket_path);
    let mut client = RpcClient::connect(&socket).await?;

    match &args.command {
        Command::Torrents => {
            let response = client.call(json!({"cmd": "torrents"})).await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            for t in response["torrents"].as_array().into_iter().flatten() {
                println!(
                    "{}\t{}\t{}\t{}",
                    t["id"].as_str().unwrap_or(""),
                    t["name"].as_str().unwrap_or(""),
                    t["torrent_name"].as_str().unwrap_or(""),
                    t["cache"].as_str().unwrap_or(""),
                );
            }
            Ok(())
        }

        Command::Config => {
            let response = client.call(json!({"cmd": "config"})).await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            print_json(&response["config"])
        }

        Command::CacheSize => {
            let response = client.call(json!({"cmd": "cache-size"})).await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            println!(
                "cache_logical: {}",
                fmt_bytes(response["logical_bytes"].as_f64().unwrap_or(0.0))
            );
            println!(
                "cache_disk: {}",
                fmt_bytes(response["disk_bytes"].as_f64().unwrap_or(0.0))
            );
            Ok(())
        }

        Command::PruneCache { dry_run } => {
            let response = client
                .call(json!({"cmd": "prune-cache", "dry_run": dry_run}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            println!("removed: {}", response["removed"]);
            println!("skipped: {}", response["skipped"]);
            Ok(())
        }

        Command::Status => match &args.torrent {
            None => status_all(&mut client, args.json).await,
            Some(_) => {
                let torrent = resolve_torrent(&mut client, &args).await?;
                let response = client
                    .call(json!({"cmd": "status", "torrent": torrent}))
                    .await?;
                if args.json {
                    return print_json(&response);
                }
                expect_ok(&response)?;
                print_status(&response["status"]);
                Ok(())
            }
        },

        Command::StatusAll => status_all(&mut client, args.json).await,

        Command::Downloads { max_files } => {
            let response = client
                .call(json!({"cmd": "downloads", "max_files": max_files}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            for t in response["torrents"].as_array().into_iter().flatten() {
                let status = &t["status"];
                println!(
                    "{}\t{}\tpieces={}/{}\trate={}\tpeers={}",
                    t["id"].as_str().unwrap_or(""),
                    status["name"].as_str().unwrap_or(""),
                    status["pieces_done"],
                    status["pieces_total"],
                    fmt_rate(status["download_rate"].as_f64().unwrap_or(0.0)),
                    status["peers"],
                );
                for f in t["files"].as_array().into_iter().flatten() {
                    println!(
                        "  file\t{:.2}%\t{}/{}\t{}",
                        f["progress_pct"].as_f64().unwrap_or(0.0),
                        f["remaining"],
                        f["size"],
                        f["path"].as_str().unwrap_or(""),
                    );
                }
            }
            Ok(())
        }

        Command::Reannounce => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            simple(&mut client, args.json, json!({"cmd": "reannounce", "torrent": torrent}), "reannounce ok").await
        }

        Command::ReannounceAll => {
            simple(&mut client, args.json, json!({"cmd": "reannounce-all"}), "reannounce-all ok").await
        }

        Command::Ls { path } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let response = client
                .call(json!({"cmd": "list", "torrent": torrent, "path": path}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            for e in response["entries"].as_array().into_iter().flatten() {
                println!(
                    "{}\t{}\t{}",
                    e["type"].as_str().unwrap_or(""),
                    e["size"],
                    e["name"].as_str().unwrap_or(""),
                );
            }
            Ok(())
        }

        Command::Stat { path } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let response = client
                .call(json!({"cmd": "stat", "torrent": torrent, "path": path}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            print_json(&response["stat"])
        }

        Command::Cat {
            path,
            offset,
            size,
            mode,
        } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let (header, data) = client
                .call_read(json!({
                    "cmd": "read", "torrent": torrent, "path": path,
                    "offset": offset, "size": size, "mode": mode,
                }))
                .await?;
            expect_ok(&header)?;
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
            Ok(())
        }

        Command::Cp {
            src,
            dest,
            chunk_size,
            read_timeout,
            max_files,
            depth,
        } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let timeout = (*read_timeout > 0.0).then_some(*read_timeout);

            let stat = client
                .call(json!({"cmd": "stat", "torrent": torrent, "path": src}))
                .await?;
            expect_ok(&stat)?;

            if stat["stat"]["type"] == "file" {
                let size = stat["stat"]["size"].as_u64().unwrap_or(0);
                let dest = if dest.is_dir() {
                    dest.join(src.rsplit('/').next().unwrap_or(src))
                } else {
                    dest.clone()
                };
                let copied =
                    copy_file(&mut client, &torrent, src, size, &dest, *chunk_size, timeout)
                        .await?;
                println!("copied: {} ({})", dest.display(), fmt_bytes(copied as f64));
                return Ok(());
            }

            let (files, errors) =
                walk_files(&mut client, &torrent, src, *max_files, *depth).await?;
            let mut copied = 0usize;
            for file in &files {
                let rel = file.path.strip_prefix(src.trim_end_matches('/')).unwrap_or(&file.path);
                let target = dest.join(rel.trim_start_matches('/'));
                copy_file(
                    &mut client, &torrent, &file.path, file.size, &target, *chunk_size, timeout,
                )
                .await?;
                copied += 1;
            }
            println!("copied: {copied} files, errors: {}", errors.len());
            for error in errors {
                eprintln!("error: {error}");
            }
            Ok(())
        }

        Command::Du { path, depth } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let (files, errors) = walk_files(&mut client, &torrent, path, 0, *depth).await?;
            let total: u64 = files.iter().map(|f| f.size).sum();
            if args.json {
                return print_json(&json!({
                    "ok": errors.is_empty(),
                    "path": path,
                    "total_bytes": total,
                    "files": files.len(),
                    "errors": errors,
                }));
            }
            println!("path: {path}");
            println!("total_bytes: {total} ({})", fmt_bytes(total as f64));
            println!("files: {}", files.len());
            for error in errors {
                eprintln!("error: {error}");
            }
            Ok(())
        }

        Command::FileInfo { path } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let response = client
                .call(json!({"cmd": "file-info", "torrent": torrent, "path": path}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            print_json(&response["info"])
        }

        Command::PrefetchInfo { path } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let response = client
                .call(json!({"cmd": "prefetch-info", "torrent": torrent, "path": path}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            print_json(&response["info"])
        }

        Command::Pin { path } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            simple(&mut client, args.json, json!({"cmd": "pin", "torrent": torrent, "path": path}), "pin ok").await
        }

        Command::Unpin { path } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            simple(&mut client, args.json, json!({"cmd": "unpin", "torrent": torrent, "path": path}), "unpin ok").await
        }

        Command::PinDir {
            path,
            max_files,
            depth,
        } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let (applied, errors) =
                apply_to_tree(&mut client, &torrent, path, "pin", *max_files, *depth).await?;
            println!("pinned: {applied} errors: {}", errors.len());
            for error in errors {
                eprintln!("error: {error}");
            }
            Ok(())
        }

        Command::UnpinDir {
            path,
            max_files,
            depth,
        } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let (applied, errors) =
                apply_to_tree(&mut client, &torrent, path, "unpin", *max_files, *depth).await?;
            println!("unpinned: {applied} errors: {}", errors.len());
            for error in errors {
                eprintln!("error: {error}");
            }
            Ok(())
        }

        Command::Pinned => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let response = client
                .call(json!({"cmd": "pinned", "torrent": torrent}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            for p in response["pins"].as_array().into_iter().flatten() {
                println!(
                    "{}\t{}\t{}",
                    p["size"],
                    p["torrent_name"].as_str().unwrap_or(""),
                    p["path"].as_str().unwrap_or(""),
                );
            }
            Ok(())
        }

        Command::Prefetch { path } => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let response = client
                .call(json!({"cmd": "prefetch", "torrent": torrent, "path": path}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            println!("prefetched: {}", response["prefetched"]);
            Ok(())
        }

        Command::Peers => {
            let torrent = resolve_torrent(&mut client, &args).await?;
            let response = client
                .call(json!({"cmd": "peers", "torrent": torrent}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            for p in response["peers"].as_array().into_iter().flatten() {
                println!(
                    "{}\t{}\tdown={}\tup={}\t{:.0}%",
                    p["address"].as_str().unwrap_or(""),
                    p["client"].as_str().unwrap_or(""),
                    fmt_rate(p["download_rate"].as_f64().unwrap_or(0.0)),
                    fmt_rate(p["upload_rate"].as_f64().unwrap_or(0.0)),
                    p["progress"].as_f64().unwrap_or(0.0) * 100.0,
                );
            }
            Ok(())
        }

        Command::SourceAdd { source } => {
            let response = client
                .call(json!({"cmd": "source-add", "source": source}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            println!("added: {}", response["id"].as_str().unwrap_or(""));
            Ok(())
        }

        Command::AddMagnet { magnet } => {
            let response = client
                .call(json!({"cmd": "add-magnet", "magnet": magnet}))
                .await?;
            if args.json {
                return print_json(&response);
            }
            expect_ok(&response)?;
            println!("added: {}", response["id"].as_str().unwrap_or(""));
            Ok(())
        }
    }
}

/// Picks the target torrent: the explicit `--torrent`, or the only loaded
/// torrent, or an error listing the candidates.
async fn resolve_torrent(client: &mut RpcClient, args: &Args) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(torrent) = &args.torrent {
        return Ok(torrent.clone());
    }
    let response = client.call(json!({"cmd": "torrents"})).await?;
    expect_ok(&response)?;
    let torrents = response["torrents"].as_array().cloned().unwrap_or_default();
    match torrents.as_slice() {
        [] => Err("no torrents loaded in the daemon".into()),
        [only] => Ok(only["id"].as_str().unwrap_or("").to_string()),
        many => {
            let mut message = String::from("multiple torrents loaded, pass --torrent:\n");
            for t in many {
                message.push_str(&format!(
                    "  {} ({})\n",
                    t["name"].as_str().unwrap_or(""),
                    t["id"].as_str().unwrap_or(""),
                ));
            }
            Err(message.into())
        }
    }
}

async fn status_all(client: &mut RpcClient, json_output: bool) -> CliResult {
    let response = client.call(json!({"cmd": "status-all"})).await?;
    if json_output {
        return print_json(&response);
    }
    expect_ok(&response)?;
    let totals = &response["totals"];
    println!(
        "totals: downloaded={} uploaded={} download_rate={} upload_rate={} peers={} seeds={}",
        fmt_bytes(totals["downloaded"].as_f64().unwrap_or(0.0)),
        fmt_bytes(totals["uploaded"].as_f64().unwrap_or(0.0)),
        fmt_rate(totals["download_rate"].as_f64().unwrap_or(0.0)),
        fmt_rate(totals["upload_rate"].as_f64().unwrap_or(0.0)),
        totals["peers"],
        totals["seeds"],
    );
    for t in response["torrents"].as_array().into_iter().flatten() {
        let status = &t["status"];
        println!(
            "{}\t{}\t{}\tpeers={}\tprogress={:.2}",
            t["id"].as_str().unwrap_or(""),
            status["name"].as_str().unwrap_or(""),
            status["state"].as_str().unwrap_or(""),
            status["peers"],
            status["progress"].as_f64().unwrap_or(0.0),
        );
    }
    Ok(())
}

fn print_status(status: &Value) {
    for key in ["name", "state", "progress", "peers", "seeds"] {
        println!("{key}: {}", status[key]);
    }
    println!(
        "downloaded: {}",
        fmt_bytes(status["downloaded"].as_f64().unwrap_or(0.0))
    );
    println!(
        "uploaded: {}",
        fmt_bytes(status["uploaded"].as_f64().unwrap_or(0.0))
    );
    println!(
        "download_rate: {}",
        fmt_rate(status["download_rate"].as_f64().unwrap_or(0.0))
    );
    println!(
        "upload_rate: {}",
        fmt_rate(status["upload_rate"].as_f64().unwrap_or(0.0))
    );
    if status["checking"] == true {
        println!("checking_progress: {}", status["checking_progress"]);
    }
}

/// Fire-and-confirm command: print the response or a short ok line.
async fn simple(
    client: &mut RpcClient,
    json_output: bool,
    request: Value,
    ok_message: &str,
) -> CliResult {
    let response = client.call(request).await?;
    if json_output {
        return print_json(&response);
    }
    expect_ok(&response)?;
    println!("{ok_message}");
    Ok(())
}

fn print_json(value: &Value) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn expect_ok(response: &Value) -> CliResult {
    if response["ok"] == true {
        Ok(())
    } else {
        let token = response["error"].as_str().unwrap_or("unknown error");
        match response["message"].as_str() {
            Some(message) => Err(format!("{token}: {message}").into()),
            None => Err(token.to_string().into()),
        }
    }
}
