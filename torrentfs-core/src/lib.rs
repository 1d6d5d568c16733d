//! TorrentFS core - exposes in-progress BitTorrent swarms as a read-only
//! filesystem served over a local RPC socket.
//!
//! The daemon composition: a [`manager::TorrentManager`] owns one
//! [`engine::Engine`] per torrent, each driving piece acquisition through
//! the [`session::SessionBackend`] seam; the [`rpc::server::RpcServer`]
//! dispatches framed JSON commands from thin clients (control CLI, FUSE
//! driver); a [`manager::watcher::DirWatcher`] turns `.torrent` files in a
//! watched directory into engine lifecycle events.

pub mod cache;
pub mod config;
pub mod engine;
pub mod index;
pub mod manager;
pub mod rpc;
pub mod session;
pub mod torrent;
pub mod tracing_setup;

pub use config::{DaemonConfig, default_socket_path};
pub use engine::{Engine, ReadMode};
pub use manager::TorrentManager;
pub use rpc::server::{RpcServer, bind_socket};
pub use session::{SessionBackend, sim::SimSession};
pub use torrent::{InfoHash, TorrentId};
pub use tracing_setup::{CliLogLevel, init_tracing};
