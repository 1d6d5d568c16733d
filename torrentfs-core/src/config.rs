//! Daemon configuration.
//!
//! A single JSON document read from the first existing candidate path.
//! Every field has a default so an absent file yields a working daemon;
//! unknown keys are warned about and ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration loading failures. These abort daemon startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Soft cap on torrent metadata size, in MiB.
    pub max_metadata_mb: MaxMetadataMb,
    /// Skip hash-checking cache data at torrent load (faster, unsafe).
    pub skip_check: bool,
    pub checking: CheckingConfig,
    pub resume: ResumeConfig,
    pub trackers: TrackersConfig,
    pub prefetch: PrefetchConfig,
    pub watch: WatchConfig,
    pub read: ReadConfig,
}

/// Newtype so the default (100 MiB) survives `#[serde(default)]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaxMetadataMb(pub u64);

impl Default for MaxMetadataMb {
    fn default() -> Self {
        Self(100)
    }
}

/// Hash-check concurrency limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckingConfig {
    /// Torrents allowed in `checking_files` simultaneously. 0 = unlimited.
    pub max_active: usize,
}

/// Resume-data persistence cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    /// Seconds between resume-data snapshots. 0 = disabled.
    pub save_interval_s: u64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self { save_interval_s: 60 }
    }
}

/// Tracker alias substitution applied at torrent load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackersConfig {
    /// Map from `torrentfs://<name>` to the tracker URLs substituted for it.
    pub aliases: BTreeMap<String, Vec<String>>,
}

impl TrackersConfig {
    /// Expands alias entries in a tracker list, dropping unknown aliases
    /// with a warning.
    pub fn expand(&self, announce_urls: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for url in announce_urls {
            if url.starts_with("torrentfs://") {
                match self.aliases.get(url) {
                    Some(targets) => out.extend(targets.iter().cloned()),
                    None => tracing::warn!(alias = %url, "unknown tracker alias dropped"),
                }
            } else {
                out.push(url.clone());
            }
        }
        out
    }
}

/// Prefetch mode: which profile applies to which files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchMode {
    /// Only files matching the media extension list are prefetched.
    Media,
    /// Non-media files get the `other` profile instead of being skipped.
    All,
}

/// Head/tail range parameters for one prefetch profile.
///
/// Percent fields accept both `0-1` and `0-100` conventions; values above 1
/// are treated as percentages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchProfile {
    pub start_pct: f64,
    pub start_min_mb: f64,
    pub start_max_mb: f64,
    pub end_pct: f64,
    pub end_min_mb: f64,
    pub end_max_mb: f64,
}

impl Default for PrefetchProfile {
    fn default() -> Self {
        Self {
            start_pct: 0.10,
            start_min_mb: 1.0,
            start_max_mb: 4.0,
            end_pct: 0.02,
            end_min_mb: 1.0,
            end_max_mb: 2.0,
        }
    }
}

/// Media matching for the `media` profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Extensions (without dot, case-insensitive) treated as media.
    pub extensions: Vec<String>,
    #[serde(flatten)]
    pub profile: PrefetchProfile,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            extensions: [
                "mp4", "mkv", "avi", "mov", "m4v", "webm", "mp3", "flac", "aac", "ogg", "wav",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            profile: PrefetchProfile::default(),
        }
    }
}

/// Prefetch policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Run a prefetch pass over each torrent when it becomes ready.
    pub on_start: bool,
    pub mode: PrefetchMode,
    /// Total prefetched bytes cap per torrent, in MiB. 0 = unlimited.
    pub max_mb: u64,
    /// Files considered per prefetch request. 0 = unlimited.
    pub max_files: usize,
    /// Directories traversed per prefetch request. 0 = unlimited.
    pub max_dirs: usize,
    /// Pieces per priority-update batch.
    pub batch_size: usize,
    pub batch_sleep_ms: u64,
    pub scan_sleep_ms: u64,
    pub sleep_ms: u64,
    pub media: MediaConfig,
    pub other: PrefetchProfile,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            on_start: false,
            mode: PrefetchMode::Media,
            max_mb: 512,
            max_files: 64,
            max_dirs: 16,
            batch_size: 64,
            batch_sleep_ms: 10,
            scan_sleep_ms: 5,
            sleep_ms: 2,
            media: MediaConfig::default(),
            other: PrefetchProfile {
                start_pct: 0.05,
                start_min_mb: 0.25,
                start_max_mb: 1.0,
                end_pct: 0.0,
                end_min_mb: 0.0,
                end_max_mb: 0.0,
            },
        }
    }
}

/// Watched-directory polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
        }
    }
}

/// Read-scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Per-piece deadline spacing: piece k past the read head gets
    /// `now + k * deadline_gap_ms`.
    pub deadline_gap_ms: u64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            deadline_gap_ms: 50,
        }
    }
}

impl DaemonConfig {
    /// Metadata cap in bytes.
    pub fn max_metadata_bytes(&self) -> u64 {
        self.max_metadata_mb.0 * 1024 * 1024
    }

    /// Loads configuration from an explicit path.
    ///
    /// # Errors
    /// - `ConfigError::Read` / `ConfigError::Parse` - unreadable or invalid JSON
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        warn_unknown_keys(&value, &reference_value(), "");

        serde_json::from_value(value).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads configuration from the first existing candidate path:
    /// `$TORRENTFSD_CONFIG`, `$HOME/.config/torrentfs/torrentfsd.json`,
    /// `/etc/torrentfs/torrentfsd.json`, `config/torrentfsd.json`.
    ///
    /// Returns the defaults when no candidate exists.
    ///
    /// # Errors
    /// - `ConfigError` - a candidate exists but is unreadable or invalid
    pub fn load_default() -> Result<(Self, Option<PathBuf>), ConfigError> {
        for candidate in Self::candidate_paths() {
            if candidate.is_file() {
                let config = Self::load_file(&candidate)?;
                return Ok((config, Some(candidate)));
            }
        }
        Ok((Self::default(), None))
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Ok(explicit) = std::env::var("TORRENTFSD_CONFIG") {
            candidates.push(PathBuf::from(explicit));
        }
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(
                PathBuf::from(home)
                    .join(".config")
                    .join("torrentfs")
                    .join("torrentfsd.json"),
            );
        }
        candidates.push(PathBuf::from("/etc/torrentfs/torrentfsd.json"));
        candidates.push(PathBuf::from("config/torrentfsd.json"));
        candidates
    }
}

fn reference_value() -> serde_json::Value {
    serde_json::to_value(DaemonConfig::default()).unwrap_or(serde_json::Value::Null)
}

/// Warns (recursively) about keys present in `actual` but absent from the
/// serialized default configuration.
fn warn_unknown_keys(actual: &serde_json::Value, reference: &serde_json::Value, prefix: &str) {
    let (serde_json::Value::Object(actual), serde_json::Value::Object(reference)) =
        (actual, reference)
    else {
        return;
    };
    for (key, value) in actual {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match reference.get(key) {
            Some(ref_value) => warn_unknown_keys(value, ref_value, &path),
            None => tracing::warn!(key = %path, "ignoring unknown config key"),
        }
    }
}

/// Resolves the control-socket path: `$TORRENTFSD_SOCKET`, then
/// `$XDG_RUNTIME_DIR/torrentfsd.sock`, then `/tmp/torrentfsd.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(explicit) = std::env::var("TORRENTFSD_SOCKET") {
        return PathBuf::from(explicit);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("torrentfsd.sock");
    }
    PathBuf::from("/tmp/torrentfsd.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.max_metadata_bytes(), 100 * 1024 * 1024);
        assert!(!config.skip_check);
        assert_eq!(config.resume.save_interval_s, 60);
        assert_eq!(config.prefetch.mode, PrefetchMode::Media);
        assert!(config.prefetch.media.extensions.contains(&"mkv".to_string()));
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "skip_check": true,
                "checking": {{"max_active": 2}},
                "prefetch": {{"mode": "all", "media": {{"start_pct": 20}}}}
            }}"#
        )
        .unwrap();

        let config = DaemonConfig::load_file(file.path()).unwrap();
        assert!(config.skip_check);
        assert_eq!(config.checking.max_active, 2);
        assert_eq!(config.prefetch.mode, PrefetchMode::All);
        assert_eq!(config.prefetch.media.profile.start_pct, 20.0);
        // Untouched sections keep their defaults.
        assert_eq!(config.resume.save_interval_s, 60);
    }

    #[test]
    fn unknown_keys_do_not_fail_parsing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"no_such_key": 1, "skip_check": true}}"#).unwrap();
        let config = DaemonConfig::load_file(file.path()).unwrap();
        assert!(config.skip_check);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{nope").unwrap();
        assert!(matches!(
            DaemonConfig::load_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn tracker_aliases_expand() {
        let mut trackers = TrackersConfig::default();
        trackers.aliases.insert(
            "torrentfs://main".to_string(),
            vec!["http://a/announce".to_string(), "http://b/announce".to_string()],
        );

        let expanded = trackers.expand(&[
            "torrentfs://main".to_string(),
            "http://c/announce".to_string(),
            "torrentfs://unknown".to_string(),
        ]);
        assert_eq!(
            expanded,
            vec![
                "http://a/announce".to_string(),
                "http://b/announce".to_string(),
                "http://c/announce".to_string(),
            ]
        );
    }
}
