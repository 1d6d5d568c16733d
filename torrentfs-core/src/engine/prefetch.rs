//! Prefetch policy: head/tail range selection and profile matching.
//!
//! Pure range arithmetic lives here; the engine applies the resulting piece
//! plans against the session under its priority lock.

use std::collections::HashSet;

use crate::config::{PrefetchConfig, PrefetchMode, PrefetchProfile};

const MIB: f64 = 1024.0 * 1024.0;

/// Clamped head/tail byte counts for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchRanges {
    pub head_bytes: u64,
    pub tail_bytes: u64,
}

/// Which profile applies to a file, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileChoice {
    Media,
    Other,
    /// `media` mode and the file is not media: no prefetch.
    Skip,
}

/// Per-torrent prefetch accounting: pieces already elevated and the byte
/// budget consumed against `prefetch.max_mb`.
#[derive(Debug, Default)]
pub struct PrefetchState {
    pub pieces: HashSet<u32>,
    pub bytes: u64,
}

impl PrefetchState {
    pub fn covers(&self, piece: u32) -> bool {
        self.pieces.contains(&piece)
    }
}

/// Normalizes a percent input: values above 1 use the 0-100 convention.
pub fn normalize_pct(pct: f64) -> f64 {
    let pct = if pct > 1.0 { pct / 100.0 } else { pct };
    pct.clamp(0.0, 1.0)
}

fn clamp_bytes(size: u64, pct: f64, min_mb: f64, max_mb: f64) -> u64 {
    let min = (min_mb.max(0.0) * MIB) as u64;
    let max = (max_mb.max(0.0) * MIB) as u64;
    let wanted = (normalize_pct(pct) * size as f64) as u64;
    wanted.max(min).min(max.max(min)).min(size)
}

/// Computes the head and tail byte counts for a file under a profile.
pub fn compute_ranges(size: u64, profile: &PrefetchProfile) -> PrefetchRanges {
    PrefetchRanges {
        head_bytes: clamp_bytes(size, profile.start_pct, profile.start_min_mb, profile.start_max_mb),
        tail_bytes: clamp_bytes(size, profile.end_pct, profile.end_min_mb, profile.end_max_mb),
    }
}

/// Concrete `(offset, length)` byte ranges, with head/tail overlap merged.
pub fn byte_ranges(size: u64, ranges: PrefetchRanges) -> Vec<(u64, u64)> {
    if size == 0 {
        return Vec::new();
    }
    let head = ranges.head_bytes.min(size);
    let tail = ranges.tail_bytes.min(size);

    if head + tail >= size {
        return vec![(0, size)];
    }
    let mut out = Vec::new();
    if head > 0 {
        out.push((0, head));
    }
    if tail > 0 {
        out.push((size - tail, tail));
    }
    out
}

/// Selects the profile for a file extension under the configured mode.
pub fn select_profile(config: &PrefetchConfig, extension: Option<&str>) -> ProfileChoice {
    let is_media = extension.is_some_and(|ext| {
        config
            .media
            .extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext))
    });
    if is_media {
        ProfileChoice::Media
    } else {
        match config.mode {
            PrefetchMode::Media => ProfileChoice::Skip,
            PrefetchMode::All => ProfileChoice::Other,
        }
    }
}
