use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};

/// Marker file written next to the server cache root and each installation
/// root: an RFC-3339 timestamp recording "as of when" the tree was current.
pub const VERSION_MARKER: &str = ".warden-version";

/// Marker file next to each mod cache/install directory: the upstream
/// integer `time_updated` value.
pub const MOD_MARKER: &str = ".warden-mod-version";

/// Tolerant read: missing or unparsable markers are `None` ("unknown"); the
/// caller decides whether that means oldest-possible or skip.
pub fn read_timestamp_marker(path: &Path) -> Option<DateTime<Utc>> {
    let raw = std::fs::read_to_string(path).ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub fn write_timestamp_marker(path: &Path, at: DateTime<Utc>) -> anyhow::Result<()> {
    std::fs::write(path, format!("{}\n", at.to_rfc3339()))
        .with_context(|| format!("write marker {}", path.display()))
}

pub fn read_int_marker(path: &Path) -> Option<u64> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse::<u64>().ok()
}

pub fn write_int_marker(path: &Path, value: u64) -> anyhow::Result<()> {
    std::fs::write(path, format!("{value}\n"))
        .with_context(|| format!("write marker {}", path.display()))
}

pub fn install_marker_path(install_dir: &Path) -> PathBuf {
    install_dir.join(VERSION_MARKER)
}

pub fn cache_marker_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(VERSION_MARKER)
}

/// Simple ordering: cache marker newer than installation marker means an
/// update is required. A missing installation marker counts as infinitely
/// old; a missing cache marker means there is nothing to compare against, so
/// no update.
pub fn needs_update(install_dir: &Path, cache_dir: &Path) -> bool {
    let Some(cache) = read_timestamp_marker(&cache_marker_path(cache_dir)) else {
        return false;
    };
    match read_timestamp_marker(&install_marker_path(install_dir)) {
        Some(install) => cache > install,
        None => true,
    }
}

/// Same rule for a single mod, on integer markers.
pub fn mod_needs_update(install_mod_dir: &Path, cache_mod_dir: &Path) -> bool {
    let Some(cache) = read_int_marker(&cache_mod_dir.join(MOD_MARKER)) else {
        return false;
    };
    match read_int_marker(&install_mod_dir.join(MOD_MARKER)) {
        Some(install) => cache > install,
        None => true,
    }
}

/// Recursive copy of `src` into `dst`, returning the number of files written.
///
/// With `smart_copy`, a file is skipped only when the destination exists with
/// identical byte length and an equal-or-later modification time; anything
/// else is unconditionally overwritten.
pub fn apply(src: &Path, dst: &Path, smart_copy: bool) -> anyhow::Result<u64> {
    std::fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;

    let mut copied = 0u64;
    let entries =
        std::fs::read_dir(src).with_context(|| format!("read dir {}", src.display()))?;
    for entry in entries {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ty = entry.file_type()?;

        if ty.is_dir() {
            copied += apply(&from, &to, smart_copy)?;
            continue;
        }
        if !ty.is_file() {
            continue;
        }

        if smart_copy && destination_matches(&from, &to) {
            continue;
        }

        std::fs::copy(&from, &to)
            .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        copied += 1;
    }
    Ok(copied)
}

fn destination_matches(src: &Path, dst: &Path) -> bool {
    let Ok(src_meta) = std::fs::metadata(src) else {
        return false;
    };
    let Ok(dst_meta) = std::fs::metadata(dst) else {
        return false;
    };
    if src_meta.len() != dst_meta.len() {
        return false;
    }
    match (src_meta.modified(), dst_meta.modified()) {
        (Ok(src_m), Ok(dst_m)) => dst_m >= src_m,
        _ => false,
    }
}
