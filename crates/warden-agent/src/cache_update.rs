use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::Context;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use warden_core::{ExitCode, ExitOutcome};

use crate::install_sync::{self, MOD_MARKER};
use crate::support;

/// Markers recognised in the update tool's line-oriented stdout. The tool's
/// output format is a deliberately loose collaborator interface; matching is
/// best-effort by prefix/substring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToolMarker {
    /// A new version is being fetched.
    Downloading,
    /// Terminal success line. Required in addition to a clean exit status.
    Success,
}

pub(crate) fn classify_tool_line(line: &str) -> Option<ToolMarker> {
    let trimmed = line.trim();
    if trimmed.starts_with("Success") {
        return Some(ToolMarker::Success);
    }
    if trimmed.to_lowercase().contains("downloading") {
        return Some(ToolMarker::Downloading);
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ToolRun {
    pub exit_ok: bool,
    pub success_marker: bool,
    pub saw_download: bool,
    /// False when stdout could not be captured; version-change detection then
    /// falls back to the filesystem scan.
    pub captured: bool,
}

impl ToolRun {
    fn succeeded(&self) -> bool {
        // Two-of-two contract: exit status AND the textual success marker.
        self.exit_ok && (self.success_marker || !self.captured)
    }
}

/// Maintains the shared cache (server binaries + mod contents) by invoking
/// the external update tool and tracking per-item marker files. Server files
/// and mods live in sibling trees so a whole-server copy never sweeps mod
/// content along with it.
#[derive(Debug, Clone)]
pub struct CacheUpdater {
    tool: PathBuf,
    server_cache_dir: PathBuf,
    mod_cache_root: PathBuf,
    app_id: u32,
    metadata_url: String,
}

impl CacheUpdater {
    pub fn new(
        tool: PathBuf,
        cache_root: PathBuf,
        app_id: u32,
        metadata_url: impl Into<String>,
    ) -> Self {
        Self {
            tool,
            server_cache_dir: cache_root.join("server"),
            mod_cache_root: cache_root.join("mods"),
            app_id,
            metadata_url: metadata_url.into(),
        }
    }

    pub fn server_cache_dir(&self) -> &Path {
        &self.server_cache_dir
    }

    pub fn mod_cache_dir(&self, mod_id: u64) -> PathBuf {
        self.mod_cache_root.join(mod_id.to_string())
    }

    async fn run_update_tool(&self, args: &[String]) -> anyhow::Result<ToolRun> {
        let mut cmd = Command::new(&self.tool);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn update tool {}", self.tool.display()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(err) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!("[update-tool stderr] {line}");
                }
            });
        }

        let mut success_marker = false;
        let mut saw_download = false;
        let captured = stdout.is_some();

        if let Some(out) = stdout {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("[update-tool] {line}");
                match classify_tool_line(&line) {
                    Some(ToolMarker::Success) => success_marker = true,
                    Some(ToolMarker::Downloading) => saw_download = true,
                    None => {}
                }
            }
        }

        let status = child.wait().await.context("wait update tool")?;
        Ok(ToolRun {
            exit_ok: status.success(),
            success_marker,
            saw_download,
            captured,
        })
    }

    /// Refreshes the shared server-files cache. Returns whether a new version
    /// was detected, plus the outcome.
    pub async fn refresh_server_cache(&self) -> (bool, ExitOutcome) {
        let started_wall = Utc::now();
        let started_fs = SystemTime::now();

        if let Err(err) = std::fs::create_dir_all(&self.server_cache_dir) {
            return (
                false,
                ExitOutcome::failure(
                    ExitCode::ServerCacheUpdateFailed,
                    format!("create cache dir {}: {err}", self.server_cache_dir.display()),
                ),
            );
        }

        let args = vec![
            "+force_install_dir".to_string(),
            self.server_cache_dir.display().to_string(),
            "+login".to_string(),
            "anonymous".to_string(),
            "+app_update".to_string(),
            self.app_id.to_string(),
            "validate".to_string(),
            "+quit".to_string(),
        ];

        let run = match self.run_update_tool(&args).await {
            Ok(run) => run,
            Err(err) => {
                return (
                    false,
                    ExitOutcome::failure(
                        ExitCode::ServerCacheUpdateFailed,
                        support::format_error_chain(&err),
                    ),
                );
            }
        };

        if !run.succeeded() {
            return (
                false,
                ExitOutcome::failure(
                    ExitCode::ServerCacheUpdateFailed,
                    format!(
                        "update tool did not confirm success (exit_ok={}, marker={})",
                        run.exit_ok, run.success_marker
                    ),
                ),
            );
        }

        // Primary signal is the stdout "downloading" marker. Without captured
        // output, fall back to scanning for files touched since the run
        // started (steamapps bookkeeping excluded).
        let updated = if run.captured {
            run.saw_download
        } else {
            scan_modified_since(&self.server_cache_dir, started_fs, "steamapps")
        };

        if updated {
            let marker = install_sync::cache_marker_path(&self.server_cache_dir);
            if let Err(err) = install_sync::write_timestamp_marker(&marker, started_wall) {
                return (
                    true,
                    ExitOutcome::failure(
                        ExitCode::ServerCacheUpdateFailed,
                        support::format_error_chain(&err),
                    ),
                );
            }
            tracing::info!(cache = %self.server_cache_dir.display(), "server cache updated");
        } else {
            tracing::info!(cache = %self.server_cache_dir.display(), "server cache already current");
        }

        (updated, ExitOutcome::success())
    }

    /// Refreshes the mod cache for `mod_ids`. Staleness is decided against
    /// the upstream bulk metadata; the first failing mod aborts the rest.
    pub async fn refresh_mod_cache(&self, mod_ids: &[u64]) -> ExitOutcome {
        if mod_ids.is_empty() {
            return ExitOutcome::success();
        }

        let upstream = match self.fetch_mod_metadata(mod_ids).await {
            Ok(map) => map,
            Err(err) => {
                return ExitOutcome::failure(
                    ExitCode::ModMetadataDownloadFailed,
                    support::format_error_chain(&err),
                );
            }
        };

        for &mod_id in mod_ids {
            let Some(&time_updated) = upstream.get(&mod_id) else {
                tracing::info!(mod_id, "metadata service did not return this mod, skipping");
                continue;
            };

            let mod_dir = self.mod_cache_dir(mod_id);
            let marker = mod_dir.join(MOD_MARKER);

            // Zero upstream time means private/unlisted: always treat as stale.
            let cached = install_sync::read_int_marker(&marker).unwrap_or(0);
            let stale = time_updated == 0 || time_updated > cached;
            if !stale {
                tracing::debug!(mod_id, "mod cache current");
                continue;
            }

            if let Err(err) = std::fs::create_dir_all(&mod_dir) {
                return ExitOutcome::failure(
                    ExitCode::ModCacheUpdateFailed,
                    format!("create mod cache {}: {err}", mod_dir.display()),
                );
            }

            let args = vec![
                "+force_install_dir".to_string(),
                mod_dir.display().to_string(),
                "+login".to_string(),
                "anonymous".to_string(),
                "+workshop_download_item".to_string(),
                self.app_id.to_string(),
                mod_id.to_string(),
                "+quit".to_string(),
            ];

            let ok = match self.run_update_tool(&args).await {
                Ok(run) => run.succeeded(),
                Err(err) => {
                    tracing::warn!(mod_id, "mod update tool failed: {err:#}");
                    false
                }
            };
            if !ok {
                // Fail fast: remaining mods are not attempted.
                return ExitOutcome::failure(
                    ExitCode::ModCacheUpdateFailed,
                    format!("mod {mod_id} cache update failed"),
                );
            }

            let marker_value = if time_updated == 0 {
                Utc::now().timestamp().max(0) as u64
            } else {
                time_updated
            };
            if let Err(err) = install_sync::write_int_marker(&marker, marker_value) {
                return ExitOutcome::failure(
                    ExitCode::ModCacheUpdateFailed,
                    support::format_error_chain(&err),
                );
            }
            tracing::info!(mod_id, time_updated, "mod cache updated");
        }

        ExitOutcome::success()
    }

    /// Bulk "time updated" lookup, keyed by mod id. Ids the service did not
    /// return are simply absent from the map.
    async fn fetch_mod_metadata(&self, mod_ids: &[u64]) -> anyhow::Result<HashMap<u64, u64>> {
        let client = reqwest::Client::builder()
            .user_agent("warden-agent")
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        let mut form = vec![("itemcount".to_string(), mod_ids.len().to_string())];
        for (i, id) in mod_ids.iter().enumerate() {
            form.push((format!("publishedfileids[{i}]"), id.to_string()));
        }

        let resp = client
            .post(&self.metadata_url)
            .form(&form)
            .send()
            .await
            .context("request mod metadata")?
            .error_for_status()
            .context("mod metadata returned non-2xx")?;

        let body: MetadataResponse = resp.json().await.context("parse mod metadata json")?;
        Ok(parse_metadata(&body))
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct MetadataResponse {
    response: MetadataBody,
}

#[derive(Debug, serde::Deserialize)]
struct MetadataBody {
    #[serde(default)]
    publishedfiledetails: Vec<FileDetail>,
}

#[derive(Debug, serde::Deserialize)]
struct FileDetail {
    publishedfileid: String,
    #[serde(default)]
    time_updated: u64,
}

pub(crate) fn parse_metadata(body: &MetadataResponse) -> HashMap<u64, u64> {
    let mut out = HashMap::new();
    for detail in &body.response.publishedfiledetails {
        if let Ok(id) = detail.publishedfileid.parse::<u64>() {
            out.insert(id, detail.time_updated);
        }
    }
    out
}

/// Best-effort fallback: true when any file under `dir` (excluding the named
/// subtree) has a modification time at or after `since`. Unrelated
/// filesystem touches can produce false positives; that is accepted.
pub(crate) fn scan_modified_since(dir: &Path, since: SystemTime, exclude: &str) -> bool {
    let rd = match std::fs::read_dir(dir) {
        Ok(v) => v,
        Err(_) => return false,
    };
    for entry in rd.flatten() {
        let path = entry.path();
        let ty = match entry.file_type() {
            Ok(v) => v,
            Err(_) => continue,
        };
        if ty.is_dir() {
            if path.file_name().and_then(|n| n.to_str()) == Some(exclude) {
                continue;
            }
            if scan_modified_since(&path, since, exclude) {
                return true;
            }
            continue;
        }
        if !ty.is_file() {
            continue;
        }
        if let Ok(meta) = entry.metadata()
            && let Ok(modified) = meta.modified()
            && modified >= since
        {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tool_line_classification() {
        assert_eq!(
            classify_tool_line("Success! App '376030' fully installed."),
            Some(ToolMarker::Success)
        );
        assert_eq!(classify_tool_line(" Success."), Some(ToolMarker::Success));
        assert_eq!(
            classify_tool_line("Update state (0x61) downloading, progress: 12.04"),
            Some(ToolMarker::Downloading)
        );
        assert_eq!(classify_tool_line("Logging in user 'anonymous'"), None);
        assert_eq!(classify_tool_line(""), None);
    }

    #[test]
    fn success_requires_both_signals() {
        let both = ToolRun {
            exit_ok: true,
            success_marker: true,
            saw_download: false,
            captured: true,
        };
        assert!(both.succeeded());

        let marker_only = ToolRun {
            exit_ok: false,
            ..both
        };
        assert!(!marker_only.succeeded());

        let exit_only = ToolRun {
            success_marker: false,
            ..both
        };
        assert!(!exit_only.succeeded());

        // Without captured output the marker cannot be required.
        let uncaptured = ToolRun {
            success_marker: false,
            captured: false,
            ..both
        };
        assert!(uncaptured.succeeded());
    }

    #[test]
    fn metadata_parse_tolerates_missing_time() {
        let json = r#"{
            "response": {
                "result": 1,
                "publishedfiledetails": [
                    {"publishedfileid": "111", "time_updated": 1700000000},
                    {"publishedfileid": "222"},
                    {"publishedfileid": "not-a-number", "time_updated": 5}
                ]
            }
        }"#;
        let body: MetadataResponse = serde_json::from_str(json).unwrap();
        let map = parse_metadata(&body);
        assert_eq!(map.get(&111), Some(&1_700_000_000));
        assert_eq!(map.get(&222), Some(&0));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn scan_respects_excluded_subtree() {
        let tmp = tempfile::tempdir().unwrap();
        let since = SystemTime::now() - Duration::from_secs(60);

        std::fs::create_dir_all(tmp.path().join("steamapps")).unwrap();
        std::fs::write(tmp.path().join("steamapps/app.acf"), b"x").unwrap();
        assert!(!scan_modified_since(tmp.path(), since, "steamapps"));

        std::fs::create_dir_all(tmp.path().join("bin")).unwrap();
        std::fs::write(tmp.path().join("bin/server"), b"x").unwrap();
        assert!(scan_modified_since(tmp.path(), since, "steamapps"));

        // Nothing newer than the far future.
        let future = SystemTime::now() + Duration::from_secs(3600);
        assert!(!scan_modified_since(tmp.path(), future, "steamapps"));
    }

    #[cfg(unix)]
    fn write_tool_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-steamcmd.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn refresh_detects_new_version_and_writes_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = write_tool_script(
            tmp.path(),
            "echo \"Update state (0x61) downloading, progress: 1.0\"\n\
             echo \"Success! App fully installed.\"",
        );
        let cache = tmp.path().join("cache");
        let updater = CacheUpdater::new(tool, cache, 376030, "http://unused.invalid");

        let (updated, outcome) = updater.refresh_server_cache().await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert!(updated);
        let marker = install_sync::cache_marker_path(updater.server_cache_dir());
        assert!(install_sync::read_timestamp_marker(&marker).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn refresh_without_download_marker_is_current() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = write_tool_script(tmp.path(), "echo \"Success! App fully installed.\"");
        let cache = tmp.path().join("cache");
        let updater = CacheUpdater::new(tool, cache, 376030, "http://unused.invalid");

        let (updated, outcome) = updater.refresh_server_cache().await;
        assert!(outcome.is_success());
        assert!(!updated);
        let marker = install_sync::cache_marker_path(updater.server_cache_dir());
        assert!(install_sync::read_timestamp_marker(&marker).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn refresh_fails_without_success_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = write_tool_script(tmp.path(), "echo \"something went sideways\"");
        let updater = CacheUpdater::new(
            tool,
            tmp.path().join("cache"),
            376030,
            "http://unused.invalid",
        );

        let (updated, outcome) = updater.refresh_server_cache().await;
        assert!(!updated);
        assert_eq!(outcome.code, warden_core::ExitCode::ServerCacheUpdateFailed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn refresh_fails_on_bad_exit_even_with_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = write_tool_script(tmp.path(), "echo \"Success.\"\nexit 7");
        let updater = CacheUpdater::new(
            tool,
            tmp.path().join("cache"),
            376030,
            "http://unused.invalid",
        );

        let (_, outcome) = updater.refresh_server_cache().await;
        assert_eq!(outcome.code, warden_core::ExitCode::ServerCacheUpdateFailed);
    }

    #[tokio::test]
    async fn missing_tool_is_a_cache_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let updater = CacheUpdater::new(
            tmp.path().join("does-not-exist"),
            tmp.path().join("cache"),
            376030,
            "http://unused.invalid",
        );
        let (updated, outcome) = updater.refresh_server_cache().await;
        assert!(!updated);
        assert_eq!(outcome.code, warden_core::ExitCode::ServerCacheUpdateFailed);
    }
}
