use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use warden_core::{ExitCode, ExitOutcome, InstallationSnapshot, RunId};

use crate::cache_update::CacheUpdater;
use crate::install_sync;
use crate::mutex_gate::{LockError, LockHandle, MutexGate};
use crate::notify::AlertSink;
use crate::process_controller::{self, SignalProcess, StopConfig};
use crate::process_locator;
use crate::profiles::GlobalConfig;
use crate::rcon::{RconClient, RemoteConsole};
use crate::support;

/// What a run feeds back into mutable configuration afterwards. Everything
/// else about a run is an effect on the filesystem or the OS process table.
#[derive(Debug, Clone, Default)]
pub struct RunFeedback {
    pub server_updated: bool,
    pub installed_version: Option<String>,
}

/// Drives the top-level lifecycle operations over one installation or a whole
/// fleet: shutdown, restart, update, and the scheduler-facing auto-update
/// fan-out. Holds the shared collaborators and the per-resource lock gate.
#[derive(Clone)]
pub struct Orchestrator {
    data_dir: PathBuf,
    gate: MutexGate,
    updater: CacheUpdater,
    alerts: Arc<dyn AlertSink>,
    lock_timeout: Duration,
}

impl Orchestrator {
    pub fn new(global: &GlobalConfig, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            data_dir: global.data_dir.clone(),
            gate: MutexGate::new(&global.data_dir),
            updater: CacheUpdater::new(
                global.update_tool.clone(),
                global.cache_dir(),
                global.app_id,
                global.metadata_url(),
            ),
            alerts,
            lock_timeout: support::lock_timeout(),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    async fn lock(&self, resource: &Path) -> Result<LockHandle, ExitOutcome> {
        match self.gate.acquire(resource, self.lock_timeout).await {
            Ok(handle) => Ok(handle),
            Err(err @ LockError::Busy { .. }) => Err(ExitOutcome::failure(
                ExitCode::ProcessAlreadyRunning,
                err.to_string(),
            )),
            Err(err) => Err(ExitOutcome::failure(ExitCode::UnknownError, err.to_string())),
        }
    }

    /// A console is only available when the profile carries a console port,
    /// and only when the configured address is a plausible endpoint.
    fn console_for(
        &self,
        snapshot: &InstallationSnapshot,
    ) -> Result<Option<RconClient>, ExitOutcome> {
        let Some(port) = snapshot.rcon_port else {
            return Ok(None);
        };
        if snapshot.server_ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ExitOutcome::failure(
                ExitCode::BadEndpoint,
                format!(
                    "{}: invalid console endpoint {}:{port}",
                    snapshot.profile_name, snapshot.server_ip
                ),
            ));
        }
        Ok(Some(RconClient::new(
            snapshot.server_ip.clone(),
            port,
            snapshot.rcon_password.clone(),
        )))
    }

    /// Locates the profile's server process and, when found, runs the full
    /// escalating stop. Returns whether a process was running at all.
    async fn stop_running_server(
        &self,
        snapshot: &InstallationSnapshot,
    ) -> Result<bool, ExitOutcome> {
        let handle = match process_locator::find(&snapshot.server_exe) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                tracing::info!(
                    profile = %snapshot.profile_name,
                    exe = %snapshot.server_exe.display(),
                    "no running server process"
                );
                return Ok(false);
            }
            Err(err) => {
                return Err(ExitOutcome::failure(
                    ExitCode::CommandLineLookupFailed,
                    support::format_error_chain(&err),
                ));
            }
        };

        let console = self.console_for(snapshot)?;
        let process = SignalProcess::attach(&handle);
        let cfg = StopConfig::for_snapshot(snapshot);
        process_controller::stop_server(
            &process,
            console.as_ref().map(|c| c as &dyn RemoteConsole),
            &cfg,
            self.alerts.as_ref(),
            &snapshot.profile_name,
        )
        .await?;

        self.backup_world(snapshot);
        Ok(true)
    }

    /// Best-effort world backup after a confirmed stop. Failures are logged,
    /// never fatal: a backup must not block a restart or an update.
    fn backup_world(&self, snapshot: &InstallationSnapshot) {
        let Some(save) = &snapshot.world_save_path else {
            return;
        };
        if !save.is_file() {
            tracing::debug!(path = %save.display(), "no world save to back up");
            return;
        }

        let backups = snapshot.install_dir.join("backups");
        let name = save
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "world".to_string());
        let dst = backups.join(format!("{name}.{}", Utc::now().format("%Y%m%d-%H%M%S")));

        let result =
            std::fs::create_dir_all(&backups).and_then(|()| std::fs::copy(save, &dst));
        match result {
            Ok(bytes) => {
                tracing::info!(profile = %snapshot.profile_name, dst = %dst.display(), bytes, "world backed up");
            }
            Err(err) => {
                tracing::warn!(profile = %snapshot.profile_name, "world backup failed: {err}");
            }
        }
    }

    /// Spawns the profile's launcher detached in its own session, so the
    /// server outlives this process.
    async fn start_server(&self, snapshot: &InstallationSnapshot) -> Result<(), ExitOutcome> {
        if !snapshot.launcher.is_file() {
            return Err(ExitOutcome::failure(
                ExitCode::BadLauncher,
                format!(
                    "{}: launcher {} not found",
                    snapshot.profile_name,
                    snapshot.launcher.display()
                ),
            ));
        }

        let mut cmd = tokio::process::Command::new(&snapshot.launcher);
        cmd.args(&snapshot.launcher_args)
            .current_dir(&snapshot.install_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        match cmd.spawn() {
            Ok(child) => {
                tracing::info!(
                    profile = %snapshot.profile_name,
                    pid = child.id(),
                    launcher = %snapshot.launcher.display(),
                    "server started"
                );
                self.alerts.notify(
                    "server started",
                    &format!("{} started", snapshot.profile_name),
                    false,
                );
                Ok(())
            }
            Err(err) => Err(ExitOutcome::failure(
                ExitCode::RestartFailed,
                format!(
                    "{}: spawn {}: {err}",
                    snapshot.profile_name,
                    snapshot.launcher.display()
                ),
            )),
        }
    }

    /// Stops the profile's server. A shutdown of a server that is not running
    /// is an error: the scheduler should know its model of the world is off.
    pub async fn shutdown(&self, snapshot: &InstallationSnapshot) -> ExitOutcome {
        let run = RunId::new();
        tracing::info!(%run, profile = %snapshot.profile_name, "shutdown requested");

        let _lock = match self.lock(&snapshot.install_dir).await {
            Ok(lock) => lock,
            Err(outcome) => return outcome,
        };

        match self.stop_running_server(snapshot).await {
            Ok(true) => ExitOutcome::success(),
            Ok(false) => ExitOutcome::failure(
                ExitCode::ServerProcessNotFound,
                format!(
                    "{}: no running process for {}",
                    snapshot.profile_name,
                    snapshot.server_exe.display()
                ),
            ),
            Err(outcome) => outcome,
        }
    }

    /// Stops (when running) and starts the profile's server. A server that
    /// was not running is only brought up when the profile opts into
    /// start-after-shutdown.
    pub async fn restart(&self, snapshot: &InstallationSnapshot) -> ExitOutcome {
        let run = RunId::new();
        tracing::info!(%run, profile = %snapshot.profile_name, "restart requested");

        let _lock = match self.lock(&snapshot.install_dir).await {
            Ok(lock) => lock,
            Err(outcome) => return outcome,
        };

        let was_running = match self.stop_running_server(snapshot).await {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };

        if !was_running && !snapshot.restart_if_shutdown {
            tracing::info!(profile = %snapshot.profile_name, "server was down, start skipped");
            let mut outcome = ExitOutcome::success();
            outcome.push_detail(format!(
                "{}: server was not running, start skipped",
                snapshot.profile_name
            ));
            return outcome;
        }

        if let Err(outcome) = self.start_server(snapshot).await {
            return outcome;
        }
        ExitOutcome::success()
    }

    /// Applies the cached server files and mod contents to the installation
    /// when the cache markers say they are newer. A current installation is a
    /// successful no-op that never touches the running server.
    pub async fn update(
        &self,
        snapshot: &InstallationSnapshot,
    ) -> (ExitOutcome, RunFeedback) {
        let run = RunId::new();
        tracing::info!(%run, profile = %snapshot.profile_name, "update requested");

        let mut feedback = RunFeedback::default();
        let _lock = match self.lock(&snapshot.install_dir).await {
            Ok(lock) => lock,
            Err(outcome) => return (outcome, feedback),
        };

        let server_stale =
            install_sync::needs_update(&snapshot.install_dir, self.updater.server_cache_dir());
        let mods_dir = snapshot.install_dir.join("mods");
        let stale_mods: Vec<u64> = snapshot
            .mod_ids
            .iter()
            .copied()
            .filter(|id| {
                install_sync::mod_needs_update(
                    &mods_dir.join(id.to_string()),
                    &self.updater.mod_cache_dir(*id),
                )
            })
            .collect();

        if !server_stale && stale_mods.is_empty() {
            tracing::info!(profile = %snapshot.profile_name, "installation already current");
            // A prior shutdown may have left the server down; opted-in
            // profiles get it brought back up even without an update.
            if snapshot.restart_if_shutdown {
                let running = match process_locator::find(&snapshot.server_exe) {
                    Ok(found) => found.is_some(),
                    Err(err) => {
                        return (
                            ExitOutcome::failure(
                                ExitCode::CommandLineLookupFailed,
                                support::format_error_chain(&err),
                            ),
                            feedback,
                        );
                    }
                };
                if !running {
                    if let Err(outcome) = self.start_server(snapshot).await {
                        return (outcome, feedback);
                    }
                }
            }
            return (ExitOutcome::success(), feedback);
        }

        self.alerts.notify(
            "update started",
            &format!(
                "{}: applying cached update (server={server_stale}, mods={})",
                snapshot.profile_name,
                stale_mods.len()
            ),
            false,
        );

        let was_running = match self.stop_running_server(snapshot).await {
            Ok(v) => v,
            Err(outcome) => return (outcome, feedback),
        };

        let mut outcome = ExitOutcome::success();

        if server_stale {
            let cache_dir = self.updater.server_cache_dir();
            let version =
                install_sync::read_timestamp_marker(&install_sync::cache_marker_path(cache_dir))
                    .unwrap_or_else(Utc::now);

            match install_sync::apply(cache_dir, &snapshot.install_dir, true) {
                Ok(copied) => {
                    // The smart copy can skip the marker file itself when the
                    // destination's is same-sized and newer; write it
                    // explicitly so the comparison converges.
                    if let Err(err) = install_sync::write_timestamp_marker(
                        &install_sync::install_marker_path(&snapshot.install_dir),
                        version,
                    ) {
                        return (
                            ExitOutcome::failure(
                                ExitCode::ServerUpdateFailed,
                                support::format_error_chain(&err),
                            ),
                            feedback,
                        );
                    }
                    feedback.server_updated = true;
                    feedback.installed_version = Some(version.to_rfc3339());
                    tracing::info!(profile = %snapshot.profile_name, copied, "server files updated");
                }
                Err(err) => {
                    return (
                        ExitOutcome::failure(
                            ExitCode::ServerUpdateFailed,
                            support::format_error_chain(&err),
                        ),
                        feedback,
                    );
                }
            }
        }

        for &mod_id in &stale_mods {
            let cache = self.updater.mod_cache_dir(mod_id);

            // The mod cache is shared across profiles, so hold its lock for
            // the duration of the copy. A busy cache (another run is
            // refreshing it) is skipped, not fatal: the next run catches up.
            let lock = match self.gate.acquire(&cache, self.lock_timeout).await {
                Ok(lock) => lock,
                Err(LockError::Busy { .. }) => {
                    tracing::warn!(mod_id, "mod cache busy, skipping this run");
                    outcome.push_detail(format!("mod {mod_id}: cache busy, skipped"));
                    continue;
                }
                Err(err) => {
                    return (
                        ExitOutcome::failure(ExitCode::ModUpdateFailed, err.to_string()),
                        feedback,
                    );
                }
            };

            let dst = mods_dir.join(mod_id.to_string());
            let applied = install_sync::apply(&cache, &dst, true).and_then(|copied| {
                tracing::info!(profile = %snapshot.profile_name, mod_id, copied, "mod updated");
                match install_sync::read_int_marker(&cache.join(install_sync::MOD_MARKER)) {
                    Some(v) => {
                        install_sync::write_int_marker(&dst.join(install_sync::MOD_MARKER), v)
                    }
                    None => Ok(()),
                }
            });
            drop(lock);

            if let Err(err) = applied {
                return (
                    ExitOutcome::failure(
                        ExitCode::ModUpdateFailed,
                        format!("mod {mod_id}: {}", support::format_error_chain(&err)),
                    ),
                    feedback,
                );
            }
        }

        if was_running || snapshot.restart_if_shutdown {
            if let Err(start_outcome) = self.start_server(snapshot).await {
                return (start_outcome, feedback);
            }
        }

        self.alerts.notify(
            "update finished",
            &format!("{}: update applied", snapshot.profile_name),
            false,
        );
        (outcome, feedback)
    }

    /// Scheduler entry point: refresh the shared caches once, then update
    /// every opted-in profile in parallel. One profile's failure never stops
    /// the others; any failure turns the aggregate into completed-with-errors.
    pub async fn auto_update(
        &self,
        snapshots: Vec<InstallationSnapshot>,
    ) -> (ExitOutcome, Vec<(String, RunFeedback)>) {
        let run = RunId::new();
        tracing::info!(%run, "auto-update requested");

        // One global lock: cache refresh must not race another fan-out.
        let _lock = match self.lock(&self.data_dir).await {
            Ok(lock) => lock,
            Err(outcome) => return (outcome, Vec::new()),
        };

        let targets: Vec<InstallationSnapshot> =
            snapshots.into_iter().filter(|s| s.auto_update).collect();
        if targets.is_empty() {
            let mut outcome = ExitOutcome::success();
            outcome.push_detail("no profiles have auto-update enabled".to_string());
            return (outcome, Vec::new());
        }

        let (_, cache_outcome) = self.updater.refresh_server_cache().await;
        if !cache_outcome.is_success() {
            return (cache_outcome, Vec::new());
        }

        let mut mod_ids: Vec<u64> = targets
            .iter()
            .flat_map(|s| s.mod_ids.iter().copied())
            .collect();
        mod_ids.sort_unstable();
        mod_ids.dedup();
        let mods_outcome = self.updater.refresh_mod_cache(&mod_ids).await;
        if !mods_outcome.is_success() {
            return (mods_outcome, Vec::new());
        }

        let mut workers = Vec::with_capacity(targets.len());
        for snapshot in targets {
            let this = self.clone();
            let key = snapshot.profile_key.clone();
            workers.push((
                key,
                tokio::spawn(async move { this.update(&snapshot).await }),
            ));
        }

        let mut aggregate = ExitOutcome::success();
        let mut feedbacks = Vec::new();
        for (key, worker) in workers {
            match worker.await {
                Ok((outcome, feedback)) => {
                    if outcome.is_success() {
                        for line in outcome.detail {
                            aggregate.push_detail(format!("{key}: {line}"));
                        }
                    } else {
                        aggregate.code = ExitCode::CompletedWithErrors;
                        aggregate.push_detail(format!(
                            "{key}: exit code {}: {}",
                            outcome.code.as_i32(),
                            outcome.detail.join("; ")
                        ));
                    }
                    feedbacks.push((key, feedback));
                }
                Err(err) => {
                    // Worker panicked or was cancelled.
                    aggregate.code = ExitCode::CompletedWithErrors;
                    aggregate.push_detail(format!("{key}: update worker failed: {err}"));
                }
            }
        }

        if !aggregate.is_success() {
            self.alerts.notify(
                "auto-update completed with errors",
                &aggregate.detail.join("\n"),
                true,
            );
        }
        (aggregate, feedbacks)
    }
}
