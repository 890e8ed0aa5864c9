use std::path::PathBuf;

/// Correlation id for one orchestration run.
///
/// Parallel fan-out runs share a log stream; the run id tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed exit-code taxonomy shared by every top-level operation.
///
/// Codes are stable contract values surfaced to the task scheduler; do not
/// renumber existing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    // Generic.
    UnknownError = 1,
    UnknownThreadError = 2,
    BadProfile = 3,
    BadArgument = 4,

    // Pre-conditions.
    AutoUpdateNotEnabled = 10,
    AutoRestartNotEnabled = 11,
    ProcessAlreadyRunning = 12,
    InvalidDataDirectory = 13,
    UpdateToolNotFound = 14,

    // Cache refresh.
    ServerCacheUpdateFailed = 20,
    ModCacheUpdateFailed = 21,
    ModMetadataDownloadFailed = 22,

    // Installation sync.
    ServerUpdateFailed = 30,
    ModUpdateFailed = 31,

    // Shutdown.
    CommandLineLookupFailed = 40,
    ShutdownTimeout = 41,
    BadEndpoint = 42,
    ServerProcessNotFound = 43,

    // Restart.
    RestartFailed = 50,
    BadLauncher = 51,

    // Fan-out aggregate: at least one parallel sub-run failed.
    CompletedWithErrors = 60,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// The sole return value of every top-level operation: an exit code plus
/// free-text detail lines. Success is an explicit code, never "no code set".
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExitOutcome {
    pub code: ExitCode,
    pub detail: Vec<String>,
}

impl ExitOutcome {
    pub fn success() -> Self {
        Self {
            code: ExitCode::Success,
            detail: Vec::new(),
        }
    }

    pub fn failure(code: ExitCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: vec![detail.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.code, ExitCode::Success)
    }

    pub fn push_detail(&mut self, line: impl Into<String>) {
        self.detail.push(line.into());
    }
}

/// Immutable per-run view of one installation's configuration.
///
/// Captured once at orchestration start so a run never observes configuration
/// mutated mid-run by another thread. Only `server_updated` and the new
/// installed version are fed back into mutable configuration afterwards.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstallationSnapshot {
    pub profile_key: String,
    pub profile_name: String,
    pub install_dir: PathBuf,
    /// Absolute path of the dedicated server executable inside the
    /// installation; used to locate the running OS process.
    pub server_exe: PathBuf,
    /// What to spawn to bring the server back up.
    pub launcher: PathBuf,
    pub launcher_args: Vec<String>,
    pub server_ip: String,
    pub server_port: u16,
    pub rcon_port: Option<u16>,
    pub rcon_password: String,
    pub map_id: String,
    pub mod_ids: Vec<u64>,
    pub last_installed_version: Option<String>,
    pub scheduler_key: String,
    pub auto_restart: bool,
    pub auto_update: bool,
    /// When false, a restart after a stop is skipped if the server was not
    /// running to begin with.
    pub restart_if_shutdown: bool,
    /// Some installations have no world state worth saving on exit.
    pub save_before_exit: bool,
    pub world_save_path: Option<PathBuf>,
    pub countdown_minutes: u32,
}
