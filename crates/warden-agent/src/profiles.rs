use std::path::{Path, PathBuf};

use anyhow::Context;
use warden_core::InstallationSnapshot;

pub const DEFAULT_METADATA_URL: &str =
    "https://api.steampowered.com/ISteamRemoteStorage/GetPublishedFileDetails/v1/";

fn default_countdown_minutes() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GlobalConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    pub update_tool: PathBuf,
    pub app_id: u32,
    #[serde(default)]
    pub metadata_url: Option<String>,
}

impl GlobalConfig {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache"))
    }

    pub fn metadata_url(&self) -> String {
        self.metadata_url
            .clone()
            .unwrap_or_else(|| DEFAULT_METADATA_URL.to_string())
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProfileConfig {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub install_dir: PathBuf,
    /// Relative paths resolve against `install_dir`.
    pub server_exe: PathBuf,
    #[serde(default)]
    pub launcher: Option<PathBuf>,
    #[serde(default)]
    pub launcher_args: Vec<String>,
    #[serde(default)]
    pub server_ip: Option<String>,
    #[serde(default)]
    pub server_port: Option<u16>,
    #[serde(default)]
    pub rcon_port: Option<u16>,
    #[serde(default)]
    pub rcon_password: String,
    #[serde(default)]
    pub map: String,
    #[serde(default)]
    pub mods: Vec<u64>,
    #[serde(default)]
    pub last_installed_version: Option<String>,
    #[serde(default)]
    pub server_updated: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub restart_if_shutdown: bool,
    #[serde(default = "default_true")]
    pub save_before_exit: bool,
    #[serde(default)]
    pub world_save: Option<PathBuf>,
    #[serde(default = "default_countdown_minutes")]
    pub countdown_minutes: u32,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub global: GlobalConfig,
    #[serde(default, rename = "profile")]
    pub profiles: Vec<ProfileConfig>,
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: Config =
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

impl Config {
    pub fn profile(&self, key: &str) -> Option<&ProfileConfig> {
        self.profiles.iter().find(|p| p.key == key)
    }

    /// Captures an immutable per-run snapshot for one profile. Anything a
    /// running orchestration needs is copied here up front.
    pub fn snapshot(&self, key: &str) -> Option<InstallationSnapshot> {
        let p = self.profile(key)?;
        Some(snapshot_of(p))
    }

    pub fn snapshots(&self) -> Vec<InstallationSnapshot> {
        self.profiles.iter().map(snapshot_of).collect()
    }
}

fn snapshot_of(p: &ProfileConfig) -> InstallationSnapshot {
    let server_exe = resolve(&p.install_dir, &p.server_exe);
    let launcher = p
        .launcher
        .as_ref()
        .map(|l| resolve(&p.install_dir, l))
        .unwrap_or_else(|| server_exe.clone());

    InstallationSnapshot {
        profile_key: p.key.clone(),
        profile_name: p.name.clone().unwrap_or_else(|| p.key.clone()),
        install_dir: p.install_dir.clone(),
        server_exe,
        launcher,
        launcher_args: p.launcher_args.clone(),
        server_ip: p.server_ip.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
        server_port: p.server_port.unwrap_or(0),
        rcon_port: p.rcon_port,
        rcon_password: p.rcon_password.clone(),
        map_id: p.map.clone(),
        mod_ids: p.mods.clone(),
        last_installed_version: p.last_installed_version.clone(),
        scheduler_key: p.key.clone(),
        auto_restart: p.auto_restart,
        auto_update: p.auto_update,
        restart_if_shutdown: p.restart_if_shutdown,
        save_before_exit: p.save_before_exit,
        world_save_path: p.world_save.as_ref().map(|w| resolve(&p.install_dir, w)),
        countdown_minutes: p.countdown_minutes,
    }
}

/// Feeds the result of a successful update back into the config file: the
/// profile's recorded installed version and the server-updated flag. These
/// are the only two fields a run mutates.
pub fn record_installed_version(
    path: &Path,
    profile_key: &str,
    version: &str,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut doc: toml::Value = raw
        .parse()
        .with_context(|| format!("parse config {}", path.display()))?;

    let profiles = doc
        .get_mut("profile")
        .and_then(|v| v.as_array_mut())
        .context("config has no [[profile]] tables")?;

    let entry = profiles
        .iter_mut()
        .filter_map(|v| v.as_table_mut())
        .find(|t| t.get("key").and_then(|k| k.as_str()) == Some(profile_key))
        .with_context(|| format!("no profile with key {profile_key}"))?;

    entry.insert(
        "last_installed_version".to_string(),
        toml::Value::String(version.to_string()),
    );
    entry.insert("server_updated".to_string(), toml::Value::Boolean(true));

    let out = toml::to_string_pretty(&doc).context("serialize config")?;
    std::fs::write(path, out).with_context(|| format!("write config {}", path.display()))?;
    Ok(())
}
