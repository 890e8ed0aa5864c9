mod cache_update;
mod install_sync;
mod mutex_gate;
mod notify;
mod orchestrator;
mod process_controller;
mod process_locator;
mod profiles;
mod rcon;
mod support;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use warden_core::{ExitCode, ExitOutcome};

use crate::notify::{AlertSink, LogAlertSink};
use crate::orchestrator::{Orchestrator, RunFeedback};
use crate::profiles::GlobalConfig;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Game server lifecycle manager")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Stop a profile's server with the full countdown and escalation.
    Shutdown {
        #[arg(short, long)]
        profile: String,
    },
    /// Stop (when running) and start a profile's server.
    Restart {
        #[arg(short, long)]
        profile: String,
    },
    /// Apply cached server files and mods to a profile's installation.
    Update {
        #[arg(short, long)]
        profile: String,
    },
    /// Refresh the shared caches, then update every opted-in profile.
    AutoUpdate,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::Success
                }
                _ => ExitCode::BadArgument,
            };
            let _ = err.print();
            std::process::exit(code.as_i32());
        }
    };

    let outcome = run(cli).await;
    for line in &outcome.detail {
        if outcome.is_success() {
            tracing::info!("{line}");
        } else {
            tracing::error!("{line}");
        }
    }
    std::process::exit(outcome.code.as_i32());
}

async fn run(cli: Cli) -> ExitOutcome {
    let config = match profiles::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            return ExitOutcome::failure(
                ExitCode::BadArgument,
                support::format_error_chain(&err),
            );
        }
    };

    let global = &config.global;
    if !global.data_dir.is_dir() {
        return ExitOutcome::failure(
            ExitCode::InvalidDataDirectory,
            format!("data directory {} does not exist", global.data_dir.display()),
        );
    }

    let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
    let orchestrator = Orchestrator::new(global, alerts.clone());

    let outcome = match &cli.command {
        CliCommand::Shutdown { profile } => match config.snapshot(profile) {
            Some(snapshot) => orchestrator.shutdown(&snapshot).await,
            None => unknown_profile(profile),
        },

        CliCommand::Restart { profile } => match config.snapshot(profile) {
            None => unknown_profile(profile),
            Some(snapshot) if !snapshot.auto_restart => ExitOutcome::failure(
                ExitCode::AutoRestartNotEnabled,
                format!("profile {profile} does not allow managed restarts"),
            ),
            Some(snapshot) => orchestrator.restart(&snapshot).await,
        },

        CliCommand::Update { profile } => match require_update_tool(global) {
            Some(outcome) => outcome,
            None => match config.snapshot(profile) {
                None => unknown_profile(profile),
                Some(snapshot) if !snapshot.auto_update => ExitOutcome::failure(
                    ExitCode::AutoUpdateNotEnabled,
                    format!("profile {profile} does not allow managed updates"),
                ),
                Some(snapshot) => {
                    let (outcome, feedback) = orchestrator.update(&snapshot).await;
                    record_feedback(&cli.config, &snapshot.profile_key, &feedback, outcome)
                }
            },
        },

        CliCommand::AutoUpdate => match require_update_tool(global) {
            Some(outcome) => outcome,
            None => {
                let (mut outcome, feedbacks) =
                    orchestrator.auto_update(config.snapshots()).await;
                for (key, feedback) in feedbacks {
                    outcome = record_feedback(&cli.config, &key, &feedback, outcome);
                }
                outcome
            }
        },
    };

    if !outcome.is_success() {
        alerts.notify("run failed", &outcome.detail.join("\n"), true);
    }
    outcome
}

fn unknown_profile(profile: &str) -> ExitOutcome {
    ExitOutcome::failure(ExitCode::BadProfile, format!("no profile named {profile}"))
}

fn require_update_tool(global: &GlobalConfig) -> Option<ExitOutcome> {
    if global.update_tool.is_file() {
        return None;
    }
    Some(ExitOutcome::failure(
        ExitCode::UpdateToolNotFound,
        format!("update tool {} does not exist", global.update_tool.display()),
    ))
}

/// Persists a successful update's new installed version back into the
/// configuration file. A recording failure downgrades to a detail line: the
/// update itself already happened.
fn record_feedback(
    config_path: &Path,
    profile_key: &str,
    feedback: &RunFeedback,
    mut outcome: ExitOutcome,
) -> ExitOutcome {
    if !feedback.server_updated {
        return outcome;
    }
    let Some(version) = &feedback.installed_version else {
        return outcome;
    };
    if let Err(err) = profiles::record_installed_version(config_path, profile_key, version) {
        tracing::warn!(profile = profile_key, "installed version not recorded: {err:#}");
        outcome.push_detail(format!(
            "{profile_key}: installed version not recorded: {err:#}"
        ));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["warden", "shutdown", "--profile", "island"]).unwrap();
        assert!(matches!(cli.command, CliCommand::Shutdown { ref profile } if profile == "island"));
        assert_eq!(cli.config, PathBuf::from("warden.toml"));

        let cli =
            Cli::try_parse_from(["warden", "-c", "/etc/warden.toml", "auto-update"]).unwrap();
        assert!(matches!(cli.command, CliCommand::AutoUpdate));
        assert_eq!(cli.config, PathBuf::from("/etc/warden.toml"));
    }

    #[test]
    fn cli_rejects_missing_profile_argument() {
        assert!(Cli::try_parse_from(["warden", "restart"]).is_err());
    }

    #[tokio::test]
    async fn missing_config_file_is_a_bad_argument() {
        let cli = Cli {
            config: PathBuf::from("/definitely/not/a/config.toml"),
            command: CliCommand::AutoUpdate,
        };
        let outcome = run(cli).await;
        assert_eq!(outcome.code, ExitCode::BadArgument);
    }

    #[tokio::test]
    async fn missing_data_dir_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = tmp.path().join("warden.toml");
        std::fs::write(
            &config,
            r#"
[global]
data_dir = "/definitely/not/a/data/dir"
update_tool = "/usr/games/steamcmd"
app_id = 376030
"#,
        )
        .unwrap();

        let cli = Cli {
            config,
            command: CliCommand::AutoUpdate,
        };
        let outcome = run(cli).await;
        assert_eq!(outcome.code, ExitCode::InvalidDataDirectory);
    }

    #[tokio::test]
    async fn missing_update_tool_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        let config = tmp.path().join("warden.toml");
        std::fs::write(
            &config,
            format!(
                r#"
[global]
data_dir = "{}"
update_tool = "{}"
app_id = 376030
"#,
                data_dir.display(),
                tmp.path().join("no-such-tool").display()
            ),
        )
        .unwrap();

        let cli = Cli {
            config,
            command: CliCommand::AutoUpdate,
        };
        let outcome = run(cli).await;
        assert_eq!(outcome.code, ExitCode::UpdateToolNotFound);
    }

    #[tokio::test]
    async fn unknown_profile_is_a_bad_profile() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        let config = tmp.path().join("warden.toml");
        std::fs::write(
            &config,
            format!(
                r#"
[global]
data_dir = "{}"
update_tool = "/usr/games/steamcmd"
app_id = 376030
"#,
                data_dir.display()
            ),
        )
        .unwrap();

        let cli = Cli {
            config,
            command: CliCommand::Shutdown {
                profile: "nope".to_string(),
            },
        };
        let outcome = run(cli).await;
        assert_eq!(outcome.code, ExitCode::BadProfile);
    }
}
