use std::time::Duration;

use tokio::sync::watch;
use warden_core::{ExitCode, ExitOutcome};

use crate::notify::AlertSink;
use crate::process_locator::ProcessHandle;
use crate::rcon::{self, RemoteConsole};
use crate::support;

pub const EXIT_COMMAND: &str = "doexit";
pub const SAVE_COMMAND: &str = "saveworld";
pub const LIST_PLAYERS_COMMAND: &str = "listplayers";
pub const BROADCAST_COMMAND: &str = "broadcast";

/// Which escalation stage confirmed the exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppedVia {
    ProtocolExit,
    WindowClose,
    Interrupt,
    ForceKill,
}

/// Seam between the escalation logic and the OS. The real implementation
/// signals the located pid; tests substitute a scripted process.
#[async_trait::async_trait]
pub trait StoppableProcess: Send + Sync {
    /// Single-completion exit event. Registered once before escalation starts
    /// and observed by every stage's timed wait, so a delayed exit from an
    /// earlier stage still satisfies a later stage.
    fn exit_events(&self) -> watch::Receiver<bool>;

    /// Graceful window-close request (SIGTERM on Unix).
    async fn close_window(&self) -> anyhow::Result<()>;

    /// Terminate/interrupt signal (SIGINT on Unix).
    async fn interrupt(&self) -> anyhow::Result<()>;

    /// Unconditional termination.
    async fn kill(&self) -> anyhow::Result<()>;
}

/// Real process handle driven by signals, with a background poller that
/// completes the shared exit event when the pid disappears.
pub struct SignalProcess {
    pid: i32,
    exited: watch::Receiver<bool>,
}

impl SignalProcess {
    pub fn attach(handle: &ProcessHandle) -> Self {
        let (tx, rx) = watch::channel(false);
        let pid = handle.pid;
        tokio::spawn(async move {
            loop {
                if !process_alive(pid) {
                    let _ = tx.send(true);
                    break;
                }
                tokio::time::sleep(support::exit_poll_interval()).await;
            }
        });
        Self { pid, exited: rx }
    }
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the pid exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: i32) -> anyhow::Result<()> {
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Already gone is fine; the exit poller will confirm.
        if err.raw_os_error() != Some(libc::ESRCH) {
            anyhow::bail!("kill({pid}, {signal}): {err}");
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl StoppableProcess for SignalProcess {
    fn exit_events(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }

    #[cfg(unix)]
    async fn close_window(&self) -> anyhow::Result<()> {
        send_signal(self.pid, libc::SIGTERM)
    }

    #[cfg(unix)]
    async fn interrupt(&self) -> anyhow::Result<()> {
        send_signal(self.pid, libc::SIGINT)
    }

    #[cfg(unix)]
    async fn kill(&self) -> anyhow::Result<()> {
        send_signal(self.pid, libc::SIGKILL)
    }

    #[cfg(not(unix))]
    async fn close_window(&self) -> anyhow::Result<()> {
        anyhow::bail!("signals unsupported on this platform")
    }

    #[cfg(not(unix))]
    async fn interrupt(&self) -> anyhow::Result<()> {
        anyhow::bail!("signals unsupported on this platform")
    }

    #[cfg(not(unix))]
    async fn kill(&self) -> anyhow::Result<()> {
        anyhow::bail!("signals unsupported on this platform")
    }
}

/// Per-stop tuning, captured from the profile snapshot plus env tunables so
/// tests can shrink the simulated minute and stage waits.
#[derive(Debug, Clone)]
pub struct StopConfig {
    pub countdown_minutes: u32,
    pub save_before_exit: bool,
    pub minute: Duration,
    pub stage_wait: Duration,
    pub exit_settle: Duration,
    pub save_settle: Duration,
}

impl StopConfig {
    pub fn for_snapshot(snapshot: &warden_core::InstallationSnapshot) -> Self {
        Self {
            countdown_minutes: snapshot.countdown_minutes,
            save_before_exit: snapshot.save_before_exit,
            minute: support::countdown_minute(),
            stage_wait: support::stage_wait(),
            exit_settle: support::exit_settle(),
            save_settle: support::save_settle(),
        }
    }
}

pub(crate) enum Broadcast {
    Scheduled,
    Final,
}

/// Broadcast schedule for one countdown iteration: always at the first
/// minute, every 5th minute while >=5 remain, every minute at 2-4 remaining,
/// and a distinct final message at <=1.
pub(crate) fn countdown_broadcast(total: u32, remaining: u32) -> Option<Broadcast> {
    if remaining <= 1 {
        return Some(Broadcast::Final);
    }
    if (2..=4).contains(&remaining) {
        return Some(Broadcast::Scheduled);
    }
    if remaining == total || remaining % 5 == 0 {
        return Some(Broadcast::Scheduled);
    }
    None
}

/// Stage 1: shutdown countdown over the remote console.
///
/// One timed wait per simulated minute. A zero player count cancels the loop
/// immediately; the world save (when enabled) and the final broadcast still
/// run afterwards.
pub async fn run_countdown(console: &dyn RemoteConsole, cfg: &StopConfig) {
    let total = cfg.countdown_minutes;
    for elapsed in 0..total {
        let remaining = total - elapsed;

        let players = match rcon::send_with_retry(console, LIST_PLAYERS_COMMAND).await {
            Some(reply) => rcon::parse_player_count(&reply),
            None => 0,
        };
        if players == 0 {
            tracing::info!(remaining, "no players online, cancelling countdown");
            break;
        }

        match countdown_broadcast(total, remaining) {
            Some(Broadcast::Scheduled) => {
                let msg = format!(
                    "{BROADCAST_COMMAND} Server will shut down in {remaining} minute(s) for maintenance."
                );
                let _ = rcon::send_with_retry(console, &msg).await;
            }
            Some(Broadcast::Final) => {
                let msg =
                    format!("{BROADCAST_COMMAND} Server is shutting down in 1 minute. Log out now.");
                let _ = rcon::send_with_retry(console, &msg).await;
            }
            None => {}
        }

        tokio::time::sleep(cfg.minute).await;
    }

    if cfg.save_before_exit {
        let _ = rcon::send_with_retry(console, SAVE_COMMAND).await;
        tokio::time::sleep(cfg.save_settle).await;
    }

    let _ = rcon::send_with_retry(
        console,
        &format!("{BROADCAST_COMMAND} Server is shutting down."),
    )
    .await;
}

async fn wait_for_exit(rx: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    if *rx.borrow() {
        return true;
    }
    tokio::time::timeout(timeout, async {
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

/// Escalating stop: countdown (console only), protocol exit, window close,
/// interrupt, force kill. Each stage proceeds only after the previous stage's
/// wait elapsed without the exit event firing. On confirmed exit the "server
/// stopped" alert fires exactly once, regardless of stage.
pub async fn stop_server(
    process: &dyn StoppableProcess,
    console: Option<&dyn RemoteConsole>,
    cfg: &StopConfig,
    alerts: &dyn AlertSink,
    profile_name: &str,
) -> Result<StoppedVia, ExitOutcome> {
    if let Some(console) = console {
        run_countdown(console, cfg).await;
    }

    // Registered once, before stage 2; observed by every later stage.
    let mut exit_rx = process.exit_events();

    let stopped = 'escalate: {
        if let Some(console) = console {
            if rcon::send_with_retry(console, EXIT_COMMAND).await.is_some() {
                tokio::time::sleep(cfg.exit_settle).await;
            }
            if wait_for_exit(&mut exit_rx, cfg.stage_wait).await {
                break 'escalate Some(StoppedVia::ProtocolExit);
            }
            tracing::warn!(profile = profile_name, "protocol exit did not confirm, escalating");
        }

        if let Err(err) = process.close_window().await {
            tracing::warn!(profile = profile_name, "window close failed: {err}");
        }
        if wait_for_exit(&mut exit_rx, cfg.stage_wait).await {
            break 'escalate Some(StoppedVia::WindowClose);
        }

        if let Err(err) = process.interrupt().await {
            tracing::warn!(profile = profile_name, "interrupt failed: {err}");
        }
        if wait_for_exit(&mut exit_rx, cfg.stage_wait).await {
            break 'escalate Some(StoppedVia::Interrupt);
        }

        if let Err(err) = process.kill().await {
            tracing::warn!(profile = profile_name, "force kill failed: {err}");
        }
        if wait_for_exit(&mut exit_rx, cfg.stage_wait).await {
            break 'escalate Some(StoppedVia::ForceKill);
        }

        None
    };

    match stopped {
        Some(via) => {
            tracing::info!(profile = profile_name, stage = ?via, "server stopped");
            alerts.notify(
                "server stopped",
                &format!("{profile_name} stopped (stage {via:?})"),
                false,
            );
            Ok(via)
        }
        None => Err(ExitOutcome::failure(
            ExitCode::ShutdownTimeout,
            format!("{profile_name}: process did not exit after escalation through force kill"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::test_support::CollectingSink;
    use crate::rcon::ConsoleError;
    use std::sync::Mutex;

    fn test_cfg() -> StopConfig {
        StopConfig {
            countdown_minutes: 10,
            save_before_exit: true,
            minute: Duration::from_millis(1),
            stage_wait: Duration::from_millis(50),
            exit_settle: Duration::from_millis(1),
            save_settle: Duration::from_millis(1),
        }
    }

    #[test]
    fn broadcast_schedule_matches_contract() {
        // total=10: first minute always, 10 and 5 (every 5th), 4..2 every
        // minute, 1 final. 9..6 silent.
        assert!(matches!(countdown_broadcast(10, 10), Some(Broadcast::Scheduled)));
        assert!(countdown_broadcast(10, 9).is_none());
        assert!(countdown_broadcast(10, 8).is_none());
        assert!(countdown_broadcast(10, 7).is_none());
        assert!(countdown_broadcast(10, 6).is_none());
        assert!(matches!(countdown_broadcast(10, 5), Some(Broadcast::Scheduled)));
        assert!(matches!(countdown_broadcast(10, 4), Some(Broadcast::Scheduled)));
        assert!(matches!(countdown_broadcast(10, 3), Some(Broadcast::Scheduled)));
        assert!(matches!(countdown_broadcast(10, 2), Some(Broadcast::Scheduled)));
        assert!(matches!(countdown_broadcast(10, 1), Some(Broadcast::Final)));

        // total=3 starts inside the every-minute window.
        assert!(matches!(countdown_broadcast(3, 3), Some(Broadcast::Scheduled)));
    }

    /// Console that replies to listplayers from a scripted count sequence and
    /// records every command sent.
    struct ScriptedConsole {
        counts: Mutex<Vec<u32>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedConsole {
        fn new(counts: Vec<u32>) -> Self {
            Self {
                counts: Mutex::new(counts),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl RemoteConsole for ScriptedConsole {
        async fn send_command(&self, command: &str) -> Result<String, ConsoleError> {
            self.sent.lock().unwrap().push(command.to_string());
            if command == LIST_PLAYERS_COMMAND {
                let mut counts = self.counts.lock().unwrap();
                let n = if counts.is_empty() { 0 } else { counts.remove(0) };
                if n == 0 {
                    return Ok("No Players Connected".to_string());
                }
                let lines: Vec<String> = (0..n).map(|i| format!("{i}. Player{i}, id")).collect();
                return Ok(lines.join("\n"));
            }
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn countdown_cancels_early_but_still_saves() {
        // Players drop to zero on the third minute of a ten-minute grace
        // period: no broadcasts after that point, save still runs.
        let console = ScriptedConsole::new(vec![5, 4, 0]);
        let cfg = test_cfg();

        run_countdown(&console, &cfg).await;

        let sent = console.sent();
        let broadcasts: Vec<&String> = sent
            .iter()
            .filter(|c| c.starts_with(BROADCAST_COMMAND))
            .collect();
        // One countdown broadcast (first minute), plus the final
        // "shutting down" one after the save.
        assert_eq!(broadcasts.len(), 2);
        assert!(broadcasts[0].contains("10 minute(s)"));
        assert!(broadcasts[1].contains("shutting down"));

        assert!(sent.iter().any(|c| c == SAVE_COMMAND));
        assert_eq!(sent.iter().filter(|c| *c == LIST_PLAYERS_COMMAND).count(), 3);

        // Save happens after the last player query.
        let save_pos = sent.iter().position(|c| c == SAVE_COMMAND).unwrap();
        let last_query = sent.iter().rposition(|c| c == LIST_PLAYERS_COMMAND).unwrap();
        assert!(save_pos > last_query);
    }

    #[tokio::test]
    async fn countdown_skips_save_when_disabled() {
        let console = ScriptedConsole::new(vec![0]);
        let cfg = StopConfig {
            save_before_exit: false,
            ..test_cfg()
        };
        run_countdown(&console, &cfg).await;
        assert!(!console.sent().iter().any(|c| c == SAVE_COMMAND));
    }

    /// Process that exits only in response to a chosen signal.
    struct ScriptedProcess {
        honors: Option<StoppedVia>,
        calls: Mutex<Vec<&'static str>>,
        tx: watch::Sender<bool>,
        rx: watch::Receiver<bool>,
    }

    impl ScriptedProcess {
        fn new(honors: Option<StoppedVia>) -> Self {
            let (tx, rx) = watch::channel(false);
            Self {
                honors,
                calls: Mutex::new(Vec::new()),
                tx,
                rx,
            }
        }

        fn record(&self, call: &'static str, via: StoppedVia) {
            self.calls.lock().unwrap().push(call);
            if self.honors == Some(via) {
                let _ = self.tx.send(true);
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl StoppableProcess for ScriptedProcess {
        fn exit_events(&self) -> watch::Receiver<bool> {
            self.rx.clone()
        }

        async fn close_window(&self) -> anyhow::Result<()> {
            self.record("close_window", StoppedVia::WindowClose);
            Ok(())
        }

        async fn interrupt(&self) -> anyhow::Result<()> {
            self.record("interrupt", StoppedVia::Interrupt);
            Ok(())
        }

        async fn kill(&self) -> anyhow::Result<()> {
            self.record("kill", StoppedVia::ForceKill);
            Ok(())
        }
    }

    #[tokio::test]
    async fn escalation_stops_at_the_stage_that_works() {
        // Ignores window close, honors the interrupt signal: must pass
        // through exactly close_window then interrupt, never force kill.
        let process = ScriptedProcess::new(Some(StoppedVia::Interrupt));
        let alerts = CollectingSink::default();
        let cfg = StopConfig {
            countdown_minutes: 0,
            ..test_cfg()
        };

        let via = stop_server(&process, None, &cfg, &alerts, "test")
            .await
            .unwrap();
        assert_eq!(via, StoppedVia::Interrupt);
        assert_eq!(process.calls(), vec!["close_window", "interrupt"]);

        // Stopped alert fires exactly once.
        assert_eq!(alerts.subjects(), vec!["server stopped".to_string()]);
    }

    #[tokio::test]
    async fn escalation_exhausted_is_shutdown_timeout() {
        let process = ScriptedProcess::new(None);
        let alerts = CollectingSink::default();
        let cfg = StopConfig {
            countdown_minutes: 0,
            ..test_cfg()
        };

        let err = stop_server(&process, None, &cfg, &alerts, "test")
            .await
            .unwrap_err();
        assert_eq!(err.code, ExitCode::ShutdownTimeout);
        assert_eq!(process.calls(), vec!["close_window", "interrupt", "kill"]);
        assert!(alerts.subjects().is_empty());
    }

    #[tokio::test]
    async fn already_exited_process_confirms_first_stage() {
        let process = ScriptedProcess::new(None);
        let _ = process.tx.send(true);
        let alerts = CollectingSink::default();
        let cfg = StopConfig {
            countdown_minutes: 0,
            ..test_cfg()
        };

        let via = stop_server(&process, None, &cfg, &alerts, "test")
            .await
            .unwrap();
        // No console configured, so the first observed stage is window close.
        assert_eq!(via, StoppedVia::WindowClose);
        assert_eq!(process.calls(), vec!["close_window"]);
    }
}
