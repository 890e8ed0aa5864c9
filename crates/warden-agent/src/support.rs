use std::time::Duration;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// How long a lock acquisition may block before the operation is reported as
/// "already running".
pub(crate) fn lock_timeout() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_LOCK_TIMEOUT_MS")
            .map(|v| v.clamp(100, 60 * 60 * 1000))
            .unwrap_or(5 * 60 * 1000),
    )
}

pub(crate) fn lock_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_LOCK_POLL_MS")
            .map(|v| v.clamp(10, 10_000))
            .unwrap_or(250),
    )
}

/// Length of one simulated countdown minute. Shrunk in tests.
pub(crate) fn countdown_minute() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_COUNTDOWN_MINUTE_MS")
            .map(|v| v.clamp(1, 5 * 60 * 1000))
            .unwrap_or(60_000),
    )
}

/// Per-stage wait for the process-exit event during shutdown escalation.
pub(crate) fn stage_wait() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_STAGE_WAIT_MS")
            .map(|v| v.clamp(100, 10 * 60 * 1000))
            .unwrap_or(60_000),
    )
}

/// Settle delay after the protocol "exit" command before waiting on the
/// process-exit event.
pub(crate) fn exit_settle() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_EXIT_SETTLE_MS")
            .map(|v| v.clamp(0, 60_000))
            .unwrap_or(3_000),
    )
}

/// Settle delay after the world-save command.
pub(crate) fn save_settle() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_SAVE_SETTLE_MS")
            .map(|v| v.clamp(0, 5 * 60 * 1000))
            .unwrap_or(15_000),
    )
}

pub(crate) fn exit_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_EXIT_POLL_MS")
            .map(|v| v.clamp(50, 10_000))
            .unwrap_or(250),
    )
}

pub(crate) fn rcon_connect_timeout() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_RCON_CONNECT_TIMEOUT_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(5_000),
    )
}

pub(crate) fn rcon_session_settle() -> Duration {
    Duration::from_millis(
        env_u64("WARDEN_RCON_SESSION_SETTLE_MS")
            .map(|v| v.clamp(0, 10_000))
            .unwrap_or(500),
    )
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Values are clamped, so even with env set they stay in range.
        assert!(lock_timeout() >= Duration::from_millis(100));
        assert!(stage_wait() >= Duration::from_millis(100));
        assert!(lock_poll_interval() <= Duration::from_secs(10));
    }

    #[test]
    fn error_chain_dedupes_repeats() {
        let inner = anyhow::anyhow!("disk full");
        let outer = inner.context("copy server files");
        let s = format_error_chain(&outer);
        assert_eq!(s, "copy server files: disk full");
    }
}
