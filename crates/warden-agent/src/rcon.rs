use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::support;

const TYPE_AUTH: i32 = 3;
const TYPE_EXEC: i32 = 2;
const TYPE_RESPONSE: i32 = 0;

const MAX_FRAME_BODY: usize = 64 * 1024;

/// Connection-establishment failures and send failures are distinct so the
/// orchestrator can track them with separate retry counters.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("session: {0}")]
    Session(String),
}

#[async_trait::async_trait]
pub trait RemoteConsole: Send + Sync {
    /// Sends one text command and returns the concatenated reply text, which
    /// may be empty.
    async fn send_command(&self, command: &str) -> Result<String, ConsoleError>;
}

/// Minimal length-prefixed request/response console client.
///
/// Each send opens a fresh session (connect, settle, authenticate) so a
/// half-dead server connection from an earlier attempt can never poison a
/// later one.
#[derive(Debug, Clone)]
pub struct RconClient {
    host: String,
    port: u16,
    password: String,
}

impl RconClient {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
        }
    }

    async fn open_session(&self) -> Result<TcpStream, ConsoleError> {
        let addr = (self.host.as_str(), self.port);
        let mut stream = tokio::time::timeout(support::rcon_connect_timeout(), async {
            TcpStream::connect(addr).await
        })
        .await
        .map_err(|_| ConsoleError::Connect(format!("{}:{} connect timed out", self.host, self.port)))?
        .map_err(|e| ConsoleError::Connect(format!("{}:{}: {e}", self.host, self.port)))?;

        tokio::time::sleep(support::rcon_session_settle()).await;

        write_frame(&mut stream, 1, TYPE_AUTH, &self.password)
            .await
            .map_err(|e| ConsoleError::Connect(format!("auth send: {e}")))?;

        // Servers may send an empty RESPONSE_VALUE before the auth reply.
        loop {
            let (id, ty, _body) = read_frame(&mut stream)
                .await
                .map_err(|e| ConsoleError::Connect(format!("auth reply: {e}")))?;
            if ty == TYPE_RESPONSE {
                continue;
            }
            if id == -1 {
                return Err(ConsoleError::Connect("authentication rejected".to_string()));
            }
            break;
        }

        Ok(stream)
    }
}

#[async_trait::async_trait]
impl RemoteConsole for RconClient {
    async fn send_command(&self, command: &str) -> Result<String, ConsoleError> {
        let mut stream = self.open_session().await?;

        write_frame(&mut stream, 2, TYPE_EXEC, command)
            .await
            .map_err(|e| ConsoleError::Session(format!("send {command:?}: {e}")))?;

        let (_, _, body) = read_frame(&mut stream)
            .await
            .map_err(|e| ConsoleError::Session(format!("reply to {command:?}: {e}")))?;

        // Replies can span frames; drain anything already buffered with a
        // short grace window and concatenate.
        let mut reply = body;
        loop {
            let more =
                tokio::time::timeout(Duration::from_millis(200), read_frame(&mut stream)).await;
            match more {
                Ok(Ok((_, _, extra))) => reply.push_str(&extra),
                _ => break,
            }
        }
        Ok(reply)
    }
}

pub(crate) fn encode_frame(id: i32, ty: i32, body: &str) -> Vec<u8> {
    let len = (4 + 4 + body.len() + 2) as i32;
    let mut out = Vec::with_capacity(4 + len as usize);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&ty.to_le_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(&[0, 0]);
    out
}

pub(crate) fn decode_payload(payload: &[u8]) -> anyhow::Result<(i32, i32, String)> {
    if payload.len() < 10 {
        anyhow::bail!("frame too short: {} bytes", payload.len());
    }
    let id = i32::from_le_bytes(payload[0..4].try_into()?);
    let ty = i32::from_le_bytes(payload[4..8].try_into()?);
    let body = &payload[8..payload.len() - 2];
    Ok((id, ty, String::from_utf8_lossy(body).into_owned()))
}

async fn write_frame(stream: &mut TcpStream, id: i32, ty: i32, body: &str) -> anyhow::Result<()> {
    stream.write_all(&encode_frame(id, ty, body)).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<(i32, i32, String)> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = i32::from_le_bytes(len_buf);
    if !(10..=(MAX_FRAME_BODY as i32)).contains(&len) {
        anyhow::bail!("implausible frame length: {len}");
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    decode_payload(&payload)
}

const RETRY_ATTEMPTS: u32 = 3;

/// Sends a command with up to 3 attempts, tracking connection failures and
/// send failures with separate budgets so transient connect errors do not
/// exhaust the send-retry budget and vice versa. All failures are logged and
/// swallowed; the caller decides significance from the `None` return.
pub async fn send_with_retry(console: &dyn RemoteConsole, command: &str) -> Option<String> {
    let mut connect_failures = 0u32;
    let mut send_failures = 0u32;

    loop {
        match console.send_command(command).await {
            Ok(reply) => return Some(reply),
            Err(ConsoleError::Connect(msg)) => {
                connect_failures += 1;
                tracing::warn!(command, attempt = connect_failures, "console connect failed: {msg}");
                if connect_failures >= RETRY_ATTEMPTS {
                    return None;
                }
            }
            Err(ConsoleError::Session(msg)) => {
                send_failures += 1;
                tracing::warn!(command, attempt = send_failures, "console send failed: {msg}");
                if send_failures >= RETRY_ATTEMPTS {
                    return None;
                }
            }
        }
    }
}

/// Parses the reply to the player-list command.
///
/// An empty reply or the "No Players Connected" sentinel means zero; anything
/// else is counted by numbered entry lines ("0. Name, id").
pub fn parse_player_count(reply: &str) -> u32 {
    let trimmed = reply.trim();
    if trimmed.is_empty() || trimmed.to_lowercase().contains("no players connected") {
        return 0;
    }

    let mut count = 0u32;
    for line in trimmed.lines() {
        let line = line.trim_start();
        let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 && line[digits..].starts_with('.') {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn frame_roundtrip() {
        let bytes = encode_frame(7, TYPE_EXEC, "saveworld");
        let len = i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);

        let (id, ty, body) = decode_payload(&bytes[4..]).unwrap();
        assert_eq!(id, 7);
        assert_eq!(ty, TYPE_EXEC);
        assert_eq!(body, "saveworld");
    }

    #[test]
    fn empty_body_roundtrip() {
        let bytes = encode_frame(-1, TYPE_RESPONSE, "");
        let (id, ty, body) = decode_payload(&bytes[4..]).unwrap();
        assert_eq!(id, -1);
        assert_eq!(ty, TYPE_RESPONSE);
        assert!(body.is_empty());
    }

    #[test]
    fn short_payload_is_rejected() {
        assert!(decode_payload(&[0u8; 4]).is_err());
    }

    #[test]
    fn player_count_sentinel_and_empty() {
        assert_eq!(parse_player_count(""), 0);
        assert_eq!(parse_player_count("  \n"), 0);
        assert_eq!(parse_player_count("No Players Connected"), 0);
    }

    #[test]
    fn player_count_counts_numbered_lines() {
        let reply = "0. Alice, 76561198000000001\n1. Bob, 76561198000000002\n";
        assert_eq!(parse_player_count(reply), 2);
    }

    struct FlakyConsole {
        // (connect failures, session failures) to emit before succeeding.
        plan: Mutex<Vec<ConsoleError>>,
    }

    #[async_trait::async_trait]
    impl RemoteConsole for FlakyConsole {
        async fn send_command(&self, _command: &str) -> Result<String, ConsoleError> {
            match self.plan.lock().unwrap().pop() {
                Some(err) => Err(err),
                None => Ok("ok".to_string()),
            }
        }
    }

    #[tokio::test]
    async fn retry_budgets_are_independent() {
        // 2 connect failures + 2 send failures: under a shared 3-attempt
        // budget this would fail; with separate counters it succeeds.
        let console = FlakyConsole {
            plan: Mutex::new(vec![
                ConsoleError::Session("s2".to_string()),
                ConsoleError::Connect("c2".to_string()),
                ConsoleError::Session("s1".to_string()),
                ConsoleError::Connect("c1".to_string()),
            ]),
        };
        let reply = send_with_retry(&console, "listplayers").await;
        assert_eq!(reply.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn retry_gives_up_after_three_connect_failures() {
        let console = FlakyConsole {
            plan: Mutex::new(vec![
                ConsoleError::Connect("c3".to_string()),
                ConsoleError::Connect("c2".to_string()),
                ConsoleError::Connect("c1".to_string()),
            ]),
        };
        assert!(send_with_retry(&console, "listplayers").await.is_none());
    }
}
