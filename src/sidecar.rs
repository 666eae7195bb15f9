//! Per-session sidecar control channel.
//!
//! Each RUNNING session owns one child process that holds a CDP connection
//! to its browser and speaks newline-delimited JSON on its standard streams:
//! one command line in, one response line out, in order. The channel keeps a
//! single command in flight per session, which is what makes the bounded
//! response queue sufficient.

use crate::error::{Error, Result};
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_QUEUE_CAPACITY: usize = 10;

struct ChannelIo {
    stdin: ChildStdin,
    responses: mpsc::Receiver<Value>,
}

impl std::fmt::Debug for SidecarConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarConnection")
            .field("session_id", &self.session_id)
            .finish()
    }
}

pub struct SidecarConnection {
    pub session_id: String,
    child: Mutex<Child>,
    /// Holding this across write + response-wait is the single-inflight
    /// guarantee: at most one reply is ever pending per session.
    io: Mutex<ChannelIo>,
}

impl SidecarConnection {
    /// Spawn the sidecar for a session and wait for its ready line.
    ///
    /// `command` is the configured executable plus leading arguments; the
    /// browser connect URL is appended as the final argument.
    pub async fn start(session_id: &str, command: &[String], connect_url: &str) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Sidecar("sidecar command is empty".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .arg(connect_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Sidecar(format!("failed to start sidecar: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Sidecar("sidecar has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sidecar("sidecar has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Sidecar("sidecar has no stderr".into()))?;

        let (tx, mut rx) = mpsc::channel::<Value>(RESPONSE_QUEUE_CAPACITY);

        // Stdout reader: one JSON document per line. Lines can be large
        // (base64 screenshots), so reading is unbounded rather than capped.
        let sid = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let cut = line
                    .char_indices()
                    .nth(200)
                    .map(|(i, _)| i)
                    .unwrap_or(line.len());
                debug!(session = %short(&sid), "sidecar out: {}", &line[..cut]);
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => {
                        if tx.try_send(value).is_err() {
                            warn!(session = %short(&sid), "sidecar response queue full, dropping");
                        }
                    }
                    Err(_) => {
                        debug!(session = %short(&sid), "ignoring non-JSON sidecar line");
                    }
                }
            }
        });

        // Stderr is log-only.
        let sid = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session = %short(&sid), "sidecar err: {}", line);
            }
        });

        match tokio::time::timeout(READY_TIMEOUT, rx.recv()).await {
            Ok(Some(msg)) if msg.get("status").and_then(Value::as_str) == Some("ready") => {}
            Ok(Some(msg)) => {
                let _ = child.start_kill();
                return Err(Error::Sidecar(format!(
                    "sidecar failed to initialize: {}",
                    msg
                )));
            }
            Ok(None) => {
                let _ = child.start_kill();
                return Err(Error::Sidecar("sidecar exited before ready".into()));
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(Error::Sidecar("sidecar startup timeout".into()));
            }
        }

        info!(session = %short(session_id), "Sidecar connected");

        Ok(Self {
            session_id: session_id.to_string(),
            child: Mutex::new(child),
            io: Mutex::new(ChannelIo {
                stdin,
                responses: rx,
            }),
        })
    }

    /// Send one command and wait for its response. Callers are serialized;
    /// a `status: "error"` response becomes an error carrying its message.
    pub async fn send_command(&self, cmd: &Value, timeout: Duration) -> Result<Value> {
        let mut io = self.io.lock().await;

        let mut line = serde_json::to_vec(cmd)?;
        line.push(b'\n');
        io.stdin
            .write_all(&line)
            .await
            .map_err(|e| Error::Sidecar(format!("failed to send command: {}", e)))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| Error::Sidecar(format!("failed to send command: {}", e)))?;

        let response = match tokio::time::timeout(timeout, io.responses.recv()).await {
            Ok(Some(resp)) => resp,
            Ok(None) => return Err(Error::Sidecar("sidecar closed".into())),
            Err(_) => return Err(Error::Sidecar("command timeout".into())),
        };

        if response.get("status").and_then(Value::as_str) == Some("error") {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown sidecar error");
            return Err(Error::Sidecar(message.to_string()));
        }

        Ok(response)
    }

    /// Ask the child to shut down and wait for it to exit. Best-effort: a
    /// child that ignores the close command is killed.
    pub async fn close(&self, timeout: Duration) {
        let close_cmd = serde_json::json!({ "action": "close" });
        if let Err(e) = self.send_command(&close_cmd, timeout).await {
            debug!(session = %short(&self.session_id), "sidecar close command failed: {}", e);
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(session = %short(&self.session_id), "sidecar exited: {}", status);
            }
            _ => {
                warn!(session = %short(&self.session_id), "sidecar did not exit, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

fn short(session_id: &str) -> &str {
    &session_id[..session_id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    /// A stand-in sidecar: prints the ready line, then answers every stdin
    /// line with a numbered success response, in order.
    fn echo_sidecar() -> Vec<String> {
        let script = r#"
echo '{"status":"ready"}'
n=0
while IFS= read -r line; do
  case "$line" in
    *close*) echo '{"status":"success"}'; exit 0 ;;
    *fail*)  echo '{"status":"error","message":"boom"}' ;;
    *)       n=$((n+1)); echo "{\"status\":\"success\",\"seq\":$n}" ;;
  esac
done
"#;
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn starts_and_answers_commands() {
        let conn = SidecarConnection::start("sess-1", &echo_sidecar(), "ws://localhost:1")
            .await
            .unwrap();

        let resp = conn
            .send_command(&json!({"action": "navigate", "url": "https://example.com"}),
                Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp["status"], "success");

        conn.close(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn error_responses_become_errors() {
        let conn = SidecarConnection::start("sess-2", &echo_sidecar(), "ws://localhost:1")
            .await
            .unwrap();

        let err = conn
            .send_command(&json!({"action": "fail"}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        conn.close(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn concurrent_callers_get_fifo_responses() {
        let conn = Arc::new(
            SidecarConnection::start("sess-3", &echo_sidecar(), "ws://localhost:1")
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                conn.send_command(&json!({"action": "navigate"}), Duration::from_secs(5))
                    .await
                    .unwrap()
            }));
        }

        let mut seqs: Vec<u64> = Vec::new();
        for handle in handles {
            let resp = handle.await.unwrap();
            seqs.push(resp["seq"].as_u64().unwrap());
        }

        // Single-inflight means every caller gets the response to its own
        // command: the sequence numbers are exactly 1..=8, each seen once.
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=8).collect::<Vec<_>>());

        conn.close(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn startup_timeout_kills_child() {
        // A child that never says ready.
        let cmd = vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        let started = std::time::Instant::now();
        let err = SidecarConnection::start("sess-4", &cmd, "ws://localhost:1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("startup timeout"));
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn immediate_exit_fails_startup() {
        let cmd = vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()];
        let err = SidecarConnection::start("sess-5", &cmd, "ws://localhost:1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited before ready"));
    }
}
