//! SessionHandle — one spawned interactive child process.
//!
//! The handle owns stdin and two background reader tasks that publish every
//! stdout/stderr line to the Log Broadcaster. Readers never block: publish
//! is fire-and-forget. Exit is observed through a `watch` channel so any
//! number of waiters can await it.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::FlowError;
use crate::logs::{LogBroadcaster, LogLine};

/// Grace period between stdin close and hard kill during a graceful stop.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// A managed interactive child process.
#[derive(Debug)]
pub struct SessionHandle {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    alive: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<i32>>,
    kill_tx: mpsc::Sender<()>,
    /// Stdout lines accumulated since spawn, for callers that need the
    /// full output (loop progress checks, node output capture).
    collected: Arc<std::sync::Mutex<Vec<String>>>,
    last_output: Arc<std::sync::Mutex<Instant>>,
    stream_key: String,
}

impl SessionHandle {
    /// Spawn the process and start the reader tasks. Lines are published to
    /// `logs` under `stream_key`.
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: &str,
        logs: LogBroadcaster,
        stream_key: &str,
    ) -> Result<Self, FlowError> {
        tracing::info!(
            "[SessionHandle:{}] Spawning: {} {} (cwd: {})",
            stream_key,
            command,
            args.join(" "),
            cwd,
        );

        let mut child = Command::new(command)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FlowError::Spawn(format!(
                    "Failed to spawn '{}' in '{}': {}",
                    command, cwd, e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FlowError::Spawn("No stdin on child process".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FlowError::Spawn("No stdout on child process".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FlowError::Spawn("No stderr on child process".to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let last_output = Arc::new(std::sync::Mutex::new(Instant::now()));
        let (exit_tx, exit_rx) = watch::channel(None::<i32>);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        // Stdout reader: publish + accumulate + touch the idle clock.
        let stdout_task = {
            let logs = logs.clone();
            let key = stream_key.to_string();
            let collected = collected.clone();
            let last_output = last_output.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(mut buf) = collected.lock() {
                        buf.push(line.clone());
                    }
                    if let Ok(mut t) = last_output.lock() {
                        *t = Instant::now();
                    }
                    logs.publish(&key, LogLine::stdout(line));
                }
            })
        };

        // Stderr reader: publish + touch the idle clock.
        let stderr_task = {
            let logs = logs.clone();
            let key = stream_key.to_string();
            let last_output = last_output.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(mut t) = last_output.lock() {
                        *t = Instant::now();
                    }
                    logs.publish(&key, LogLine::stderr(line));
                }
            })
        };

        // Exit waiter: owns the child. A kill request interrupts the wait,
        // kills the process, then the loop observes the real exit status.
        // Readers are joined before exit is announced, so a completed wait
        // implies all output has been published and collected.
        {
            let alive = alive.clone();
            let key = stream_key.to_string();
            tokio::spawn(async move {
                let code = loop {
                    tokio::select! {
                        status = child.wait() => {
                            break status.ok().and_then(|s| s.code()).unwrap_or(-1);
                        }
                        _ = kill_rx.recv() => {
                            let _ = child.kill().await;
                        }
                    }
                };
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                alive.store(false, Ordering::SeqCst);
                tracing::info!("[SessionHandle:{}] Process exited with code {}", key, code);
                let _ = exit_tx.send(Some(code));
            });
        }

        Ok(Self {
            stdin: Arc::new(Mutex::new(Some(stdin))),
            alive,
            exit_rx,
            kill_tx,
            collected,
            last_output,
            stream_key: stream_key.to_string(),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send one input line to the process. No-op (with a warning) once the
    /// process has exited or stdin was closed by a graceful stop.
    pub async fn write_input(&self, text: &str) -> Result<(), FlowError> {
        if !self.is_alive() {
            tracing::warn!(
                "[SessionHandle:{}] Ignoring input: process already exited",
                self.stream_key
            );
            return Ok(());
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            tracing::warn!(
                "[SessionHandle:{}] Ignoring input: stdin already closed",
                self.stream_key
            );
            return Ok(());
        };
        stdin
            .write_all(format!("{}\n", text).as_bytes())
            .await
            .map_err(|e| FlowError::Execution(format!("Failed to write input: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| FlowError::Execution(format!("Failed to flush input: {}", e)))?;
        Ok(())
    }

    /// Graceful stop: close stdin (EOF is the soft stop signal for a
    /// line-oriented process), wait up to `grace`, then hard-kill.
    /// Returns the exit code. Idempotent.
    pub async fn signal_stop(&self, grace: Duration) -> i32 {
        {
            let mut guard = self.stdin.lock().await;
            guard.take();
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(code) => code,
            Err(_) => {
                tracing::warn!(
                    "[SessionHandle:{}] No exit within {:?} after stdin close, killing",
                    self.stream_key,
                    grace
                );
                let _ = self.kill_tx.send(()).await;
                self.wait().await
            }
        }
    }

    /// Wait for the process to exit and return its code.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return -1;
            }
        }
    }

    /// Wait for exit with a deadline.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Stdout lines accumulated since spawn.
    pub fn collected_output(&self) -> Vec<String> {
        self.collected
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    /// Time since the process last produced output on either stream.
    pub fn idle_for(&self) -> Duration {
        self.last_output
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_streams_and_exits() {
        let logs = LogBroadcaster::new();
        let handle = SessionHandle::spawn(
            "sh",
            &["-c".to_string(), "echo out; echo err >&2; exit 7".to_string()],
            ".",
            logs.clone(),
            "s1",
        )
        .unwrap();

        let code = handle.wait().await;
        assert_eq!(code, 7);
        assert_eq!(handle.collected_output(), vec!["out"]);

        // Both streams reached the broadcaster.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let backlog = logs.backlog("s1");
        assert!(backlog.iter().any(|l| l.text == "out"));
        assert!(backlog.iter().any(|l| l.text == "err"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_spawn_error() {
        let logs = LogBroadcaster::new();
        let err =
            SessionHandle::spawn("definitely-not-a-binary", &[], ".", logs, "s2").unwrap_err();
        assert_eq!(err.kind(), "spawn");
    }

    #[tokio::test]
    async fn test_write_input_reaches_process() {
        let logs = LogBroadcaster::new();
        // `cat` echoes stdin to stdout and exits on EOF.
        let handle = SessionHandle::spawn("cat", &[], ".", logs, "s3").unwrap();
        handle.write_input("hello").await.unwrap();

        let code = handle.signal_stop(Duration::from_secs(5)).await;
        assert_eq!(code, 0);
        assert_eq!(handle.collected_output(), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_stop_kills_process_that_ignores_eof() {
        let logs = LogBroadcaster::new();
        let handle = SessionHandle::spawn(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            ".",
            logs,
            "s4",
        )
        .unwrap();

        let code = handle.signal_stop(Duration::from_millis(200)).await;
        assert_ne!(code, 0);
        assert!(!handle.is_alive());

        // Double stop is a no-op.
        let again = handle.signal_stop(Duration::from_millis(200)).await;
        assert_eq!(again, code);
    }

    #[tokio::test]
    async fn test_input_after_exit_is_noop() {
        let logs = LogBroadcaster::new();
        let handle = SessionHandle::spawn(
            "sh",
            &["-c".to_string(), "true".to_string()],
            ".",
            logs,
            "s5",
        )
        .unwrap();
        handle.wait().await;
        assert!(handle.write_input("ignored").await.is_ok());
    }
}
