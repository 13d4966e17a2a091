//! Session Orchestrator — lifecycle of steerable interactive processes.
//!
//! Sessions move through `starting -> active -> (paused <-> active) ->
//! (completed | failed)`. The orchestrator is the only owner of session
//! handles; the engine and the HTTP layer refer to sessions by ID. All
//! transitions for one session serialize on that session's transition mutex,
//! so concurrent stop/pause/input calls cannot interleave mid-transition.
//!
//! Pausing gates orchestration: input delivery is rejected and an autonomous
//! loop defers its next iteration. The underlying OS process is not
//! suspended.

pub mod autonomous;
pub mod handle;
pub mod team;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::error::FlowError;
use crate::logs::{LogBroadcaster, LogLine, LogSource};
use crate::models::{AutonomousLoopState, ExecutionMode, Session, SessionStatus, TeamState};

use autonomous::{promise_seen, LoopConfig, ProgressTracker};
use handle::{SessionHandle, DEFAULT_STOP_GRACE};

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub mode: ExecutionMode,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    /// Graph run this session belongs to, if any.
    pub run_id: Option<String>,
    /// Direct mode: fail the session after this long without output.
    pub idle_timeout: Option<Duration>,
    /// Autonomous-loop settings; ignored for other modes.
    pub loop_config: Option<LoopConfig>,
    pub stop_grace: Duration,
}

impl SessionSpec {
    pub fn direct(command: impl Into<String>) -> Self {
        Self {
            mode: ExecutionMode::Direct,
            command: command.into(),
            args: Vec::new(),
            cwd: ".".to_string(),
            run_id: None,
            idle_timeout: None,
            loop_config: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_loop_config(mut self, cfg: LoopConfig) -> Self {
        self.loop_config = Some(cfg);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

struct SessionEntry {
    spec: SessionSpec,
    record: std::sync::Mutex<Session>,
    status_tx: watch::Sender<SessionStatus>,
    /// Current process, if one is running. Replaced per iteration in loop
    /// mode.
    handle: tokio::sync::Mutex<Option<Arc<SessionHandle>>>,
    loop_state: std::sync::Mutex<Option<AutonomousLoopState>>,
    team_state: std::sync::Mutex<TeamState>,
    /// Serializes pause/resume/stop/input for this session.
    transition: tokio::sync::Mutex<()>,
    stop_requested: AtomicBool,
}

impl SessionEntry {
    fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Terminal statuses are sticky: once a session completes or fails,
    /// later transitions are ignored. `send_replace` updates the watch
    /// value even when nobody is subscribed, unlike `send`.
    fn set_status(&self, status: SessionStatus) {
        if self.status().is_terminal() {
            return;
        }
        if let Ok(mut record) = self.record.lock() {
            record.status = status;
        }
        self.status_tx.send_replace(status);
    }

    fn fail(&self, error: FlowError) {
        if self.status().is_terminal() {
            return;
        }
        let circuit = matches!(error, FlowError::CircuitBreaker(_));
        if let Ok(mut record) = self.record.lock() {
            record.status = SessionStatus::Failed;
            record.error = Some(error.to_string());
            if circuit {
                record.circuit_breaker_triggered = true;
            }
        }
        self.status_tx.send_replace(SessionStatus::Failed);
    }

    fn snapshot(&self) -> Session {
        self.record
            .lock()
            .map(|r| r.clone())
            .expect("session record poisoned")
    }
}

/// Process-wide registry and state machine for interactive sessions.
#[derive(Clone)]
pub struct SessionOrchestrator {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionEntry>>>>,
    logs: LogBroadcaster,
}

impl SessionOrchestrator {
    pub fn new(logs: LogBroadcaster) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            logs,
        }
    }

    pub fn logs(&self) -> &LogBroadcaster {
        &self.logs
    }

    /// Start a new session. For direct and team modes the process is
    /// spawned before this returns, so spawn failures surface here. An
    /// autonomous loop spawns per iteration inside its driver task; its
    /// spawn failures fail the session instead.
    pub async fn start_session(&self, spec: SessionSpec) -> Result<Session, FlowError> {
        let id = uuid::Uuid::new_v4().to_string();
        let record = Session {
            id: id.clone(),
            mode: spec.mode,
            status: SessionStatus::Starting,
            command: spec.command.clone(),
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
            run_id: spec.run_id.clone(),
            created_at: Utc::now(),
            error: None,
            circuit_breaker_triggered: false,
        };
        let (status_tx, _) = watch::channel(SessionStatus::Starting);
        let entry = Arc::new(SessionEntry {
            spec,
            record: std::sync::Mutex::new(record),
            status_tx,
            handle: tokio::sync::Mutex::new(None),
            loop_state: std::sync::Mutex::new(None),
            team_state: std::sync::Mutex::new(TeamState::default()),
            transition: tokio::sync::Mutex::new(()),
            stop_requested: AtomicBool::new(false),
        });

        self.sessions
            .write()
            .expect("session registry poisoned")
            .insert(id.clone(), entry.clone());

        match entry.spec.mode {
            ExecutionMode::Direct | ExecutionMode::TeamSpawn => {
                let handle = match SessionHandle::spawn(
                    &entry.spec.command,
                    &entry.spec.args,
                    &entry.spec.cwd,
                    self.logs.clone(),
                    &id,
                ) {
                    Ok(h) => Arc::new(h),
                    Err(e) => {
                        entry.fail(FlowError::Spawn(e.to_string()));
                        return Err(e);
                    }
                };
                *entry.handle.lock().await = Some(handle.clone());
                entry.set_status(SessionStatus::Active);

                if entry.spec.mode == ExecutionMode::TeamSpawn {
                    self.spawn_team_parser(&id, entry.clone());
                }
                self.spawn_direct_monitor(id.clone(), entry.clone(), handle);
            }
            ExecutionMode::AutonomousLoop => {
                entry.set_status(SessionStatus::Active);
                self.spawn_loop_driver(id.clone(), entry.clone());
            }
        }

        Ok(entry.snapshot())
    }

    pub fn get_session(&self, id: &str) -> Result<Session, FlowError> {
        self.entry(id).map(|e| e.snapshot())
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        let map = self.sessions.read().expect("session registry poisoned");
        let mut sessions: Vec<Session> = map.values().map(|e| e.snapshot()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn loop_state(&self, id: &str) -> Result<Option<AutonomousLoopState>, FlowError> {
        let entry = self.entry(id)?;
        Ok(entry
            .loop_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    pub fn team_state(&self, id: &str) -> Result<TeamState, FlowError> {
        let entry = self.entry(id)?;
        Ok(entry
            .team_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    /// Deliver one input line. Only valid while the session is active.
    pub async fn send_input(&self, id: &str, text: &str) -> Result<(), FlowError> {
        let entry = self.entry(id)?;
        let _guard = entry.transition.lock().await;
        if entry.status() != SessionStatus::Active {
            return Err(FlowError::InvalidState(format!(
                "Cannot send input to session '{}' in status '{}'",
                id,
                entry.status().as_str()
            )));
        }
        let handle = entry.handle.lock().await;
        match handle.as_ref() {
            Some(h) => h.write_input(text).await,
            None => Err(FlowError::InvalidState(format!(
                "Session '{}' has no running process",
                id
            ))),
        }
    }

    pub async fn pause_session(&self, id: &str) -> Result<Session, FlowError> {
        let entry = self.entry(id)?;
        let _guard = entry.transition.lock().await;
        if entry.status() != SessionStatus::Active {
            return Err(FlowError::InvalidState(format!(
                "Cannot pause session '{}' in status '{}'",
                id,
                entry.status().as_str()
            )));
        }
        entry.set_status(SessionStatus::Paused);
        self.logs.publish(id, LogLine::system("[session] paused"));
        Ok(entry.snapshot())
    }

    pub async fn resume_session(&self, id: &str) -> Result<Session, FlowError> {
        let entry = self.entry(id)?;
        let _guard = entry.transition.lock().await;
        if entry.status() != SessionStatus::Paused {
            return Err(FlowError::InvalidState(format!(
                "Cannot resume session '{}' in status '{}'",
                id,
                entry.status().as_str()
            )));
        }
        entry.set_status(SessionStatus::Active);
        self.logs.publish(id, LogLine::system("[session] resumed"));
        Ok(entry.snapshot())
    }

    /// Stop a session gracefully. A second stop on an already-terminal
    /// session is a no-op, never an error.
    pub async fn stop_session(&self, id: &str) -> Result<Session, FlowError> {
        let entry = self.entry(id)?;
        let _guard = entry.transition.lock().await;
        if entry.status().is_terminal() {
            return Ok(entry.snapshot());
        }

        entry.stop_requested.store(true, Ordering::SeqCst);
        let handle = entry.handle.lock().await.clone();
        if let Some(h) = handle {
            h.signal_stop(entry.spec.stop_grace).await;
        }

        // The mode driver observes the exit (or the stop flag) and sets the
        // terminal status; wait for it so callers see a settled record. The
        // wait is bounded: a driver that never settles within the grace
        // window gets force-failed.
        let mut rx = entry.status_tx.subscribe();
        let settle = entry.spec.stop_grace + Duration::from_secs(5);
        if tokio::time::timeout(settle, rx.wait_for(|s| s.is_terminal()))
            .await
            .is_err()
        {
            tracing::warn!(
                "[Orchestrator] Session {} did not settle within {:?} of stop, forcing",
                id,
                settle
            );
            if let Some(h) = entry.handle.lock().await.clone() {
                h.signal_stop(Duration::ZERO).await;
            }
            entry.fail(FlowError::Timeout(format!(
                "Session did not stop within {}s",
                settle.as_secs()
            )));
        }
        Ok(entry.snapshot())
    }

    /// Stdout lines the session's current (direct/team) process has
    /// produced so far. Complete once the session is terminal.
    pub async fn session_output(&self, id: &str) -> Result<Vec<String>, FlowError> {
        let entry = self.entry(id)?;
        let handle = entry.handle.lock().await;
        Ok(handle
            .as_ref()
            .map(|h| h.collected_output())
            .unwrap_or_default())
    }

    /// Block until the session reaches a terminal status.
    pub async fn wait(&self, id: &str) -> Result<Session, FlowError> {
        let entry = self.entry(id)?;
        let mut rx = entry.status_tx.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        Ok(entry.snapshot())
    }

    /// Stop every non-terminal session tagged with the given run. Used by
    /// the engine's cancel path.
    pub async fn stop_run_sessions(&self, run_id: &str) {
        let ids: Vec<String> = {
            let map = self.sessions.read().expect("session registry poisoned");
            map.values()
                .filter(|e| {
                    e.snapshot().run_id.as_deref() == Some(run_id) && !e.status().is_terminal()
                })
                .map(|e| e.snapshot().id)
                .collect()
        };
        for id in ids {
            if let Err(e) = self.stop_session(&id).await {
                tracing::warn!("[Orchestrator] Failed to stop session {}: {}", id, e);
            }
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<SessionEntry>, FlowError> {
        self.sessions
            .read()
            .expect("session registry poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("Session '{}' not found", id)))
    }

    // ─── Mode drivers ─────────────────────────────────────────────────────

    /// Direct/team monitor: watch for exit and enforce the idle timeout.
    fn spawn_direct_monitor(&self, id: String, entry: Arc<SessionEntry>, handle: Arc<SessionHandle>) {
        let logs = self.logs.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(250));
            let code = loop {
                tokio::select! {
                    code = handle.wait() => break code,
                    _ = ticker.tick() => {
                        if let Some(idle_timeout) = entry.spec.idle_timeout {
                            if entry.status() == SessionStatus::Active
                                && handle.idle_for() > idle_timeout
                            {
                                tracing::warn!(
                                    "[Orchestrator:{}] Idle for over {:?}, stopping",
                                    id, idle_timeout
                                );
                                logs.publish(&id, LogLine::system("[session] idle timeout"));
                                entry.fail(FlowError::Timeout(format!(
                                    "No output for {}s",
                                    idle_timeout.as_secs()
                                )));
                                handle.signal_stop(entry.spec.stop_grace).await;
                                logs.close(&id);
                                return;
                            }
                        }
                    }
                }
            };

            if !entry.status().is_terminal() {
                if entry.stop_requested.load(Ordering::SeqCst) || code == 0 {
                    entry.set_status(SessionStatus::Completed);
                } else {
                    entry.fail(FlowError::Execution(format!(
                        "Process exited with code {}",
                        code
                    )));
                }
            }
            logs.publish(
                &id,
                LogLine::system(format!("[session] exited with code {}", code)),
            );
            logs.close(&id);
        });
    }

    /// Team parser: fold NDJSON announcement events from stdout into the
    /// session's team state. Runs until the log stream closes.
    fn spawn_team_parser(&self, id: &str, entry: Arc<SessionEntry>) {
        let (backlog, mut rx) = self.logs.subscribe(id);
        tokio::spawn(async move {
            let mut apply = |line: &LogLine| {
                if line.source != LogSource::Stdout {
                    return;
                }
                if let Some(event) = team::TeamEvent::parse(&line.text) {
                    if let Ok(mut state) = entry.team_state.lock() {
                        team::apply_event(&mut state, event);
                    }
                }
            };
            for line in &backlog {
                apply(line);
            }
            loop {
                match rx.recv().await {
                    Ok(line) => apply(&line),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Autonomous loop driver: one process per iteration.
    fn spawn_loop_driver(&self, id: String, entry: Arc<SessionEntry>) {
        let logs = self.logs.clone();
        let cfg = entry.spec.loop_config.clone().unwrap_or_default();

        {
            let mut state = entry.loop_state.lock().expect("loop state poisoned");
            *state = Some(AutonomousLoopState {
                iteration: 0,
                max_iterations: cfg.max_iterations,
                completion_promise: cfg.completion_promise.clone(),
                no_progress_count: 0,
                no_progress_threshold: cfg.no_progress_threshold,
                circuit_breaker_triggered: false,
            });
        }

        tokio::spawn(async move {
            let mut tracker = ProgressTracker::new();
            let mut iteration: u32 = 0;

            loop {
                // Honor pause between iterations; a stop request also ends
                // the wait.
                while entry.status() == SessionStatus::Paused
                    && !entry.stop_requested.load(Ordering::SeqCst)
                {
                    let mut rx = entry.status_tx.subscribe();
                    let _ = tokio::time::timeout(Duration::from_millis(200), rx.changed()).await;
                }
                if entry.stop_requested.load(Ordering::SeqCst) {
                    entry.set_status(SessionStatus::Completed);
                    break;
                }
                if iteration >= cfg.max_iterations {
                    entry.fail(FlowError::Execution(format!(
                        "Loop exhausted {} iterations without completion promise",
                        cfg.max_iterations
                    )));
                    break;
                }

                iteration += 1;
                if let Ok(mut state) = entry.loop_state.lock() {
                    if let Some(s) = state.as_mut() {
                        s.iteration = iteration;
                    }
                }
                logs.publish(
                    &id,
                    LogLine::system(format!(
                        "[loop] iteration {}/{}",
                        iteration, cfg.max_iterations
                    )),
                );

                let handle = match SessionHandle::spawn(
                    &entry.spec.command,
                    &entry.spec.args,
                    &entry.spec.cwd,
                    logs.clone(),
                    &id,
                ) {
                    Ok(h) => Arc::new(h),
                    Err(e) => {
                        entry.fail(e);
                        break;
                    }
                };
                *entry.handle.lock().await = Some(handle.clone());

                // A stop that raced the spawn found `handle` empty and had
                // nothing to kill; catch it here before the iteration runs.
                if entry.stop_requested.load(Ordering::SeqCst) {
                    handle.signal_stop(entry.spec.stop_grace).await;
                    entry.set_status(SessionStatus::Completed);
                    break;
                }

                let prompt = if iteration == 1 {
                    cfg.task.as_str()
                } else {
                    cfg.continue_prompt.as_str()
                };
                if !prompt.is_empty() {
                    let _ = handle.write_input(prompt).await;
                }

                let code = match handle.wait_timeout(cfg.iteration_timeout).await {
                    Some(code) => code,
                    None => {
                        handle.signal_stop(entry.spec.stop_grace).await;
                        entry.fail(FlowError::Timeout(format!(
                            "Iteration {} exceeded {}s",
                            iteration,
                            cfg.iteration_timeout.as_secs()
                        )));
                        break;
                    }
                };
                *entry.handle.lock().await = None;

                if entry.stop_requested.load(Ordering::SeqCst) {
                    entry.set_status(SessionStatus::Completed);
                    break;
                }

                let output = handle.collected_output();

                if promise_seen(&output, &cfg.completion_promise) {
                    logs.publish(&id, LogLine::system("[loop] completion promise seen"));
                    entry.set_status(SessionStatus::Completed);
                    break;
                }

                if code != 0 {
                    entry.fail(FlowError::Execution(format!(
                        "Iteration {} exited with code {}",
                        iteration, code
                    )));
                    break;
                }

                tracker.observe(&output);
                if let Ok(mut state) = entry.loop_state.lock() {
                    if let Some(s) = state.as_mut() {
                        s.no_progress_count = tracker.consecutive_no_progress();
                    }
                }
                if tracker.breaker_tripped(cfg.no_progress_threshold) {
                    if let Ok(mut state) = entry.loop_state.lock() {
                        if let Some(s) = state.as_mut() {
                            s.circuit_breaker_triggered = true;
                        }
                    }
                    logs.publish(&id, LogLine::system("[loop] circuit breaker triggered"));
                    entry.fail(FlowError::CircuitBreaker(format!(
                        "{} consecutive iterations without progress",
                        cfg.no_progress_threshold
                    )));
                    break;
                }
            }

            logs.close(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> SessionOrchestrator {
        SessionOrchestrator::new(LogBroadcaster::new())
    }

    fn shell(script: &str) -> SessionSpec {
        let mut spec =
            SessionSpec::direct("sh").with_args(vec!["-c".to_string(), script.to_string()]);
        // Keep stop latency low: test scripts ignore stdin EOF.
        spec.stop_grace = Duration::from_millis(200);
        spec
    }

    #[tokio::test]
    async fn test_direct_session_completes_on_exit_zero() {
        let orch = orchestrator();
        let session = orch.start_session(shell("echo done")).await.unwrap();
        let finished = orch.wait(&session.id).await.unwrap();
        assert_eq!(finished.status, SessionStatus::Completed);
        assert!(finished.error.is_none());
    }

    #[tokio::test]
    async fn test_direct_session_fails_on_nonzero_exit() {
        let orch = orchestrator();
        let session = orch.start_session(shell("exit 2")).await.unwrap();
        let finished = orch.wait(&session.id).await.unwrap();
        assert_eq!(finished.status, SessionStatus::Failed);
        assert!(finished.error.unwrap().contains("code 2"));
        assert!(!finished.circuit_breaker_triggered);
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_immediately() {
        let orch = orchestrator();
        let err = orch
            .start_session(SessionSpec::direct("no-such-binary-here"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "spawn");
    }

    #[tokio::test]
    async fn test_pause_resume_stop_transitions() {
        let orch = orchestrator();
        let session = orch.start_session(shell("sleep 30")).await.unwrap();

        let paused = orch.pause_session(&session.id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);

        // Pausing a paused session is an invalid transition.
        let err = orch.pause_session(&session.id).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");

        let resumed = orch.resume_session(&session.id).await.unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);

        let stopped = orch.stop_session(&session.id).await.unwrap();
        assert!(stopped.status.is_terminal());

        // Double stop is a no-op.
        let again = orch.stop_session(&session.id).await.unwrap();
        assert_eq!(again.status, stopped.status);
    }

    #[tokio::test]
    async fn test_status_updates_land_without_any_subscriber() {
        let orch = orchestrator();
        // Nothing holds a watch subscription here; the record and the
        // channel value must still move to active.
        let session = orch.start_session(shell("sleep 30")).await.unwrap();
        assert_eq!(
            orch.get_session(&session.id).unwrap().status,
            SessionStatus::Active
        );
        orch.stop_session(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_requires_paused() {
        let orch = orchestrator();
        let session = orch.start_session(shell("sleep 30")).await.unwrap();
        let err = orch.resume_session(&session.id).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        orch.stop_session(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_input_only_when_active() {
        let orch = orchestrator();
        let session = orch.start_session(SessionSpec::direct("cat")).await.unwrap();

        orch.send_input(&session.id, "hello").await.unwrap();
        orch.pause_session(&session.id).await.unwrap();
        let err = orch.send_input(&session.id, "blocked").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_state");

        orch.resume_session(&session.id).await.unwrap();
        let stopped = orch.stop_session(&session.id).await.unwrap();
        // cat exits 0 on stdin EOF; a user-requested stop is not a failure.
        assert_eq!(stopped.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_direct_session() {
        let orch = orchestrator();
        let mut spec = shell("sleep 30");
        spec.idle_timeout = Some(Duration::from_millis(300));
        spec.stop_grace = Duration::from_millis(100);
        let session = orch.start_session(spec).await.unwrap();

        let finished = orch.wait(&session.id).await.unwrap();
        assert_eq!(finished.status, SessionStatus::Failed);
        assert!(finished.error.unwrap().contains("No output"));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let orch = orchestrator();
        assert_eq!(orch.get_session("nope").unwrap_err().kind(), "not_found");
        assert_eq!(
            orch.stop_session("nope").await.unwrap_err().kind(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn test_stop_run_sessions_only_touches_tagged() {
        let orch = orchestrator();
        let tagged = orch
            .start_session(shell("sleep 30").with_run_id("run-9"))
            .await
            .unwrap();
        let untagged = orch.start_session(shell("sleep 30")).await.unwrap();

        orch.stop_run_sessions("run-9").await;
        assert!(orch.get_session(&tagged.id).unwrap().status.is_terminal());
        assert_eq!(
            orch.get_session(&untagged.id).unwrap().status,
            SessionStatus::Active
        );
        orch.stop_session(&untagged.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_team_session_builds_team_state() {
        let orch = orchestrator();
        let script = r#"
echo '{"event":"team_created","name":"demo"}'
echo '{"event":"member_added","name":"W","agent_id":"w1"}'
echo '{"event":"task_created","id":"t1","subject":"do it"}'
echo '{"event":"task_status","id":"t1","status":"completed"}'
"#;
        let spec = shell(script).with_mode(ExecutionMode::TeamSpawn);
        let session = orch.start_session(spec).await.unwrap();
        orch.wait(&session.id).await.unwrap();

        // The parser consumes the broadcast asynchronously.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let team = orch.team_state(&session.id).unwrap();
        assert_eq!(team.team_name.as_deref(), Some("demo"));
        assert_eq!(team.members.len(), 1);
        assert_eq!(team.tasks.len(), 1);
    }

    fn loop_spec(script: &str, cfg: LoopConfig) -> SessionSpec {
        shell(script)
            .with_mode(ExecutionMode::AutonomousLoop)
            .with_loop_config(cfg)
    }

    #[tokio::test]
    async fn test_loop_completes_on_promise() {
        let orch = orchestrator();
        // Reads the prompt, emits progress, finishes on the second round.
        let script = r#"
read prompt
if [ "$prompt" = "start" ]; then echo "working on it"; else echo "ALL DONE"; fi
"#;
        let cfg = LoopConfig {
            task: "start".to_string(),
            completion_promise: "ALL DONE".to_string(),
            max_iterations: 5,
            ..LoopConfig::default()
        };
        let session = orch.start_session(loop_spec(script, cfg)).await.unwrap();
        let finished = orch.wait(&session.id).await.unwrap();
        assert_eq!(finished.status, SessionStatus::Completed);

        let state = orch.loop_state(&session.id).unwrap().unwrap();
        assert_eq!(state.iteration, 2);
        assert!(!state.circuit_breaker_triggered);
    }

    #[tokio::test]
    async fn test_loop_circuit_breaker_trips_on_repeated_output() {
        let orch = orchestrator();
        let script = "read prompt; echo same-output-every-time";
        let cfg = LoopConfig {
            task: "go".to_string(),
            completion_promise: "NEVER".to_string(),
            max_iterations: 20,
            no_progress_threshold: 3,
            ..LoopConfig::default()
        };
        let session = orch.start_session(loop_spec(script, cfg)).await.unwrap();
        let finished = orch.wait(&session.id).await.unwrap();

        assert_eq!(finished.status, SessionStatus::Failed);
        assert!(finished.circuit_breaker_triggered);
        assert!(finished.error.unwrap().contains("without progress"));

        // Iteration 1 made progress; the breaker needs 3 more.
        let state = orch.loop_state(&session.id).unwrap().unwrap();
        assert_eq!(state.iteration, 4);
        assert!(state.circuit_breaker_triggered);
    }

    #[tokio::test]
    async fn test_loop_fails_after_max_iterations() {
        let orch = orchestrator();
        // Unique output each round: no breaker, just exhaustion.
        let script = "read prompt; date +%s%N";
        let cfg = LoopConfig {
            task: "go".to_string(),
            completion_promise: "NEVER".to_string(),
            max_iterations: 3,
            no_progress_threshold: 10,
            ..LoopConfig::default()
        };
        let session = orch.start_session(loop_spec(script, cfg)).await.unwrap();
        let finished = orch.wait(&session.id).await.unwrap();

        assert_eq!(finished.status, SessionStatus::Failed);
        assert!(!finished.circuit_breaker_triggered);
        assert!(finished.error.unwrap().contains("exhausted"));
    }

    #[tokio::test]
    async fn test_stop_ends_loop_session_within_grace() {
        let orch = orchestrator();
        let cfg = LoopConfig {
            task: "go".to_string(),
            completion_promise: "NEVER".to_string(),
            max_iterations: 50,
            ..LoopConfig::default()
        };
        let session = orch
            .start_session(loop_spec("read prompt; sleep 30", cfg))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopped = tokio::time::timeout(
            Duration::from_secs(10),
            orch.stop_session(&session.id),
        )
        .await
        .expect("stop must return within its bound")
        .unwrap();
        assert!(stopped.status.is_terminal());
    }

    #[tokio::test]
    async fn test_loop_crash_is_not_circuit_breaker() {
        let orch = orchestrator();
        let script = "read prompt; echo boom; exit 9";
        let cfg = LoopConfig {
            task: "go".to_string(),
            ..LoopConfig::default()
        };
        let session = orch.start_session(loop_spec(script, cfg)).await.unwrap();
        let finished = orch.wait(&session.id).await.unwrap();

        assert_eq!(finished.status, SessionStatus::Failed);
        assert!(!finished.circuit_breaker_triggered);
        assert!(finished.error.unwrap().contains("code 9"));
    }
}
