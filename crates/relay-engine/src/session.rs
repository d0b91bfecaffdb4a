//! Session state machine: one in-flight `ask` or `chain`.
//!
//! ```text
//! Pending -> Running -> (StepAwait <-> Running) -> Completed | Failed | TimedOut
//! ```
//!
//! Steps run strictly one after another. Step 0 receives the seed; every later
//! step receives the previous step's output. A failed step ends the session;
//! the results collected so far stay on it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::command::{Chain, Invocation, StepTemplate};
use relay_core::ids::{CorrelationId, SessionId};

use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, SessionError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    StepAwait,
    Completed,
    Failed,
    TimedOut,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::StepAwait => "step_await",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AgentError,
    Unavailable,
    Timeout,
    Transport,
    Cancelled,
}

impl FailureKind {
    /// Terminal status a failure of this kind produces.
    pub fn terminal_status(&self) -> SessionStatus {
        match self {
            Self::Timeout | Self::Transport => SessionStatus::TimedOut,
            Self::AgentError | Self::Unavailable | Self::Cancelled => SessionStatus::Failed,
        }
    }
}

/// Why and where a session stopped early.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepFailure {
    /// Zero-based step index.
    pub step: usize,
    pub agent_id: String,
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
}

impl StepFailure {
    fn from_dispatch(step: usize, template: &StepTemplate, attempts: u32, err: &DispatchError) -> Self {
        let kind = match err {
            DispatchError::AgentError(_) => FailureKind::AgentError,
            DispatchError::Unavailable(_) => FailureKind::Unavailable,
            DispatchError::Timeout(_) => FailureKind::Timeout,
            DispatchError::Transport(_) => FailureKind::Transport,
        };
        Self {
            step,
            agent_id: template.agent_id.clone(),
            kind,
            reason: err.to_string(),
            attempts,
        }
    }

    fn cancelled(step: usize, template: &StepTemplate, attempts: u32) -> Self {
        Self {
            step,
            agent_id: template.agent_id.clone(),
            kind: FailureKind::Cancelled,
            reason: "cancelled".into(),
            attempts,
        }
    }
}

/// A resolved step: what was sent and what came back.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepRecord {
    pub invocation: Invocation,
    pub output: String,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub origin_channel: String,
    pub origin_user: String,
    pub chain: Chain,
    pub current_index: usize,
    /// Attempt number of the current step, starting at 1.
    pub attempt: u32,
    pub step_results: Vec<StepRecord>,
    pub status: SessionStatus,
    pub failure: Option<StepFailure>,
    /// Correlation id of the outstanding request while in `StepAwait`.
    pub correlation_id: Option<CorrelationId>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline_per_step: Duration,
}

impl Session {
    fn new(chain: Chain, origin_channel: String, origin_user: String, deadline_per_step: Duration) -> Self {
        Self {
            id: SessionId::new(),
            origin_channel,
            origin_user,
            chain,
            current_index: 0,
            attempt: 0,
            step_results: Vec::new(),
            status: SessionStatus::Pending,
            failure: None,
            correlation_id: None,
            created_at: Utc::now(),
            finished_at: None,
            deadline_per_step,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.chain.len()
    }

    pub fn current_agent(&self) -> Option<&str> {
        self.chain
            .steps
            .get(self.current_index)
            .map(|s| s.agent_id.as_str())
    }

    /// Output of the last completed step.
    pub fn final_output(&self) -> Option<&str> {
        self.step_results.last().map(|r| r.output.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub step_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_factor: f64,
    /// Finished sessions kept for `recent()`.
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            max_retries: 1,
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            jitter_factor: 0.2,
            history_limit: 50,
        }
    }
}

struct ActiveSession {
    state: Arc<Mutex<Session>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

/// Owns every in-flight session.
pub struct SessionManager {
    dispatcher: Arc<Dispatcher>,
    config: SessionConfig,
    active: DashMap<SessionId, ActiveSession>,
    recent: Mutex<VecDeque<Session>>,
    total_retries: AtomicU64,
}

impl SessionManager {
    pub fn new(dispatcher: Arc<Dispatcher>, config: SessionConfig) -> Self {
        Self {
            dispatcher,
            config,
            active: DashMap::new(),
            recent: Mutex::new(VecDeque::new()),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a `Pending` session. Drive it with [`run`](Self::run).
    pub fn create(
        &self,
        chain: Chain,
        origin_channel: impl Into<String>,
        origin_user: impl Into<String>,
    ) -> SessionId {
        let session = Session::new(
            chain,
            origin_channel.into(),
            origin_user.into(),
            self.config.step_timeout,
        );
        let id = session.id.clone();
        debug!(session_id = %id, steps = session.total_steps(), "session created");
        let _ = self.active.insert(
            id.clone(),
            ActiveSession {
                state: Arc::new(Mutex::new(session)),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
            },
        );
        id
    }

    /// Run a created session to a terminal state and return its final form.
    pub async fn run(&self, id: &SessionId) -> Result<Session, SessionError> {
        let (state, cancel) = {
            let entry = self
                .active
                .get(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            if entry.started.swap(true, Ordering::SeqCst) {
                return Err(SessionError::AlreadyStarted(id.clone()));
            }
            (entry.state.clone(), entry.cancel.clone())
        };

        let outcome = self.drive(id, &state, &cancel).await;
        Ok(self.finish(id, &state, outcome))
    }

    async fn drive(
        &self,
        id: &SessionId,
        state: &Mutex<Session>,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let chain = {
            let mut s = state.lock();
            s.status = SessionStatus::Running;
            s.chain.clone()
        };

        let mut input = chain.seed.clone();
        for (index, step) in chain.steps.iter().enumerate() {
            let mut attempt = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(StepFailure::cancelled(index, step, attempt));
                }
                attempt += 1;
                {
                    let mut s = state.lock();
                    s.status = SessionStatus::Running;
                    s.current_index = index;
                    s.attempt = attempt;
                }

                let (correlation_id, pending) = self
                    .dispatcher
                    .send(&step.agent_id, &step.command, &input, self.config.step_timeout)
                    .await;
                {
                    let mut s = state.lock();
                    s.status = SessionStatus::StepAwait;
                    s.correlation_id = Some(correlation_id.clone());
                }

                let result = tokio::select! {
                    result = pending.wait() => result,
                    _ = cancel.cancelled() => {
                        let _ = self.dispatcher.forget(&correlation_id);
                        return Err(StepFailure::cancelled(index, step, attempt));
                    }
                };
                state.lock().correlation_id = None;

                match result {
                    Ok(output) => {
                        debug!(
                            session_id = %id,
                            step = index + 1,
                            agent_id = %step.agent_id,
                            attempt,
                            "step completed"
                        );
                        state.lock().step_results.push(StepRecord {
                            invocation: Invocation {
                                agent_id: step.agent_id.clone(),
                                command: step.command.clone(),
                                args: input.clone(),
                            },
                            output: output.clone(),
                            attempts: attempt,
                        });
                        input = output;
                        break;
                    }
                    Err(e) => {
                        let retries_used = attempt - 1;
                        if retries_used >= self.config.max_retries {
                            return Err(StepFailure::from_dispatch(index, step, attempt, &e));
                        }

                        let delay = self.retry_delay(retries_used);
                        let _ = self.total_retries.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            session_id = %id,
                            step = index + 1,
                            agent_id = %step.agent_id,
                            attempt,
                            max_retries = self.config.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying step"
                        );
                        state.lock().status = SessionStatus::Running;
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {
                                return Err(StepFailure::cancelled(index, step, attempt));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&self, id: &SessionId, state: &Mutex<Session>, outcome: Result<(), StepFailure>) -> Session {
        let snapshot = {
            let mut s = state.lock();
            match outcome {
                Ok(()) => s.status = SessionStatus::Completed,
                Err(failure) => {
                    s.status = failure.kind.terminal_status();
                    s.failure = Some(failure);
                }
            }
            s.correlation_id = None;
            s.finished_at = Some(Utc::now());
            s.clone()
        };

        let _ = self.active.remove(id);
        {
            let mut recent = self.recent.lock();
            recent.push_back(snapshot.clone());
            while recent.len() > self.config.history_limit {
                let _ = recent.pop_front();
            }
        }

        info!(
            session_id = %id,
            status = snapshot.status.as_str(),
            steps_completed = snapshot.step_results.len(),
            steps_total = snapshot.total_steps(),
            "session finished"
        );
        snapshot
    }

    /// Force a live session to `Failed("cancelled")`. Any reply that arrives
    /// for its outstanding request afterwards is discarded.
    pub fn cancel(&self, id: &SessionId) -> Result<(), SessionError> {
        let entry = self
            .active
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        entry.cancel.cancel();
        info!(session_id = %id, "session cancel requested");
        Ok(())
    }

    /// Snapshot of a live or recently finished session.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        if let Some(entry) = self.active.get(id) {
            return Some(entry.state.lock().clone());
        }
        self.recent.lock().iter().rev().find(|s| &s.id == id).cloned()
    }

    /// Live sessions, oldest first.
    pub fn active(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .active
            .iter()
            .map(|entry| entry.state.lock().clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Finished sessions, oldest first.
    pub fn recent(&self) -> Vec<Session> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Exponential backoff with jitter, capped at `max_backoff`.
    fn retry_delay(&self, retries_used: u32) -> Duration {
        let base = self.config.retry_backoff.as_millis() as f64;
        let exp_delay = base * 2.0_f64.powi(retries_used as i32);
        let capped = exp_delay.min(self.config.max_backoff.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}
