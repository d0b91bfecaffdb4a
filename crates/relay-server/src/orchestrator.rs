//! The orchestrator: the one participant on the coordination channel that
//! turns user commands into agent sessions.
//!
//! An inbound pump reads every message on the channel, and one more pump
//! runs per agent inbox the orchestrator has joined. Envelope frames feed
//! the agent registry and the dispatcher's wait table; plain text goes to
//! [`Orchestrator::handle_incoming`] on its own task. Each command gets
//! exactly one reply on the channel it came from.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::command::{AdminCommand, Chain, ParsedCommand};
use relay_core::envelope::{Envelope, EnvelopeKind};
use relay_core::errors::TransportError;
use relay_core::transport::{send_envelope, InboundMessage, Subscription, Transport};
use relay_engine::{
    AgentRegistry, CommandParser, Dispatcher, Registration, RegistryError, Session, SessionConfig,
    SessionManager, SessionStatus,
};
use relay_settings::RelaySettings;
use relay_telemetry::MetricsRecorder;

use crate::format::{self, StatusSummary};

/// Request command answered with a [`HealthReport`].
pub const HEALTH_CHECK_COMMAND: &str = "health_check";

const MESSAGES_ROUTED: &str = "messages.routed";
const SESSIONS_FINISHED: &str = "sessions.finished";
const SESSIONS_ACTIVE: &str = "sessions.active";
const SESSION_DURATION_MS: &str = "session.duration_ms";
const AGENTS_DISCOVERED: &str = "agents.discovered";
const AGENTS_ONLINE: &str = "agents.online";
const PARSE_ERRORS: &str = "commands.parse_errors";

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub id: String,
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub command_prefix: String,
    pub channel: String,
    pub agent_ttl: Duration,
    pub sweep_interval: Duration,
    pub session: SessionConfig,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let o = &settings.orchestrator;
        let s = &settings.session;
        Self {
            id: o.id.clone(),
            display_name: o.display_name.clone(),
            capabilities: o.capabilities.clone(),
            command_prefix: o.command_prefix.clone(),
            channel: o.coordination_channel.clone(),
            agent_ttl: settings.agent_ttl(),
            sweep_interval: settings.sweep_interval(),
            session: SessionConfig {
                step_timeout: settings.step_timeout(),
                max_retries: s.max_retries,
                retry_backoff: Duration::from_millis(s.retry_backoff_ms),
                max_backoff: Duration::from_millis(s.max_backoff_ms),
                jitter_factor: s.jitter_factor,
                history_limit: s.history_limit,
            },
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&RelaySettings::default())
    }
}

/// Body of `/health` and of `health_check` responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub agents: AgentHealth,
    pub sessions: SessionHealth,
    pub uptime_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AgentHealth {
    pub total: usize,
    pub online: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SessionHealth {
    pub active: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    parser: CommandParser,
    metrics: Arc<MetricsRecorder>,
    started_at: Instant,
    cancel: CancellationToken,
    listening: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsRecorder>,
    ) -> Arc<Self> {
        let registry = Arc::new(AgentRegistry::new(config.agent_ttl));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            config.id.clone(),
            config.channel.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&dispatcher),
            config.session.clone(),
        ));
        let parser = CommandParser::new(config.command_prefix.clone(), &config.id);

        Arc::new(Self {
            config,
            transport,
            registry,
            dispatcher,
            sessions,
            parser,
            metrics,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            listening: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Join the coordination channel, start the inbound pump and the
    /// liveness sweep, and announce ourselves.
    pub async fn start(self: &Arc<Self>) -> Result<OrchestratorHandle, TransportError> {
        let channel = self.config.channel.as_str();
        self.listen(channel).await?;
        let sweep = tokio::spawn(Arc::clone(self).sweep_loop());
        self.tasks.lock().push(sweep);

        let announce = Envelope::announce(
            &self.config.id,
            &self.config.display_name,
            self.config.capabilities.clone(),
        );
        send_envelope(self.transport.as_ref(), channel, &announce).await?;

        info!(
            orchestrator_id = %self.config.id,
            channel,
            prefix = %self.config.command_prefix,
            "orchestrator started"
        );
        Ok(OrchestratorHandle {
            orchestrator: Arc::clone(self),
        })
    }

    /// Join `channel` and pump what arrives on it into [`Self::route`].
    /// A channel already listened to is left alone.
    async fn listen(self: &Arc<Self>, channel: &str) -> Result<(), TransportError> {
        if !self.listening.lock().insert(channel.to_string()) {
            return Ok(());
        }
        let subscribed = match self.transport.join(channel).await {
            Ok(()) => self.transport.subscribe(channel),
            Err(e) => Err(e),
        };
        match subscribed {
            Ok(inbound) => {
                let pump = tokio::spawn(Arc::clone(self).pump(channel.to_string(), inbound));
                self.tasks.lock().push(pump);
                debug!(channel, "listening");
                Ok(())
            }
            Err(e) => {
                let _ = self.listening.lock().remove(channel);
                Err(e)
            }
        }
    }

    // Boxed: `listen` spawns pumps and `route` can reach `listen`.
    fn pump(self: Arc<Self>, channel: String, mut inbound: Subscription) -> BoxFuture<'static, ()> {
        async move {
            loop {
                let message = tokio::select! {
                    () = self.cancel.cancelled() => break,
                    next = inbound.next() => match next {
                        Some(message) => message,
                        None => {
                            warn!(%channel, "inbound stream closed");
                            break;
                        }
                    },
                };
                self.route(message).await;
            }
            debug!(%channel, "inbound pump stopped");
        }
        .boxed()
    }

    /// Route one inbound message.
    pub async fn route(self: &Arc<Self>, message: InboundMessage) {
        if message.sender == self.config.id {
            return;
        }

        match Envelope::decode(&message.body) {
            Ok(Some(envelope)) => {
                self.route_envelope(envelope, &message.channel, &message.sender)
                    .await;
            }
            Ok(None) => {
                let this = Arc::clone(self);
                let _ = tokio::spawn(async move {
                    let _ = this
                        .handle_incoming(&message.body, &message.channel, &message.sender)
                        .await;
                });
            }
            Err(e) => {
                warn!(sender = %message.sender, error = %e, "dropping malformed envelope");
            }
        }
    }

    async fn route_envelope(self: &Arc<Self>, envelope: Envelope, channel: &str, sender: &str) {
        if !envelope.is_for(&self.config.id) {
            return;
        }
        // An envelope speaks only for the participant that posted it.
        if envelope.from != sender {
            warn!(
                sender,
                from = %envelope.from,
                kind = envelope.kind.as_str(),
                "dropping envelope sent on behalf of another participant"
            );
            return;
        }
        self.metrics
            .counter_inc(MESSAGES_ROUTED, &[("kind", envelope.kind.as_str())], 1);

        match envelope.kind {
            EnvelopeKind::Announce => {
                // Join the inbox before the agent becomes dispatchable.
                if let Some(inbox) = envelope.inbox.as_deref() {
                    if let Err(e) = self.listen(inbox).await {
                        warn!(agent_id = %envelope.from, inbox, error = %e, "could not join agent inbox");
                    }
                }
                match self.registry.register(&envelope) {
                    Ok(Registration::Discovered) => {
                        self.metrics.counter_inc(AGENTS_DISCOVERED, &[], 1);
                    }
                    Ok(Registration::Refreshed) => {}
                    Err(e) => warn!(agent_id = %envelope.from, error = %e, "announce rejected"),
                }
            }
            EnvelopeKind::Heartbeat => {
                if let Err(RegistryError::NotFound(id)) =
                    self.registry.heartbeat(&envelope.from, envelope.status)
                {
                    debug!(agent_id = %id, "heartbeat from unannounced agent");
                }
            }
            EnvelopeKind::Depart => {
                let _ = self.registry.depart(&envelope.from);
            }
            EnvelopeKind::Response | EnvelopeKind::Error => {
                let _ = self.dispatcher.resolve(&envelope);
            }
            EnvelopeKind::Request => self.answer_request(&envelope, channel).await,
        }
        self.update_agent_gauge();
    }

    async fn answer_request(&self, request: &Envelope, channel: &str) {
        let reply = match request.command.as_deref() {
            Some(HEALTH_CHECK_COMMAND) => match serde_json::to_string(&self.health()) {
                Ok(json) => request.reply(&self.config.id, json),
                Err(e) => request.reply_error(&self.config.id, e.to_string()),
            },
            _ => request.reply_error(&self.config.id, "unknown message type"),
        };
        let Some(reply) = reply else {
            return;
        };
        if let Err(e) = send_envelope(self.transport.as_ref(), channel, &reply).await {
            warn!(to = %request.from, error = %e, "failed to answer request");
        }
    }

    /// Handle one plain-text line from `user` on `channel`.
    ///
    /// Returns the reply that was posted, or `None` for ordinary chat. For
    /// `ask` and `chain` this waits for the session to reach a terminal
    /// state.
    pub async fn handle_incoming(&self, text: &str, channel: &str, user: &str) -> Option<String> {
        let command = match self.parser.parse(text, channel, user) {
            Ok(command) => command,
            Err(e) if e.is_silent() => return None,
            Err(e) => {
                self.metrics.counter_inc(PARSE_ERRORS, &[("kind", e.error_kind())], 1);
                debug!(user, error = %e, "command rejected");
                let reply = format::parse_error(&e, self.parser.prefix());
                self.reply(channel, &reply).await;
                return Some(reply);
            }
        };

        let reply = match command {
            ParsedCommand::Admin(admin) => self.admin_reply(admin),
            ParsedCommand::Ask(invocation) => self.run_chain(invocation.into(), channel, user).await,
            ParsedCommand::Chain(chain) => self.run_chain(chain, channel, user).await,
        };
        self.reply(channel, &reply).await;
        Some(reply)
    }

    fn admin_reply(&self, command: AdminCommand) -> String {
        match command {
            AdminCommand::Help => format::help(self.parser.prefix()),
            AdminCommand::Status => format::status(&self.status_summary()),
            AdminCommand::Agents => format::agents(&self.registry.snapshot()),
            AdminCommand::Capabilities => format::capabilities(&self.registry.capabilities()),
            AdminCommand::Sessions => format::sessions(&self.sessions.active()),
            AdminCommand::Cancel(id) => match self.sessions.cancel(&id) {
                Ok(()) => format::cancel_requested(id.as_str()),
                Err(_) => format::session_not_found(id.as_str()),
            },
        }
    }

    async fn run_chain(&self, chain: Chain, channel: &str, user: &str) -> String {
        let mut missing: Vec<&str> = Vec::new();
        for id in chain.agent_ids() {
            if !self.registry.contains(id) && !missing.contains(&id) {
                missing.push(id);
            }
        }
        if !missing.is_empty() {
            info!(user, agents = ?missing, "command names unknown agents");
            return format::agent_not_found(&missing);
        }

        let id = self.sessions.create(chain, channel, user);
        self.metrics
            .gauge_set(SESSIONS_ACTIVE, &[], self.sessions.active_count() as f64);
        info!(session_id = %id, user, channel, "session started");

        let session = match self.sessions.run(&id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(session_id = %id, error = %e, "session could not run");
                return e.to_string();
            }
        };
        self.record_finished(&session);
        format::session_outcome(&session)
    }

    fn record_finished(&self, session: &Session) {
        self.metrics
            .counter_inc(SESSIONS_FINISHED, &[("status", session.status.as_str())], 1);
        self.metrics
            .gauge_set(SESSIONS_ACTIVE, &[], self.sessions.active_count() as f64);
        if let Some(finished) = session.finished_at {
            let ms = (finished - session.created_at).num_milliseconds().max(0);
            self.metrics.histogram_observe(SESSION_DURATION_MS, &[], ms as f64);
        }
    }

    async fn reply(&self, channel: &str, text: &str) {
        if let Err(e) = self.transport.send(channel, text).await {
            warn!(channel, error = %e, "failed to post reply");
        }
    }

    fn finished_count(&self, status: SessionStatus) -> u64 {
        self.metrics
            .counter_get(SESSIONS_FINISHED, &[("status", status.as_str())])
    }

    pub fn status_summary(&self) -> StatusSummary {
        StatusSummary {
            uptime: self.uptime(),
            agents: self.registry.counts(),
            active_sessions: self.sessions.active_count(),
            completed: self.finished_count(SessionStatus::Completed),
            failed: self.finished_count(SessionStatus::Failed),
            timed_out: self.finished_count(SessionStatus::TimedOut),
            retries: self.sessions.total_retries(),
            session_duration_ms: self.metrics.histogram_summary(SESSION_DURATION_MS, &[]),
            messages_routed: self.metrics.counter_total(MESSAGES_ROUTED),
            parse_errors: self.metrics.counter_total(PARSE_ERRORS),
        }
    }

    pub fn health(&self) -> HealthReport {
        let counts = self.registry.counts();
        HealthReport {
            status: "ok",
            agents: AgentHealth {
                total: counts.total,
                online: counts.online + counts.busy,
            },
            sessions: SessionHealth {
                active: self.sessions.active_count(),
            },
            uptime_secs: self.uptime().as_secs(),
        }
    }

    /// Mark agents whose heartbeats stopped as offline.
    pub fn sweep(&self) -> Vec<String> {
        let expired = self.registry.sweep_expired(Utc::now());
        if !expired.is_empty() {
            self.update_agent_gauge();
        }
        expired
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.sweep();
                }
            }
        }
    }

    fn update_agent_gauge(&self) {
        let counts = self.registry.counts();
        self.metrics
            .gauge_set(AGENTS_ONLINE, &[], (counts.online + counts.busy) as f64);
    }
}

/// Keeps the orchestrator's background tasks alive until shut down.
pub struct OrchestratorHandle {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorHandle {
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Say goodbye on the channel, then stop the pumps and the sweep.
    pub async fn shutdown(self) {
        let o = &self.orchestrator;
        let depart = Envelope::depart(&o.config.id);
        if let Err(e) = send_envelope(o.transport.as_ref(), &o.config.channel, &depart).await {
            warn!(error = %e, "failed to send depart");
        }
        o.cancel.cancel();
        let tasks = std::mem::take(&mut *o.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(orchestrator_id = %o.config.id, "orchestrator stopped");
    }
}
