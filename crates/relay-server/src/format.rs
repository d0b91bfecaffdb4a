//! Reply text posted back to the channel a command came from.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use relay_core::agent::Agent;
use relay_engine::{FailureKind, ParseError, RegistryCounts, Session, SessionStatus};
use relay_telemetry::HistogramSummary;

/// Figures shown by `status`.
#[derive(Clone, Debug, Default)]
pub struct StatusSummary {
    pub uptime: Duration,
    pub agents: RegistryCounts,
    pub active_sessions: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retries: u64,
    pub session_duration_ms: HistogramSummary,
    pub messages_routed: u64,
    pub parse_errors: u64,
}

pub fn usage(prefix: &str) -> String {
    format!(
        "Usage:\n\
         \x20 {prefix} help\n\
         \x20 {prefix} status\n\
         \x20 {prefix} agents\n\
         \x20 {prefix} capabilities\n\
         \x20 {prefix} sessions\n\
         \x20 {prefix} cancel <session-id>\n\
         \x20 {prefix} ask <agent> \"<query>\"\n\
         \x20 {prefix} chain <agent1>-><agent2>[->...] \"<input>\""
    )
}

pub fn help(prefix: &str) -> String {
    format!(
        "I route requests to the agents on this channel.\n{}",
        usage(prefix)
    )
}

pub fn parse_error(err: &ParseError, prefix: &str) -> String {
    format!("Could not parse command: {err}\n{}", usage(prefix))
}

pub fn agent_not_found(missing: &[&str]) -> String {
    match missing {
        [one] => format!("agent not found: {one}"),
        many => format!("agents not found: {}", many.join(", ")),
    }
}

pub fn status(summary: &StatusSummary) -> String {
    let a = &summary.agents;
    let d = &summary.session_duration_ms;
    let durations = if d.count == 0 {
        "-".to_string()
    } else {
        format!(
            "p50 {} / p95 {} / max {} over {}",
            format_ms(d.p50),
            format_ms(d.p95),
            format_ms(d.max),
            d.count
        )
    };
    format!(
        "Uptime: {}\n\
         Agents: {} total ({} online, {} busy, {} offline)\n\
         Sessions: {} active, {} completed, {} failed, {} timed out\n\
         Session duration: {}\n\
         Retries: {}\n\
         Messages routed: {}\n\
         Parse errors: {}",
        format_uptime(summary.uptime),
        a.total,
        a.online,
        a.busy,
        a.offline,
        summary.active_sessions,
        summary.completed,
        summary.failed,
        summary.timed_out,
        durations,
        summary.retries,
        summary.messages_routed,
        summary.parse_errors,
    )
}

pub fn agents(agents: &[Agent]) -> String {
    if agents.is_empty() {
        return "No agents registered.".to_string();
    }
    let mut out = format!("Agents ({}):", agents.len());
    for agent in agents {
        let caps: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
        let _ = write!(
            out,
            "\n  {} [{}] {}",
            agent.id,
            agent.status.as_str(),
            if caps.is_empty() { "-".to_string() } else { caps.join(", ") }
        );
    }
    out
}

pub fn capabilities(index: &BTreeMap<String, Vec<String>>) -> String {
    if index.is_empty() {
        return "No capabilities available.".to_string();
    }
    let mut out = String::from("Capabilities:");
    for (cap, ids) in index {
        let _ = write!(out, "\n  {cap}: {}", ids.join(", "));
    }
    out
}

pub fn sessions(active: &[Session]) -> String {
    if active.is_empty() {
        return "No active sessions.".to_string();
    }
    let mut out = format!("Active sessions ({}):", active.len());
    for s in active {
        let _ = write!(
            out,
            "\n  {} [{}] step {}/{} ({}) for {}",
            s.id,
            s.status.as_str(),
            s.current_index + 1,
            s.total_steps(),
            s.current_agent().unwrap_or("-"),
            s.origin_user,
        );
    }
    out
}

pub fn cancel_requested(id: &str) -> String {
    format!("Cancelling session {id}.")
}

pub fn session_not_found(id: &str) -> String {
    format!("session not found: {id}")
}

/// The single reply for a finished session.
///
/// A completed session answers with the last step's output and nothing
/// else. A failed one names the step, the agent and the reason, followed by
/// whatever earlier steps produced.
pub fn session_outcome(session: &Session) -> String {
    if session.status == SessionStatus::Completed {
        return session.final_output().unwrap_or_default().to_string();
    }

    let mut out = match &session.failure {
        Some(f) => {
            let step = f.step + 1;
            let agent = &f.agent_id;
            match f.kind {
                FailureKind::Timeout => format!("step {step} ({agent}) {}", f.reason),
                FailureKind::Transport => format!("step {step} ({agent}) timed out: {}", f.reason),
                FailureKind::AgentError | FailureKind::Unavailable => {
                    format!("step {step} ({agent}) failed: {}", f.reason)
                }
                FailureKind::Cancelled => format!("step {step} ({agent}) was cancelled"),
            }
        }
        None => format!("session {}", session.status.as_str()),
    };
    if let Some(f) = &session.failure {
        if f.attempts > 1 {
            let _ = write!(out, " after {} attempts", f.attempts);
        }
    }

    if !session.step_results.is_empty() {
        out.push_str("\nPartial results:");
        for (i, record) in session.step_results.iter().enumerate() {
            let _ = write!(
                out,
                "\n  step {} ({}): {}",
                i + 1,
                record.invocation.agent_id,
                record.output
            );
        }
    }
    out
}

fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.1}s", ms / 1000.0)
    } else {
        format!("{ms:.0}ms")
    }
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
