use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use relay_core::agent::{Agent, AgentStatus};
use relay_core::envelope::{Envelope, EnvelopeKind};

use crate::error::RegistryError;

/// What an accepted announce did to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// First time this agent id was seen.
    Discovered,
    /// A known agent re-announced (possibly coming back from offline).
    Refreshed,
}

/// Agent totals by status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub total: usize,
    pub online: usize,
    pub busy: usize,
    pub offline: usize,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, Agent>,
    /// capability -> agent ids declaring it
    by_capability: HashMap<String, BTreeSet<String>>,
}

impl RegistryState {
    fn index(&mut self, agent_id: &str, old: &BTreeSet<String>, new: &BTreeSet<String>) {
        for cap in old.difference(new) {
            if let Some(ids) = self.by_capability.get_mut(cap) {
                let _ = ids.remove(agent_id);
                if ids.is_empty() {
                    let _ = self.by_capability.remove(cap);
                }
            }
        }
        for cap in new.difference(old) {
            let _ = self
                .by_capability
                .entry(cap.clone())
                .or_default()
                .insert(agent_id.to_string());
        }
    }
}

/// The set of agents seen on the coordination channel.
///
/// Entries are never removed. An agent that stops heartbeating, or departs,
/// stays listed as `Offline`.
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
    ttl: chrono::Duration,
}

impl AgentRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
        }
    }

    pub fn register(&self, announce: &Envelope) -> Result<Registration, RegistryError> {
        self.register_at(announce, Utc::now())
    }

    /// Upsert the announcing agent, replacing its capability set.
    pub fn register_at(
        &self,
        announce: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<Registration, RegistryError> {
        if announce.kind != EnvelopeKind::Announce {
            return Err(RegistryError::NotAnAnnounce(announce.kind.as_str()));
        }

        let capabilities: BTreeSet<String> = announce
            .capabilities
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let mut state = self.state.write();
        let existing = state.agents.remove(&announce.from);
        let registration = if existing.is_some() {
            Registration::Refreshed
        } else {
            Registration::Discovered
        };

        let mut agent = existing.unwrap_or_else(|| Agent::new(announce.from.clone(), now));
        let old_caps = std::mem::take(&mut agent.capabilities);
        state.index(&announce.from, &old_caps, &capabilities);

        if let Some(name) = announce.display_name.as_deref().filter(|n| !n.trim().is_empty()) {
            agent.display_name = name.to_string();
        }
        agent.capabilities = capabilities;
        agent.inbox = announce.inbox.clone();
        agent.status = live_status(announce.status);
        agent.last_seen = now;

        match registration {
            Registration::Discovered => info!(
                agent_id = %agent.id,
                capabilities = ?agent.capabilities,
                "agent discovered"
            ),
            Registration::Refreshed => debug!(agent_id = %agent.id, "agent re-announced"),
        }

        let _ = state.agents.insert(agent.id.clone(), agent);
        Ok(registration)
    }

    pub fn heartbeat(&self, agent_id: &str, status: Option<AgentStatus>) -> Result<(), RegistryError> {
        self.heartbeat_at(agent_id, status, Utc::now())
    }

    /// Refresh liveness. Unknown agents must announce first.
    pub fn heartbeat_at(
        &self,
        agent_id: &str,
        status: Option<AgentStatus>,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        if agent.status == AgentStatus::Offline {
            info!(agent_id, "agent back online");
        }
        agent.status = live_status(status);
        agent.last_seen = now;
        Ok(())
    }

    /// Mark an agent offline immediately.
    pub fn depart(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))?;
        agent.status = AgentStatus::Offline;
        info!(agent_id, "agent departed");
        Ok(())
    }

    pub fn lookup(&self, agent_id: &str) -> Result<Agent, RegistryError> {
        self.state
            .read()
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(agent_id.to_string()))
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.state.read().agents.contains_key(agent_id)
    }

    /// Reachable agents declaring `capability`, sorted by id.
    pub fn list_by_capability(&self, capability: &str) -> Vec<Agent> {
        let state = self.state.read();
        state
            .by_capability
            .get(capability)
            .into_iter()
            .flatten()
            .filter_map(|id| state.agents.get(id))
            .filter(|a| a.is_reachable())
            .cloned()
            .collect()
    }

    /// Capability -> reachable agent ids. Capabilities with no reachable
    /// agent are omitted.
    pub fn capabilities(&self) -> BTreeMap<String, Vec<String>> {
        let state = self.state.read();
        state
            .by_capability
            .iter()
            .filter_map(|(cap, ids)| {
                let live: Vec<String> = ids
                    .iter()
                    .filter(|id| state.agents.get(*id).is_some_and(Agent::is_reachable))
                    .cloned()
                    .collect();
                (!live.is_empty()).then(|| (cap.clone(), live))
            })
            .collect()
    }

    /// Every known agent, sorted by id.
    pub fn snapshot(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.state.read().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn counts(&self) -> RegistryCounts {
        let state = self.state.read();
        let mut counts = RegistryCounts {
            total: state.agents.len(),
            ..Default::default()
        };
        for agent in state.agents.values() {
            match agent.status {
                AgentStatus::Online => counts.online += 1,
                AgentStatus::Busy => counts.busy += 1,
                AgentStatus::Offline => counts.offline += 1,
            }
        }
        counts
    }

    /// Flip agents not seen within the TTL to `Offline`. Returns their ids.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        let mut state = self.state.write();
        for agent in state.agents.values_mut() {
            if agent.status != AgentStatus::Offline && now - agent.last_seen > self.ttl {
                agent.status = AgentStatus::Offline;
                info!(
                    agent_id = %agent.id,
                    last_seen = %agent.last_seen,
                    "agent expired, marking offline"
                );
                expired.push(agent.id.clone());
            }
        }
        expired.sort();
        expired
    }
}

fn live_status(declared: Option<AgentStatus>) -> AgentStatus {
    match declared {
        Some(AgentStatus::Busy) => AgentStatus::Busy,
        _ => AgentStatus::Online,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(id: &str, caps: &[&str]) -> Envelope {
        Envelope::announce(id, id.to_uppercase(), caps.iter().map(|c| c.to_string()).collect())
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Duration::from_secs(300))
    }

    #[test]
    fn register_then_lookup() {
        let reg = registry();
        assert_eq!(
            reg.register(&announce("llm", &["ask", "summarize"])).unwrap(),
            Registration::Discovered
        );

        let agent = reg.lookup("llm").unwrap();
        assert_eq!(agent.display_name, "LLM");
        assert_eq!(agent.status, AgentStatus::Online);
        assert!(agent.has_capability("summarize"));
    }

    #[test]
    fn lookup_unknown_is_not_found() {
        let reg = registry();
        assert!(matches!(reg.lookup("ghost"), Err(RegistryError::NotFound(id)) if id == "ghost"));
        assert!(!reg.contains("ghost"));
    }

    #[test]
    fn register_rejects_other_kinds() {
        let reg = registry();
        let err = reg.register(&Envelope::heartbeat("llm")).unwrap_err();
        assert!(matches!(err, RegistryError::NotAnAnnounce("heartbeat")));
    }

    #[test]
    fn reannounce_replaces_capabilities() {
        let reg = registry();
        reg.register(&announce("llm", &["ask", "summarize"])).unwrap();
        assert_eq!(
            reg.register(&announce("llm", &["ask", "translate"])).unwrap(),
            Registration::Refreshed
        );

        assert!(reg.list_by_capability("summarize").is_empty());
        assert_eq!(reg.list_by_capability("translate").len(), 1);
        assert_eq!(reg.counts().total, 1);
    }

    #[test]
    fn announce_carries_inbox_and_busy_status() {
        let reg = registry();
        let env = announce("search", &["search"])
            .with_inbox("#search")
            .with_status(AgentStatus::Busy);
        reg.register(&env).unwrap();

        let agent = reg.lookup("search").unwrap();
        assert_eq!(agent.inbox.as_deref(), Some("#search"));
        assert_eq!(agent.status, AgentStatus::Busy);
    }

    #[test]
    fn heartbeat_unknown_agent_is_not_found() {
        let reg = registry();
        assert!(matches!(
            reg.heartbeat("ghost", None),
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(reg.counts().total, 0);
    }

    #[test]
    fn heartbeat_refreshes_last_seen() {
        let reg = registry();
        let t0 = Utc::now();
        reg.register_at(&announce("llm", &["ask"]), t0).unwrap();

        let t1 = t0 + chrono::Duration::seconds(30);
        reg.heartbeat_at("llm", Some(AgentStatus::Busy), t1).unwrap();
        let agent = reg.lookup("llm").unwrap();
        assert_eq!(agent.last_seen, t1);
        assert_eq!(agent.first_seen, t0);
        assert_eq!(agent.status, AgentStatus::Busy);
    }

    #[test]
    fn sweep_marks_stale_agents_offline() {
        let reg = registry();
        let t0 = Utc::now();
        reg.register_at(&announce("llm", &["ask"]), t0).unwrap();
        reg.register_at(&announce("search", &["search"]), t0 + chrono::Duration::seconds(200))
            .unwrap();

        // exactly at the TTL is still alive
        assert!(reg.sweep_expired(t0 + chrono::Duration::seconds(300)).is_empty());

        let expired = reg.sweep_expired(t0 + chrono::Duration::seconds(301));
        assert_eq!(expired, vec!["llm".to_string()]);
        assert_eq!(reg.lookup("llm").unwrap().status, AgentStatus::Offline);
        assert_eq!(reg.lookup("search").unwrap().status, AgentStatus::Online);

        // offline agents are kept and not reported twice
        assert!(reg.sweep_expired(t0 + chrono::Duration::seconds(302)).is_empty());
        assert_eq!(reg.counts().total, 2);
    }

    #[test]
    fn heartbeat_revives_offline_agent() {
        let reg = registry();
        let t0 = Utc::now();
        reg.register_at(&announce("llm", &["ask"]), t0).unwrap();
        reg.sweep_expired(t0 + chrono::Duration::seconds(400));

        reg.heartbeat_at("llm", None, t0 + chrono::Duration::seconds(401)).unwrap();
        assert_eq!(reg.lookup("llm").unwrap().status, AgentStatus::Online);
    }

    #[test]
    fn depart_marks_offline_without_removing() {
        let reg = registry();
        reg.register(&announce("llm", &["ask"])).unwrap();
        reg.depart("llm").unwrap();

        let agent = reg.lookup("llm").unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(reg.list_by_capability("ask").is_empty());
        assert!(reg.depart("ghost").is_err());
    }

    #[test]
    fn capabilities_map_only_lists_reachable_agents() {
        let reg = registry();
        reg.register(&announce("llm", &["ask", "summarize"])).unwrap();
        reg.register(&announce("llm2", &["summarize"])).unwrap();
        reg.register(&announce("search", &["search"])).unwrap();
        reg.depart("search").unwrap();

        let caps = reg.capabilities();
        assert_eq!(caps["summarize"], vec!["llm".to_string(), "llm2".to_string()]);
        assert_eq!(caps["ask"], vec!["llm".to_string()]);
        assert!(!caps.contains_key("search"));
    }

    #[test]
    fn snapshot_is_sorted_and_counts_by_status() {
        let reg = registry();
        reg.register(&announce("zeta", &[])).unwrap();
        reg.register(&announce("alpha", &[]).with_status(AgentStatus::Busy)).unwrap();
        reg.register(&announce("mid", &[])).unwrap();
        reg.depart("mid").unwrap();

        let ids: Vec<String> = reg.snapshot().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
        assert_eq!(
            reg.counts(),
            RegistryCounts {
                total: 3,
                online: 1,
                busy: 1,
                offline: 1
            }
        );
    }

    #[test]
    fn blank_capabilities_are_ignored() {
        let reg = registry();
        reg.register(&announce("llm", &["ask", "  ", ""])).unwrap();
        assert_eq!(reg.lookup("llm").unwrap().capabilities.len(), 1);
    }
}
