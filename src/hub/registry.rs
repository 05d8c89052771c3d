//! Agent registry and capability index
//!
//! Both maps are sharded `DashMap`s. Writers always lock the agent entry
//! before touching the capability index, and readers never hold an index
//! guard while reading the agent map.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

use super::inbox::{self, Inbox, InboxSender, PushError};
use super::selector::CandidateStats;
use crate::agent::{AgentDescriptor, AgentMessage, Capability, MessageKind};
use crate::observability::smooth_duration;

/// Agents idle for longer than this are reported degraded
const STALE_AFTER_SECS: i64 = 300;
/// Inbox backlog above which an agent is reported degraded
const BACKLOG_LIMIT: usize = 100;
const MIN_SUCCESS_RATE: f64 = 0.8;
/// Success rate is only judged after this many decisions
const MIN_DECISIONS_FOR_RATE: u64 = 10;

/// Performance counters kept per registration
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStats {
    pub decisions_made: u64,
    pub decisions_succeeded: u64,
    pub avg_response_time: Option<Duration>,
    pub last_activity: DateTime<Utc>,
}

impl AgentStats {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            decisions_made: 0,
            decisions_succeeded: 0,
            avg_response_time: None,
            last_activity: now,
        }
    }

    /// `None` until the agent has made a decision
    pub fn success_rate(&self) -> Option<f64> {
        if self.decisions_made == 0 {
            None
        } else {
            Some(self.decisions_succeeded as f64 / self.decisions_made as f64)
        }
    }
}

struct Registration {
    descriptor: AgentDescriptor,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    message_count: u64,
    stats: AgentStats,
    inbox: InboxSender,
}

/// Point-in-time copy of a registration
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub descriptor: AgentDescriptor,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub message_count: u64,
    pub stats: AgentStats,
    pub queue_len: usize,
}

/// Which message kinds an inbox accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionCheck {
    /// Only kinds the agent subscribed to
    Strict,
    /// Subscribed kinds plus responses addressed to the agent
    AllowResponses,
}

/// Why a message copy was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownReceiver,
    NotSubscribed,
    InboxFull,
    InboxClosed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DropReason::UnknownReceiver => "unknown receiver",
            DropReason::NotSubscribed => "not subscribed",
            DropReason::InboxFull => "inbox full",
            DropReason::InboxClosed => "inbox closed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
}

/// Health of one agent as judged from its counters
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub status: HealthState,
    pub issues: Vec<String>,
    pub queue_len: usize,
    pub success_rate: Option<f64>,
    pub last_activity: DateTime<Utc>,
}

pub struct AgentRegistry {
    agents: DashMap<String, Registration>,
    index: DashMap<Capability, BTreeSet<String>>,
    inbox_capacity: usize,
}

impl AgentRegistry {
    pub fn new(inbox_capacity: usize) -> Self {
        Self {
            agents: DashMap::new(),
            index: DashMap::new(),
            inbox_capacity,
        }
    }

    /// Register or replace an agent, returning its fresh inbox
    ///
    /// A replaced registration loses its old inbox and capability entries.
    pub fn register(&self, descriptor: AgentDescriptor) -> Inbox {
        let agent_id = descriptor.id.clone();
        let (sender, inbox) = inbox::channel(&agent_id, self.inbox_capacity);
        let now = Utc::now();
        let capabilities = descriptor.capability_set();
        let registration = Registration {
            descriptor,
            registered_at: now,
            last_heartbeat: now,
            message_count: 0,
            stats: AgentStats::new(now),
            inbox: sender,
        };

        match self.agents.entry(agent_id.clone()) {
            Entry::Occupied(mut entry) => {
                debug!("Agent {} re-registered, replacing prior entry", agent_id);
                for cap in entry.get().descriptor.capability_set() {
                    self.unindex(cap, &agent_id);
                }
                self.index_all(&capabilities, &agent_id);
                entry.insert(registration);
            }
            Entry::Vacant(entry) => {
                self.index_all(&capabilities, &agent_id);
                entry.insert(registration);
            }
        }

        info!("Registered agent {} with {:?}", agent_id, capabilities);
        inbox
    }

    /// Remove an agent and its index entries; unknown ids are a no-op
    pub fn unregister(&self, agent_id: &str) -> bool {
        match self.agents.entry(agent_id.to_string()) {
            Entry::Occupied(entry) => {
                for cap in entry.get().descriptor.capability_set() {
                    self.unindex(cap, agent_id);
                }
                entry.remove();
                info!("Unregistered agent {}", agent_id);
                true
            }
            Entry::Vacant(_) => {
                debug!("Unregister ignored, agent {} not registered", agent_id);
                false
            }
        }
    }

    fn index_all(&self, capabilities: &[Capability], agent_id: &str) {
        for cap in capabilities {
            self.index
                .entry(*cap)
                .or_default()
                .insert(agent_id.to_string());
        }
    }

    fn unindex(&self, capability: Capability, agent_id: &str) {
        if let Entry::Occupied(mut bucket) = self.index.entry(capability) {
            bucket.get_mut().remove(agent_id);
            if bucket.get().is_empty() {
                bucket.remove();
            }
        }
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Registered ids in ascending order
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Agents currently offering `capability`, in ascending id order
    pub fn agents_with(&self, capability: Capability) -> Vec<String> {
        self.index
            .get(&capability)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn capability_counts(&self) -> BTreeMap<Capability, usize> {
        self.index
            .iter()
            .map(|e| (*e.key(), e.value().len()))
            .collect()
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.agents.get(agent_id).map(|reg| AgentSnapshot {
            descriptor: reg.descriptor.clone(),
            registered_at: reg.registered_at,
            last_heartbeat: reg.last_heartbeat,
            message_count: reg.message_count,
            stats: reg.stats.clone(),
            queue_len: reg.inbox.len(),
        })
    }

    /// Whether `agent_id` is registered and subscribed to `kind`
    pub fn accepts(&self, agent_id: &str, kind: MessageKind) -> bool {
        self.agents
            .get(agent_id)
            .is_some_and(|reg| reg.descriptor.is_subscribed(kind))
    }

    pub fn queue_len(&self, agent_id: &str) -> Option<usize> {
        self.agents.get(agent_id).map(|reg| reg.inbox.len())
    }

    /// Ids subscribed to `kind`, excluding `sender`, in ascending order
    pub fn subscribers(&self, kind: MessageKind, sender: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .iter()
            .filter(|e| e.key() != sender && e.value().descriptor.is_subscribed(kind))
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Push a message onto an agent's inbox
    ///
    /// Bumps the message count and heartbeat on success.
    pub fn enqueue(
        &self,
        agent_id: &str,
        message: AgentMessage,
        check: SubscriptionCheck,
    ) -> Result<(), DropReason> {
        let mut reg = self
            .agents
            .get_mut(agent_id)
            .ok_or(DropReason::UnknownReceiver)?;

        let kind = message.kind();
        let accepted = reg.descriptor.is_subscribed(kind)
            || (check == SubscriptionCheck::AllowResponses && kind == MessageKind::Response);
        if !accepted {
            return Err(DropReason::NotSubscribed);
        }

        reg.inbox.try_push(message).map_err(|e| match e {
            PushError::Full => DropReason::InboxFull,
            PushError::Closed => DropReason::InboxClosed,
        })?;
        reg.message_count += 1;
        reg.last_heartbeat = Utc::now();
        Ok(())
    }

    /// Record one processed message
    ///
    /// `success` is `Some` when the message produced a decision (a capability
    /// response), which feeds the success rate.
    pub fn record_activity(&self, agent_id: &str, elapsed: Duration, success: Option<bool>) {
        let Some(mut reg) = self.agents.get_mut(agent_id) else {
            debug!("Activity for unknown agent {} ignored", agent_id);
            return;
        };
        let now = Utc::now();
        reg.last_heartbeat = now;
        let stats = &mut reg.stats;
        stats.last_activity = now;
        stats.avg_response_time = Some(smooth_duration(stats.avg_response_time, elapsed));
        if let Some(ok) = success {
            stats.decisions_made += 1;
            if ok {
                stats.decisions_succeeded += 1;
            }
        }
    }

    /// Selector inputs for an agent that declares `capability`
    pub fn candidate(&self, agent_id: &str, capability: Capability) -> Option<CandidateStats> {
        let reg = self.agents.get(agent_id)?;
        let info = reg.descriptor.capability_info(capability)?;
        Some(CandidateStats {
            agent_id: agent_id.to_string(),
            confidence: info.confidence_level,
            success_rate: reg.stats.success_rate(),
            queue_len: reg.inbox.len(),
            avg_response_time: reg.stats.avg_response_time,
        })
    }

    pub fn health_report(&self) -> Vec<AgentHealth> {
        self.health_report_at(Utc::now())
    }

    pub fn health_report_at(&self, now: DateTime<Utc>) -> Vec<AgentHealth> {
        let mut report: Vec<AgentHealth> = self
            .agents
            .iter()
            .map(|e| {
                let reg = e.value();
                let queue_len = reg.inbox.len();
                let success_rate = reg.stats.success_rate();
                let mut issues = Vec::new();

                let idle = now - reg.stats.last_activity;
                if idle.num_seconds() > STALE_AFTER_SECS {
                    issues.push(format!("no activity for {}s", idle.num_seconds()));
                }
                if queue_len > BACKLOG_LIMIT {
                    issues.push(format!("inbox backlog {}", queue_len));
                }
                if reg.stats.decisions_made > MIN_DECISIONS_FOR_RATE {
                    if let Some(rate) = success_rate.filter(|r| *r < MIN_SUCCESS_RATE) {
                        issues.push(format!("success rate {:.2}", rate));
                    }
                }

                AgentHealth {
                    agent_id: e.key().clone(),
                    status: if issues.is_empty() {
                        HealthState::Healthy
                    } else {
                        HealthState::Degraded
                    },
                    issues,
                    queue_len,
                    success_rate,
                    last_activity: reg.stats.last_activity,
                }
            })
            .collect();
        report.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        report
    }
}
