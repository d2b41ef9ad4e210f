//! Replication State Machine
//!
//! Validates abstract replication lifecycle transitions against a fixed
//! directed graph and keeps a bounded history of applied transitions.
//!
//! ```text
//!   <initial> ──▶ replica ──▶ promoting ──▶ source ──▶ demoting ──▶ replica
//!       │           │  ▲          │                       │
//!       └─▶ source  ▼  │          ▼                       ▼
//!                 syncing ──▶ failed ◀────────────────────┘
//!                    ▲           │
//!                    └───────────┘
//! ```

use crate::crd::ReplicationState;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::crd::ReplicationState as S;

// =============================================================================
// Transition Rules
// =============================================================================

/// One legal edge of the transition graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRule {
    pub from: ReplicationState,
    pub to: ReplicationState,
    pub description: &'static str,
    /// Backend operation that carries out the transition
    pub operation: &'static str,
}

const fn rule(
    from: ReplicationState,
    to: ReplicationState,
    description: &'static str,
    operation: &'static str,
) -> TransitionRule {
    TransitionRule {
        from,
        to,
        description,
        operation,
    }
}

const RULES: &[TransitionRule] = &[
    rule(S::Initial, S::Replica, "establish as replica", "create-replica"),
    rule(S::Initial, S::Source, "establish as source", "create-source"),
    rule(S::Replica, S::Promoting, "begin promotion", "promote"),
    rule(S::Replica, S::Syncing, "begin resync", "resync"),
    rule(S::Replica, S::Replica, "keep replica", "none"),
    rule(S::Promoting, S::Source, "promotion complete", "none"),
    rule(S::Promoting, S::Failed, "promotion failed", "none"),
    rule(S::Source, S::Demoting, "begin demotion", "demote"),
    rule(S::Source, S::Source, "keep source", "none"),
    rule(S::Demoting, S::Replica, "demotion complete", "none"),
    rule(S::Demoting, S::Failed, "demotion failed", "none"),
    rule(S::Syncing, S::Replica, "resync complete", "none"),
    rule(S::Syncing, S::Failed, "resync failed", "none"),
    rule(S::Syncing, S::Syncing, "keep syncing", "none"),
    rule(S::Failed, S::Syncing, "recover by resync", "resync"),
    rule(S::Failed, S::Replica, "recover as replica", "create-replica"),
];

// =============================================================================
// History
// =============================================================================

/// One applied transition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistoryEntry {
    pub from: ReplicationState,
    pub to: ReplicationState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub request_id: String,
}

/// State machine configuration
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Entries kept before the oldest is dropped
    pub history_capacity: usize,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
        }
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Transition validator with bounded history
#[derive(Debug, Default)]
pub struct ReplicationStateMachine {
    config: StateMachineConfig,
    history: RwLock<VecDeque<StateHistoryEntry>>,
}

impl ReplicationStateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        let capacity = config.history_capacity;
        Self {
            config,
            history: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Legal edges of the graph
    pub fn rules(&self) -> &'static [TransitionRule] {
        RULES
    }

    /// Self-transitions are always valid
    pub fn is_valid_transition(&self, from: ReplicationState, to: ReplicationState) -> bool {
        from == to || RULES.iter().any(|r| r.from == from && r.to == to)
    }

    pub fn validate_transition(&self, from: ReplicationState, to: ReplicationState) -> Result<()> {
        if self.is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: from.describe().to_string(),
                to: to.describe().to_string(),
            })
        }
    }

    /// Rule for an edge; unlisted self-transitions get a no-op rule
    pub fn get_transition_rule(
        &self,
        from: ReplicationState,
        to: ReplicationState,
    ) -> Option<TransitionRule> {
        RULES
            .iter()
            .find(|r| r.from == from && r.to == to)
            .copied()
            .or_else(|| (from == to).then(|| rule(from, to, "no change", "none")))
    }

    /// States reachable from `from`, including `from` itself
    pub fn get_valid_transitions(&self, from: ReplicationState) -> Vec<ReplicationState> {
        let mut targets: Vec<ReplicationState> = RULES
            .iter()
            .filter(|r| r.from == from)
            .map(|r| r.to)
            .collect();
        if !targets.contains(&from) {
            targets.push(from);
        }
        targets
    }

    /// Append to history, dropping the oldest entry beyond capacity
    pub fn record_transition(
        &self,
        from: ReplicationState,
        to: ReplicationState,
        reason: impl Into<String>,
        request_id: impl Into<String>,
    ) {
        let entry = StateHistoryEntry {
            from,
            to,
            timestamp: Utc::now(),
            reason: reason.into(),
            request_id: request_id.into(),
        };
        debug!(from = from.describe(), to = to.describe(), reason = %entry.reason, "Recorded transition");

        let mut history = self.history.write();
        history.push_back(entry);
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
    }

    /// Validate and record in one step
    pub fn transition(
        &self,
        from: ReplicationState,
        to: ReplicationState,
        reason: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Result<TransitionRule> {
        if let Err(e) = self.validate_transition(from, to) {
            warn!(from = from.describe(), to = to.describe(), "Rejected state transition");
            return Err(e);
        }
        self.record_transition(from, to, reason, request_id);
        Ok(self
            .get_transition_rule(from, to)
            .unwrap_or_else(|| rule(from, to, "no change", "none")))
    }

    /// History, oldest first
    pub fn history(&self) -> Vec<StateHistoryEntry> {
        self.history.read().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.write().clear();
    }
}
