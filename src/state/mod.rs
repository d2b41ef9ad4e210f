//! Replication lifecycle state machine

pub mod machine;

pub use machine::{
    ReplicationStateMachine, StateHistoryEntry, StateMachineConfig, TransitionRule,
};
