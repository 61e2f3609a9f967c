//! # rolesync engine
//!
//! Turns a normalized [`rolesync_core::Config`] into changes on a
//! PostgreSQL cluster:
//!
//! 1. [`expand`] instantiates the sync map, querying the directory
//! 2. [`inspect`] reads the live cluster state
//! 3. [`plan`] diffs both into an ordered list of actions
//! 4. [`execute`] applies (or only shows) the plan
//!
//! [`pipeline::Synchronizer`] wires the steps together.

pub mod execute;
pub mod expand;
pub mod inspect;
pub mod pipeline;
pub mod plan;
pub mod retry;
pub mod statistics;

pub use execute::{ActionOutcome, ActionStatus, ExecutionReport, Executor};
pub use expand::{Expansion, RuleExpander};
pub use inspect::{ClusterState, RoleBlacklist, SessionInfo, StateInspector};
pub use pipeline::{SyncOptions, SyncOutcome, Synchronizer};
pub use plan::{ActionKind, ActionSummary, Planner, Statement, SyncAction, Takeover};
pub use retry::{RetryConfig, RetryExecutor};
pub use statistics::RunStatistics;
