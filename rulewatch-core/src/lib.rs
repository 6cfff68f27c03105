//! Multi-tenant filesystem event-to-action engine.
//!
//! Each tenant supervisor watches its tenant's rule files and data tree,
//! matches filesystem events against the loaded rules and dispatches the
//! rules' actions (job submission, backend commands or further synthetic
//! events) through the collaborator traits in [`collaborators`].

pub mod actions;
pub mod clock;
pub mod codec;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod dir_index;
pub mod engine;
pub mod error;
pub mod event;
pub mod fs_watch;
pub mod hits;
pub mod miss_cache;
pub mod paths;
pub mod rules;
pub mod tenant;
pub mod timespec;
pub mod workflow_log;

pub use actions::{ActionHandler, ActionOutcome, SkipReason};
pub use collaborators::{
    AccessCheck, Collaborators, CommandOutput, CommandRunner, JobSubmitter, ParamRange,
    PatternLookup, SubmitReceipt, WorkflowPattern,
};
pub use config::{EngineConfig, Layout, WorkflowLogConfig};
pub use engine::{EngineContext, EventCore, ProcessOutcome};
pub use error::{EngineError, Result};
pub use event::{ChainLink, ChangeKind, FsEvent};
pub use rules::{Rule, RuleAction, RuleMap, RuleStore};
pub use tenant::{SupervisorPhase, TenantScope, TenantSupervisor};
