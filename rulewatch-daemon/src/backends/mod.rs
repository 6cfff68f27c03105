//! Local implementations of the engine's collaborators.

pub mod access;
pub mod exec;
pub mod patterns;
pub mod spool;

use std::sync::Arc;

use rulewatch_config::Config;
use rulewatch_core::collaborators::{AccessCheck, Collaborators};
use rulewatch_core::config::Layout;

pub use access::{AllowAll, MembershipAccess};
pub use exec::{ExecCommand, build_registry};
pub use patterns::PatternDirectory;
pub use spool::SpoolJobSubmitter;

pub fn collaborators(config: &Config, layout: Arc<Layout>) -> Collaborators {
    let access: Arc<dyn AccessCheck> = if config.access.allow_all {
        Arc::new(AllowAll)
    } else {
        Arc::new(MembershipAccess::new(layout))
    };
    Collaborators {
        submitter: Arc::new(SpoolJobSubmitter::new(config.paths.job_spool.clone())),
        commands: Arc::new(build_registry(&config.commands)),
        access,
        patterns: Arc::new(PatternDirectory::new(config.paths.patterns_home.clone())),
    }
}
