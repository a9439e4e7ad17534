use crate::config::ProvisionerConfig;
use crate::engine::CommandRunner;
use crate::utils::cancel::Cancellation;
use std::sync::Arc;

/// Shared state handed to every phase of a run
pub struct Context {
    pub config: ProvisionerConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub cancel: Cancellation,
    pub dry_run: bool,
}

impl Context {
    pub fn new(config: ProvisionerConfig, runner: Arc<dyn CommandRunner>, cancel: Cancellation) -> Self {
        Context {
            config,
            runner,
            cancel,
            dry_run: false,
        }
    }
}
