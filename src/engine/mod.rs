//! Command running, readiness polling and step sequencing shared by every plan.

pub mod poller;
pub mod report;
pub mod runner;
pub mod sequencer;
#[cfg(test)]
pub mod testing;

pub use runner::{CommandRunner, Invocation, ProcessRunner};
pub use sequencer::{Sequencer, Step};
