//! Scripted stand-in for external tools.

use super::runner::{CommandOutput, CommandRunner, Invocation};
use crate::errors::Error;
use crate::utils::cancel::Cancellation;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Scripted {
    Exit(i32, String),
    LaunchFailure,
}

/// Answers invocations by their program and arguments joined with spaces (environment is
/// ignored). Queued responses are used first, then the per-command default, then exit 0.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    queued: Mutex<HashMap<String, VecDeque<Scripted>>>,
    defaults: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<String>>,
    missing: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `command` with this exit code and stdout
    pub fn respond(self, command: &str, code: i32, stdout: &str) -> Self {
        self.defaults
            .lock()
            .unwrap()
            .insert(command.to_string(), Scripted::Exit(code, stdout.to_string()));
        self
    }

    pub fn always_fail(self, command: &str) -> Self {
        self.respond(command, 1, "")
    }

    /// Answer the next `times` calls of `command` this way, then fall back to its default
    pub fn respond_times(self, command: &str, code: i32, stdout: &str, times: usize) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .extend(std::iter::repeat_n(Scripted::Exit(code, stdout.to_string()), times));
        self
    }

    /// Fail `command` the next `times` calls, then fall back to its default
    pub fn fail_times(self, command: &str, times: usize) -> Self {
        self.respond_times(command, 1, "", times)
    }

    pub fn launch_failure(self, command: &str) -> Self {
        self.defaults
            .lock()
            .unwrap()
            .insert(command.to_string(), Scripted::LaunchFailure);
        self
    }

    /// Report `program` as absent from the host; everything else is found
    pub fn missing_binary(self, program: &str) -> Self {
        self.missing.lock().unwrap().push(program.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == command)
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        let missing = self.missing.lock().unwrap().iter().any(|name| name == program);
        (!missing).then(|| Path::new("/usr/bin").join(program))
    }

    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &Cancellation,
    ) -> Result<CommandOutput, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let key = invocation.argv().join(" ");
        self.calls.lock().unwrap().push(key.clone());

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        let scripted = queued
            .or_else(|| self.defaults.lock().unwrap().get(&key).cloned())
            .unwrap_or(Scripted::Exit(0, String::new()));

        match scripted {
            Scripted::Exit(code, stdout) => Ok(CommandOutput {
                status: Some(code),
                stdout,
                stderr: if code == 0 {
                    String::new()
                } else {
                    String::from("not ready")
                },
                elapsed: Duration::from_millis(1),
            }),
            Scripted::LaunchFailure => Err(Error::LaunchFailure {
                program: invocation.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            }),
        }
    }
}
