use crate::engine::CommandRunner;
use crate::errors::Error;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

pub mod cancel;
#[macro_use]
pub mod shortcuts;

pub fn get_version_string() -> String {
    format!("{}-{}", env!("GIT_COUNT"), env!("GIT_HASH"))
}

/// Look up an executable the way a shell would, by walking `PATH`.
/// Names containing a path separator are checked as-is.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// What a phase needs on the host before it may touch anything
#[derive(Debug, Default, Clone)]
pub struct Requirements {
    pub binaries: Vec<&'static str>,
    pub files: Vec<PathBuf>,
}

impl Requirements {
    pub fn binaries(binaries: &[&'static str]) -> Self {
        Requirements {
            binaries: binaries.to_vec(),
            files: Vec::new(),
        }
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    /// Fails on the first missing binary or file. Binaries are looked up by the runner
    /// that will start them.
    #[instrument(skip_all)]
    pub fn check(&self, runner: &dyn CommandRunner) -> Result<(), Error> {
        for binary in &self.binaries {
            match runner.locate(binary) {
                Some(path) => debug!("found {binary} at {}", path.display()),
                None => return Err(Error::BinaryMissing(binary.to_string())),
            }
        }
        for file in &self.files {
            if !file.exists() {
                return Err(Error::FileMissing(file.clone()));
            }
        }
        Ok(())
    }
}
