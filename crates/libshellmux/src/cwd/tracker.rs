use std::path::{Path, PathBuf};

use super::parse::CwdCommand;
use super::resolve::{HostEnv, Platform, resolve_local_cwd};

/// Current directory of a local shell plus its `pushd` stack.
#[derive(Debug, Clone)]
pub struct CwdTracker {
    cwd: PathBuf,
    stack: Vec<PathBuf>,
    platform: Platform,
}

impl CwdTracker {
    pub fn new(initial: PathBuf, platform: Platform) -> Self {
        Self {
            cwd: initial,
            stack: Vec::new(),
            platform,
        }
    }

    pub fn current(&self) -> &Path {
        &self.cwd
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Apply a recognized command. Returns whether the directory changed.
    /// Unresolvable targets leave the tracker untouched.
    pub fn apply(&mut self, command: &CwdCommand, env: &dyn HostEnv) -> bool {
        match command {
            CwdCommand::Cd { target } => match self.resolve(target, env) {
                Some(dir) => {
                    self.cwd = dir;
                    true
                }
                None => false,
            },
            CwdCommand::Pushd { target } => match self.resolve(target, env) {
                Some(dir) => {
                    let previous = std::mem::replace(&mut self.cwd, dir);
                    self.stack.push(previous);
                    true
                }
                None => false,
            },
            CwdCommand::Popd => match self.stack.pop() {
                Some(dir) => {
                    self.cwd = dir;
                    true
                }
                None => false,
            },
        }
    }

    fn resolve(&self, target: &str, env: &dyn HostEnv) -> Option<PathBuf> {
        resolve_local_cwd(&self.cwd, target, self.platform, env)
    }
}
