use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use shellmux_protocol::{CloseReason, SessionKind};

use crate::cwd::{CwdTracker, HostEnv, InputScanner, Platform, parse_cwd_command, resolve_local_cwd};
use crate::process::ExitStatus;
use crate::session::{Controller, SessionCore};

/// Directory a new local shell starts in: the requested path resolved
/// against home, or home itself when there is no usable request. Without a
/// home directory the filesystem root stands in.
pub fn resolve_initial_dir(
    requested: Option<&str>,
    platform: Platform,
    env: &dyn HostEnv,
) -> PathBuf {
    let home = env
        .home_dir()
        .unwrap_or_else(|| filesystem_root(platform, env));

    requested
        .filter(|dir| !dir.trim().is_empty())
        .and_then(|dir| resolve_local_cwd(&home, dir, platform, env))
        .unwrap_or(home)
}

fn filesystem_root(platform: Platform, env: &dyn HostEnv) -> PathBuf {
    match platform {
        Platform::Unix => PathBuf::from("/"),
        Platform::Windows => {
            let drive = env
                .var("SystemDrive")
                .filter(|drive| drive.len() == 2 && drive.ends_with(':'))
                .unwrap_or_else(|| "C:".to_string());
            PathBuf::from(format!("{drive}\\"))
        }
    }
}

pub(crate) struct LocalController {
    scanner: InputScanner,
    tracker: CwdTracker,
    env: Arc<dyn HostEnv>,
}

impl LocalController {
    pub fn new(initial_dir: PathBuf, platform: Platform, env: Arc<dyn HostEnv>) -> Self {
        Self {
            scanner: InputScanner::new(),
            tracker: CwdTracker::new(initial_dir, platform),
            env,
        }
    }
}

impl Controller for LocalController {
    fn kind(&self) -> SessionKind {
        SessionKind::Local
    }

    fn state_label(&self) -> &'static str {
        "running"
    }

    fn accept_input(&mut self, core: &mut SessionCore, data: &[u8]) {
        for line in self.scanner.feed(data) {
            let Some(command) = parse_cwd_command(&line) else {
                continue;
            };
            if self.tracker.apply(&command, self.env.as_ref()) {
                debug!(
                    session_id = %core.id,
                    cwd = %self.tracker.current().display(),
                    "working directory changed"
                );
            }
        }
        core.write(data);
    }

    fn on_output(&mut self, core: &mut SessionCore, data: &[u8]) {
        core.forward(data);
    }

    fn on_exit(&mut self, core: &SessionCore, _status: &ExitStatus) -> CloseReason {
        if core.user_closed {
            CloseReason::User
        } else {
            CloseReason::Unknown
        }
    }

    fn current_dir(&self) -> Option<PathBuf> {
        Some(self.tracker.current().to_path_buf())
    }
}
