use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use shellmux_protocol::{CloseReason, PortForward, SessionId, SessionKind};

use crate::config::RemoteConfig;
use crate::error::SessionError;
use crate::process::ExitStatus;
use crate::session::{Controller, SessionCore};

static PASSWORD_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)pass(word|phrase)[^\n]*:\s*$")
        .expect("PASSWORD_PROMPT is a compile-time constant")
});

static LOGIN_SUCCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[$#>%]\s*$|welcome to|last login|\[[^\]\s@]+@[^\]\s]+[^\]]*\]")
        .expect("LOGIN_SUCCESS is a compile-time constant")
});

static LOGIN_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)permission denied|authentication failed|access denied")
        .expect("LOGIN_FAILURE is a compile-time constant")
});

/// Where a remote session is in its login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Connecting,
    Authenticating,
    Established,
    AuthFailed,
}

impl RemoteState {
    pub fn label(self) -> &'static str {
        match self {
            RemoteState::Connecting => "connecting",
            RemoteState::Authenticating => "authenticating",
            RemoteState::Established => "established",
            RemoteState::AuthFailed => "auth_failed",
        }
    }

    fn is_handshaking(self) -> bool {
        matches!(self, RemoteState::Connecting | RemoteState::Authenticating)
    }
}

/// What the detector concluded from one output chunk.
#[derive(PartialEq, Eq)]
pub enum Detection {
    /// Answer the prompt with this secret; do not forward the chunk.
    SendPassword(Zeroizing<String>),
    Established,
    AuthFailed,
    /// Nothing conclusive; forward the chunk.
    Pending,
}

impl fmt::Debug for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detection::SendPassword(_) => f.write_str("SendPassword(***)"),
            Detection::Established => f.write_str("Established"),
            Detection::AuthFailed => f.write_str("AuthFailed"),
            Detection::Pending => f.write_str("Pending"),
        }
    }
}

/// Best-effort login classifier over a rolling, escape-stripped text window.
pub struct LoginDetector {
    state: RemoteState,
    window: String,
    window_cap: usize,
    password: Option<Zeroizing<String>>,
    password_sent: bool,
}

impl LoginDetector {
    pub fn new(password: Option<Zeroizing<String>>, window_cap: usize) -> Self {
        Self {
            state: RemoteState::Connecting,
            window: String::new(),
            window_cap,
            password,
            password_sent: false,
        }
    }

    pub fn state(&self) -> RemoteState {
        self.state
    }

    pub fn password_sent(&self) -> bool {
        self.password_sent
    }

    /// A password prompt could still arrive and be answered.
    pub fn awaiting_prompt(&self) -> bool {
        self.state.is_handshaking() && self.password.is_some()
    }

    fn window_cap(&self) -> usize {
        self.window_cap
    }

    /// Patterns are tried in order: password prompt, success, failure.
    /// Failure matching stops for good once the session is established.
    pub fn observe(&mut self, chunk: &[u8]) -> Detection {
        if !self.state.is_handshaking() {
            return Detection::Pending;
        }
        self.state = RemoteState::Authenticating;
        self.push_window(chunk);

        if PASSWORD_PROMPT.is_match(&self.window)
            && !self.password_sent
            && let Some(password) = self.password.take()
        {
            self.password_sent = true;
            self.window.clear();
            return Detection::SendPassword(password);
        }

        if LOGIN_SUCCESS.is_match(&self.window) {
            self.state = RemoteState::Established;
            self.window = String::new();
            return Detection::Established;
        }

        if LOGIN_FAILURE.is_match(&self.window) {
            self.state = RemoteState::AuthFailed;
            self.window.clear();
            return Detection::AuthFailed;
        }

        Detection::Pending
    }

    fn push_window(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        self.window.push_str(&strip_ansi_escapes(&text));
        if self.window.len() > self.window_cap {
            let mut cut = self.window.len() - self.window_cap;
            while !self.window.is_char_boundary(cut) {
                cut += 1;
            }
            self.window.drain(..cut);
        }
    }
}

/// Remove CSI and OSC sequences plus stray carriage returns.
fn strip_ansi_escapes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                Some('[') => {
                    chars.next();
                    while let Some(&next) = chars.peek() {
                        if ('\x20'..='\x3f').contains(&next) {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if chars.peek().is_some_and(|next| ('\x40'..='\x7e').contains(next)) {
                        chars.next();
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\r' => {}
            _ => result.push(c),
        }
    }
    result
}

/// Parameters of a remote-shell session.
#[derive(Clone)]
pub struct RemoteSessionOptions {
    pub session_id: SessionId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<Zeroizing<String>>,
    pub private_key_path: Option<PathBuf>,
    pub port_forwards: Vec<PortForward>,
    pub cols: u16,
    pub rows: u16,
}

impl fmt::Debug for RemoteSessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSessionOptions")
            .field("session_id", &self.session_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key_path", &self.private_key_path)
            .field("port_forwards", &self.port_forwards)
            .finish_non_exhaustive()
    }
}

fn forward_is_valid(forward: &PortForward) -> bool {
    let well_formed_host =
        |h: &str| !h.trim().is_empty() && !h.contains(char::is_whitespace);
    forward.local_port != 0
        && forward.remote_port != 0
        && well_formed_host(forward.remote_host.as_str())
        && forward
            .bind_address
            .as_deref()
            .is_none_or(well_formed_host)
}

/// Command-line arguments for the remote-shell client. Malformed port
/// forwards are skipped.
pub fn build_ssh_args(options: &RemoteSessionOptions, config: &RemoteConfig) -> Vec<String> {
    let mut args = vec!["-p".to_string(), options.port.to_string()];
    if let Some(key) = &options.private_key_path {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }
    args.extend(config.extra_args.iter().cloned());

    for forward in &options.port_forwards {
        if !forward_is_valid(forward) {
            warn!(
                session_id = %options.session_id,
                local_port = forward.local_port,
                remote_host = %forward.remote_host,
                remote_port = forward.remote_port,
                "skipping malformed port forward"
            );
            continue;
        }
        let spec = match &forward.bind_address {
            Some(bind) => format!(
                "{bind}:{}:{}:{}",
                forward.local_port, forward.remote_host, forward.remote_port
            ),
            None => format!(
                "{}:{}:{}",
                forward.local_port, forward.remote_host, forward.remote_port
            ),
        };
        args.push("-L".to_string());
        args.push(spec);
    }

    args.push(format!("{}@{}", options.username, options.host));
    args
}

pub(crate) type ReadySender = oneshot::Sender<Result<(), SessionError>>;

pub(crate) struct RemoteController {
    detector: LoginDetector,
    /// Unterminated last line, kept back while it may turn out to be the
    /// password prompt.
    held: Vec<u8>,
    /// Pending creation request; settled exactly once.
    ready: Option<ReadySender>,
    connect_deadline: Option<Instant>,
    timeout_secs: u64,
    timed_out: bool,
    network_exit_codes: Vec<i32>,
}

impl RemoteController {
    pub fn new(
        password: Option<Zeroizing<String>>,
        config: &RemoteConfig,
        ready: ReadySender,
        now: Instant,
    ) -> Self {
        Self {
            detector: LoginDetector::new(password, config.detection_window_bytes),
            held: Vec::new(),
            ready: Some(ready),
            connect_deadline: Some(now + config.connect_timeout()),
            timeout_secs: config.connect_timeout_secs,
            timed_out: false,
            network_exit_codes: config.network_exit_codes.clone(),
        }
    }

    /// Forward `data` behind anything held back so far.
    fn forward_all(&mut self, core: &mut SessionCore, data: &[u8]) {
        self.release_held(core);
        core.forward(data);
    }

    fn settle(&mut self, result: Result<(), SessionError>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }
}

impl Controller for RemoteController {
    fn kind(&self) -> SessionKind {
        SessionKind::Remote
    }

    fn state_label(&self) -> &'static str {
        self.detector.state().label()
    }

    fn accept_input(&mut self, core: &mut SessionCore, data: &[u8]) {
        core.write(data);
    }

    fn on_output(&mut self, core: &mut SessionCore, data: &[u8]) {
        match self.detector.observe(data) {
            Detection::SendPassword(password) => {
                self.held.clear();
                let mut line = Zeroizing::new(String::with_capacity(password.len() + 1));
                line.push_str(&password);
                line.push('\n');
                core.write(line.as_bytes());
                debug!(session_id = %core.id, "answered password prompt");
            }
            Detection::Established => {
                self.forward_all(core, data);
                self.connect_deadline = None;
                info!(session_id = %core.id, "remote session established");
                self.settle(Ok(()));
            }
            Detection::AuthFailed => {
                self.forward_all(core, data);
                self.connect_deadline = None;
                warn!(session_id = %core.id, "remote authentication failed");
                self.settle(Err(SessionError::AuthenticationFailed(core.id.clone())));
                core.begin_close(false);
            }
            Detection::Pending if self.detector.awaiting_prompt() => {
                self.held.extend_from_slice(data);
                let keep = match self.held.iter().rposition(|&b| b == b'\n') {
                    Some(newline) => self.held.len() - newline - 1,
                    None => self.held.len(),
                };
                if keep > self.detector.window_cap() {
                    let held = std::mem::take(&mut self.held);
                    core.forward(&held);
                } else if keep < self.held.len() {
                    let tail = self.held.split_off(self.held.len() - keep);
                    let complete = std::mem::replace(&mut self.held, tail);
                    core.forward(&complete);
                }
            }
            Detection::Pending => self.forward_all(core, data),
        }
    }

    fn release_held(&mut self, core: &mut SessionCore) {
        if !self.held.is_empty() {
            let held = std::mem::take(&mut self.held);
            core.forward(&held);
        }
    }

    fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    fn on_connect_timeout(&mut self, core: &mut SessionCore) {
        self.connect_deadline = None;
        if !self.detector.state().is_handshaking() {
            return;
        }
        self.timed_out = true;
        self.release_held(core);
        warn!(
            session_id = %core.id,
            timeout_secs = self.timeout_secs,
            "remote session not established in time"
        );
        self.settle(Err(SessionError::ConnectionTimeout {
            session_id: core.id.clone(),
            timeout_secs: self.timeout_secs,
        }));
        core.begin_close(false);
    }

    fn on_exit(&mut self, core: &SessionCore, status: &ExitStatus) -> CloseReason {
        if self.ready.is_some() {
            let err = if core.user_closed {
                SessionError::SessionClosed(core.id.clone())
            } else {
                SessionError::UnexpectedExit {
                    session_id: core.id.clone(),
                    exit_code: status.code,
                }
            };
            self.settle(Err(err));
        }

        if core.user_closed {
            CloseReason::User
        } else if self.detector.state() == RemoteState::AuthFailed {
            CloseReason::Auth
        } else if self.timed_out {
            CloseReason::Timeout
        } else if status
            .code
            .is_some_and(|code| self.network_exit_codes.contains(&code))
        {
            CloseReason::Network
        } else {
            CloseReason::Unknown
        }
    }
}
