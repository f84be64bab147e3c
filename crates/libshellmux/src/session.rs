use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use shellmux_protocol::{CloseReason, Event, SessionId, SessionKind, SessionSummary};

use crate::batcher::OutputBatcher;
use crate::process::{ExitStatus, ProcessEvent, ProcessHandle};
use crate::sink::SinkHandle;

/// Messages from the router to a running session task.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close { user_initiated: bool },
    Consumed(u64),
    CurrentDir(oneshot::Sender<Option<PathBuf>>),
    Status(oneshot::Sender<SessionSummary>),
}

/// State shared by both session kinds. Owned exclusively by the session task.
pub(crate) struct SessionCore {
    pub id: SessionId,
    pub process: Box<dyn ProcessHandle>,
    pub batcher: OutputBatcher,
    pub sink: SinkHandle,
    /// Set before the kill is issued so the exit can be attributed.
    pub user_closed: bool,
    close_grace: Duration,
    close_deadline: Option<Instant>,
}

impl SessionCore {
    pub fn new(
        id: SessionId,
        process: Box<dyn ProcessHandle>,
        batcher: OutputBatcher,
        sink: SinkHandle,
        close_grace: Duration,
    ) -> Self {
        Self {
            id,
            process,
            batcher,
            sink,
            user_closed: false,
            close_grace,
            close_deadline: None,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.close_deadline.is_some()
    }

    pub fn write(&mut self, data: &[u8]) {
        if let Err(e) = self.process.write(data) {
            warn!(session_id = %self.id, error = %e, "failed to write to process");
        }
    }

    pub fn forward(&mut self, data: &[u8]) {
        self.batcher.accumulate(data, Instant::now());
    }

    /// Final flush, then terminate the process. The task keeps running until
    /// the exit is observed or the grace period runs out.
    pub fn begin_close(&mut self, user_initiated: bool) {
        if self.is_closing() {
            return;
        }
        if user_initiated {
            self.user_closed = true;
        }
        let now = Instant::now();
        self.batcher.teardown(now);
        self.kill();
        self.close_deadline = Some(now + self.close_grace);
    }

    fn kill(&mut self) {
        if let Err(e) = self.process.kill() {
            warn!(session_id = %self.id, error = %e, "failed to kill process");
        }
    }
}

/// Kind-specific behaviour plugged into the generic session loop.
pub(crate) trait Controller: Send {
    fn kind(&self) -> SessionKind;

    fn state_label(&self) -> &'static str;

    fn accept_input(&mut self, core: &mut SessionCore, data: &[u8]);

    fn on_output(&mut self, core: &mut SessionCore, data: &[u8]);

    fn connect_deadline(&self) -> Option<Instant> {
        None
    }

    fn on_connect_timeout(&mut self, _core: &mut SessionCore) {}

    /// Forward any output kept back from the consumer. Called before the
    /// final flush.
    fn release_held(&mut self, _core: &mut SessionCore) {}

    /// Called once, after the process is gone. Settles any pending creation
    /// request and classifies the exit.
    fn on_exit(&mut self, core: &SessionCore, status: &ExitStatus) -> CloseReason;

    fn current_dir(&self) -> Option<PathBuf> {
        None
    }
}

pub(crate) struct Session<C> {
    core: SessionCore,
    controller: C,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::Receiver<ProcessEvent>,
}

impl<C: Controller> Session<C> {
    pub fn new(
        core: SessionCore,
        controller: C,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        events: mpsc::Receiver<ProcessEvent>,
    ) -> Self {
        Self {
            core,
            controller,
            commands,
            events,
        }
    }

    pub async fn run(mut self) {
        let mut commands_open = true;
        let status = loop {
            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        commands_open = false;
                        if !self.core.is_closing() {
                            self.controller.release_held(&mut self.core);
                        }
                        self.core.begin_close(false);
                    }
                },
                event = self.events.recv() => match event {
                    Some(ProcessEvent::Output(data)) => {
                        if self.core.is_closing() {
                            debug!(session_id = %self.core.id, bytes = data.len(), "discarding output after close");
                        } else {
                            self.controller.on_output(&mut self.core, &data);
                        }
                    }
                    Some(ProcessEvent::Exited(status)) => break status,
                    None => break ExitStatus::default(),
                },
                _ = sleep_until_opt(self.core.batcher.deadline()) => {
                    self.core.batcher.flush(Instant::now());
                }
                _ = sleep_until_opt(self.controller.connect_deadline()) => {
                    self.controller.on_connect_timeout(&mut self.core);
                }
                _ = sleep_until_opt(self.core.close_deadline) => {
                    warn!(session_id = %self.core.id, "process did not exit within close grace period");
                    break ExitStatus::default();
                }
            }
        };
        self.finish(status);
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Input(data) => {
                if !self.core.is_closing() {
                    self.controller.accept_input(&mut self.core, &data);
                }
            }
            SessionCommand::Resize { cols, rows } => {
                if let Err(e) = self.core.process.resize(cols, rows) {
                    warn!(session_id = %self.core.id, error = %e, "resize failed");
                }
            }
            SessionCommand::Close { user_initiated } => {
                info!(session_id = %self.core.id, user_initiated, "closing session");
                if !self.core.is_closing() {
                    self.controller.release_held(&mut self.core);
                }
                self.core.begin_close(user_initiated);
            }
            SessionCommand::Consumed(byte_count) => self.core.batcher.acknowledge(byte_count),
            SessionCommand::CurrentDir(reply) => {
                let _ = reply.send(self.controller.current_dir());
            }
            SessionCommand::Status(reply) => {
                let flow = self.core.batcher.flow();
                let _ = reply.send(SessionSummary {
                    session_id: self.core.id.clone(),
                    kind: self.controller.kind(),
                    state: self.controller.state_label().to_string(),
                    queued_bytes: flow.queued_bytes(),
                    paused: flow.is_paused(),
                    cwd: self.controller.current_dir(),
                });
            }
        }
    }

    fn finish(mut self, status: ExitStatus) {
        if !self.core.is_closing() {
            self.controller.release_held(&mut self.core);
        }
        self.core.batcher.teardown(Instant::now());
        // No-op when the process already exited.
        self.core.kill();

        let reason = self.controller.on_exit(&self.core, &status);
        info!(
            session_id = %self.core.id,
            reason = ?reason,
            exit_code = ?status.code,
            "session ended"
        );
        let event = Event::SessionClosed {
            session_id: self.core.id.clone(),
            reason,
            exit_code: status.code,
            signal: status.signal,
        };
        if let Err(e) = self.core.sink.deliver(event) {
            debug!(session_id = %self.core.id, "close notification dropped: {e}");
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
