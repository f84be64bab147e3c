use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use shellmux_protocol::{SessionId, SessionKind, SessionSummary};

use crate::batcher::OutputBatcher;
use crate::config::MuxConfig;
use crate::cwd::{HostEnv, Platform};
use crate::error::SessionError;
use crate::local::{LocalController, resolve_initial_dir};
use crate::process::{ProcessSpawner, SpawnRequest, SpawnedProcess};
use crate::registry::SessionRegistry;
use crate::remote::{RemoteController, RemoteSessionOptions, build_ssh_args};
use crate::session::{Controller, Session, SessionCommand, SessionCore};
use crate::sink::{EventSink, SinkHandle};

const TERM: &str = "xterm-256color";

/// Options for a local-shell session.
#[derive(Debug, Clone)]
pub struct LocalSessionOptions {
    pub session_id: SessionId,
    pub initial_directory: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// Entry point for every inbound command. Routes by session identifier to
/// the owning session task.
pub struct SessionRouter {
    config: Arc<MuxConfig>,
    registry: Arc<SessionRegistry>,
    spawner: Arc<dyn ProcessSpawner>,
    env: Arc<dyn HostEnv>,
    sink: SinkHandle,
    platform: Platform,
    /// Shared by creates, exclusive for shutdown. Creates for the same
    /// identifier are serialized by a registry claim.
    lifecycle: RwLock<()>,
}

impl SessionRouter {
    pub fn new(
        config: MuxConfig,
        registry: Arc<SessionRegistry>,
        spawner: Arc<dyn ProcessSpawner>,
        env: Arc<dyn HostEnv>,
        sink: SinkHandle,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            registry,
            spawner,
            env,
            sink,
            platform: Platform::current(),
            lifecycle: RwLock::new(()),
        })
    }

    /// Override the `cd` dialect used by local sessions.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn sink(&self) -> &SinkHandle {
        &self.sink
    }

    /// Route all future events to `sink`. Running sessions pick it up on
    /// their next delivery.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        self.sink.attach(sink);
    }

    pub fn detach_sink(&self) {
        self.sink.detach();
    }

    /// Spawn a remote shell and wait until it is established.
    pub async fn create_remote_session(
        &self,
        options: RemoteSessionOptions,
    ) -> Result<(), SessionError> {
        let session_id = options.session_id.clone();
        let ready = {
            let _lifecycle = self.lifecycle.read().await;
            let _claim = self.registry.claim(&session_id).await;
            self.retire(&session_id).await;

            let remote = &self.config.remote;
            let spawned = self.spawner.spawn(SpawnRequest {
                program: remote.program.clone(),
                args: build_ssh_args(&options, remote),
                cwd: None,
                env: vec![("TERM".to_string(), TERM.to_string())],
                cols: options.cols,
                rows: options.rows,
            })?;

            let (ready_tx, ready_rx) = oneshot::channel();
            let controller =
                RemoteController::new(options.password, remote, ready_tx, Instant::now());
            self.install(session_id.clone(), spawned, controller);
            info!(
                session_id = %session_id,
                host = %options.host,
                port = options.port,
                username = %options.username,
                "remote session spawned"
            );
            ready_rx
        };

        ready
            .await
            .unwrap_or(Err(SessionError::SessionClosed(session_id)))
    }

    /// Spawn a local shell. Returns the directory it was started in.
    pub async fn create_local_session(
        &self,
        options: LocalSessionOptions,
    ) -> Result<PathBuf, SessionError> {
        let _lifecycle = self.lifecycle.read().await;
        let _claim = self.registry.claim(&options.session_id).await;
        self.retire(&options.session_id).await;

        let initial_dir = resolve_initial_dir(
            options.initial_directory.as_deref(),
            self.platform,
            self.env.as_ref(),
        );
        let spawned = self.spawner.spawn(SpawnRequest {
            program: self.config.local.resolve_shell(),
            args: Vec::new(),
            cwd: Some(initial_dir.clone()),
            env: vec![("TERM".to_string(), TERM.to_string())],
            cols: options.cols,
            rows: options.rows,
        })?;

        let controller =
            LocalController::new(initial_dir.clone(), self.platform, Arc::clone(&self.env));
        self.install(options.session_id.clone(), spawned, controller);
        info!(
            session_id = %options.session_id,
            cwd = %initial_dir.display(),
            "local session spawned"
        );
        Ok(initial_dir)
    }

    pub fn send_input(&self, session_id: &str, data: Vec<u8>) -> Result<(), SessionError> {
        self.dispatch(session_id, SessionCommand::Input(data))
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.dispatch(session_id, SessionCommand::Resize { cols, rows })
    }

    pub fn close_session(&self, session_id: &str, user_initiated: bool) -> Result<(), SessionError> {
        self.dispatch(session_id, SessionCommand::Close { user_initiated })
    }

    pub fn acknowledge_consumed(&self, session_id: &str, byte_count: u64) -> Result<(), SessionError> {
        self.dispatch(session_id, SessionCommand::Consumed(byte_count))
    }

    /// Tracked directory of a local session; `None` for remote sessions.
    pub async fn current_directory(&self, session_id: &str) -> Result<Option<PathBuf>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(session_id, SessionCommand::CurrentDir(tx))?;
        rx.await
            .map_err(|_| SessionError::SessionNotFound(session_id.to_string()))
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut replies = Vec::new();
        for sender in self.registry.senders() {
            let (tx, rx) = oneshot::channel();
            if sender.send(SessionCommand::Status(tx)).is_ok() {
                replies.push(rx);
            }
        }
        let mut summaries = Vec::with_capacity(replies.len());
        for reply in replies {
            if let Ok(summary) = reply.await {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    /// Close every session and wait for each to finish tearing down.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.write().await;
        let entries = self.registry.take_all();
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "closing all sessions");
        for (_, entry) in &entries {
            let _ = entry.commands.send(SessionCommand::Close {
                user_initiated: true,
            });
        }
        for (session_id, entry) in entries {
            if let Err(e) = entry.task.await {
                debug!(session_id = %session_id, error = %e, "session task ended abnormally");
            }
        }
    }

    fn dispatch(&self, session_id: &str, command: SessionCommand) -> Result<(), SessionError> {
        let sender = self
            .registry
            .sender(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        sender
            .send(command)
            .map_err(|_| SessionError::SessionNotFound(session_id.to_string()))
    }

    /// Fully tear down whatever currently owns `session_id`.
    async fn retire(&self, session_id: &str) {
        let Some(entry) = self.registry.take(session_id) else {
            return;
        };
        info!(session_id = %session_id, kind = ?entry.kind, "replacing existing session");
        let _ = entry.commands.send(SessionCommand::Close {
            user_initiated: true,
        });
        if let Err(e) = entry.task.await {
            debug!(session_id = %session_id, error = %e, "replaced session task ended abnormally");
        }
    }

    fn install<C>(&self, session_id: SessionId, spawned: SpawnedProcess, controller: C)
    where
        C: Controller + 'static,
    {
        let kind: SessionKind = controller.kind();
        let batcher = OutputBatcher::new(
            session_id.clone(),
            self.sink.clone(),
            self.config.batch,
            self.config.flow,
        );
        let core = SessionCore::new(
            session_id.clone(),
            spawned.handle,
            batcher,
            self.sink.clone(),
            self.config.close_grace_ms.duration(),
        );
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session = Session::new(core, controller, commands_rx, spawned.events);
        self.registry
            .install(session_id, kind, commands_tx, session.run());
    }
}
