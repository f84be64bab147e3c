#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libshellmux::config::MuxConfig;
use libshellmux::{
    ChannelSink, ExitStatus, HostEnv, Platform, ProcessEvent, ProcessHandle, ProcessSpawner,
    SessionError, SessionRegistry, SessionRouter, SinkHandle, SpawnRequest, SpawnedProcess,
};
use shellmux_protocol::{CloseReason, Event};
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};

/// A scripted process: tests push output and exits through `events`.
#[derive(Clone)]
pub struct FakeProcess {
    pub request: SpawnRequest,
    events: mpsc::Sender<ProcessEvent>,
    writes: Arc<Mutex<Vec<u8>>>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    killed: Arc<AtomicBool>,
    /// Ignores kill; the session only ends when its close grace runs out.
    lingers: bool,
}

impl FakeProcess {
    pub fn output(&self, text: &str) {
        self.events
            .try_send(ProcessEvent::Output(text.as_bytes().to_vec()))
            .unwrap();
    }

    pub fn exit(&self, code: Option<i32>) {
        self.events
            .try_send(ProcessEvent::Exited(ExitStatus { code, signal: None }))
            .unwrap();
    }

    pub fn written(&self) -> Vec<u8> {
        self.writes.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct FakeHandle {
    process: FakeProcess,
}

impl ProcessHandle for FakeHandle {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.process.writes.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.process.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        if !self.process.killed.swap(true, Ordering::SeqCst) && !self.process.lingers {
            let _ = self.process.events.try_send(ProcessEvent::Exited(ExitStatus {
                code: None,
                signal: Some(15),
            }));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSpawner {
    processes: Mutex<Vec<FakeProcess>>,
    spawned: Notify,
    fail_next: AtomicBool,
    linger: AtomicBool,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Processes spawned from now on ignore kill.
    pub fn linger_on_kill(&self) {
        self.linger.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    /// Wait for the `index`-th spawn.
    pub async fn spawned(&self, index: usize) -> FakeProcess {
        loop {
            if let Some(process) = self.processes.lock().unwrap().get(index).cloned() {
                return process;
            }
            self.spawned.notified().await;
        }
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, SessionError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SessionError::Spawn(format!("{}: not found", request.program)));
        }
        let (tx, rx) = mpsc::channel(64);
        let process = FakeProcess {
            request,
            events: tx,
            writes: Arc::default(),
            resizes: Arc::default(),
            killed: Arc::default(),
            lingers: self.linger.load(Ordering::SeqCst),
        };
        self.processes.lock().unwrap().push(process.clone());
        self.spawned.notify_one();
        Ok(SpawnedProcess {
            handle: Box::new(FakeHandle { process }),
            events: rx,
        })
    }
}

/// Host environment rooted in a temporary home directory.
pub struct FakeEnv {
    pub home: PathBuf,
    pub vars: HashMap<String, String>,
}

impl HostEnv for FakeEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        Some(self.home.clone())
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

pub struct Harness {
    pub router: Arc<SessionRouter>,
    pub spawner: Arc<FakeSpawner>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub home: PathBuf,
    _tmp: TempDir,
}

pub fn harness() -> Harness {
    harness_with(MuxConfig::default())
}

pub fn harness_with(config: MuxConfig) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let home = tmp.path().canonicalize().unwrap();
    let env = FakeEnv {
        home: home.clone(),
        vars: HashMap::new(),
    };
    let spawner = FakeSpawner::new();
    let (sink, events) = ChannelSink::new();
    let router = SessionRouter::new(
        config,
        SessionRegistry::new(),
        spawner.clone(),
        Arc::new(env),
        SinkHandle::with_sink(Arc::new(sink)),
    )
    .unwrap()
    .with_platform(Platform::Unix);
    Harness {
        router: Arc::new(router),
        spawner,
        events,
        home,
        _tmp: tmp,
    }
}

/// Let spawned tasks drain their queues without advancing the clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn next_output(events: &mut mpsc::UnboundedReceiver<Event>) -> String {
    match next_event(events).await {
        Event::SessionOutput { text, .. } => text,
        other => panic!("expected output, got {other:?}"),
    }
}

/// Skip output until the close notification for `session_id` arrives.
pub async fn next_close(
    events: &mut mpsc::UnboundedReceiver<Event>,
    session_id: &str,
) -> (CloseReason, Option<i32>) {
    loop {
        if let Event::SessionClosed {
            session_id: id,
            reason,
            exit_code,
            ..
        } = next_event(events).await
            && id == session_id
        {
            return (reason, exit_code);
        }
    }
}
