use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SessionError;

const READ_BUFFER_SIZE: usize = 4096;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Everything needed to start one session process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(Vec<u8>),
    /// Always the last event of a process.
    Exited(ExitStatus),
}

/// Control side of a spawned process.
pub trait ProcessHandle: Send {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError>;
    /// Terminate the process. Killing a process that already exited is `Ok`.
    fn kill(&mut self) -> Result<(), SessionError>;
}

pub struct SpawnedProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// Process-spawning facility. Sessions only ever see this trait, so tests can
/// drive them with scripted processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, SessionError>;
}

/// Spawns processes on a native pseudo-terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl ProcessSpawner for PtySpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("{}: {e}", request.program)))?;
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Pty(e.to_string()))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Pty(e.to_string()))?;
        let killer = child.clone_killer();

        let exited = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reader_exited = Arc::clone(&exited);
        let program = request.program.clone();
        std::thread::Builder::new()
            .name(format!("pty-reader-{program}"))
            .spawn(move || {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(ProcessEvent::Output(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        // Linux reports EIO on the master once the child is gone.
                        Err(e) => {
                            debug!(program = %program, error = %e, "pty read ended");
                            break;
                        }
                    }
                }

                let status = match child.wait() {
                    Ok(status) => ExitStatus {
                        code: i32::try_from(status.exit_code()).ok(),
                        signal: None,
                    },
                    Err(e) => {
                        warn!(program = %program, error = %e, "failed to reap process");
                        ExitStatus::default()
                    }
                };
                reader_exited.store(true, Ordering::SeqCst);
                let _ = tx.blocking_send(ProcessEvent::Exited(status));
            })
            .map_err(SessionError::Io)?;

        Ok(SpawnedProcess {
            handle: Box::new(PtyHandle {
                master: pair.master,
                writer,
                killer,
                exited,
            }),
            events: rx,
        })
    }
}

struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle for PtyHandle {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(e.to_string()))
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.killer.kill() {
            Ok(()) => Ok(()),
            Err(_) if self.exited.load(Ordering::SeqCst) => Ok(()),
            Err(e) => Err(SessionError::Pty(e.to_string())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(program: &str, args: &[&str]) -> SpawnRequest {
        SpawnRequest {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            env: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }

    async fn collect(mut events: mpsc::Receiver<ProcessEvent>) -> (Vec<u8>, ExitStatus) {
        let mut output = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for process")
                .expect("event stream ended without exit");
            match event {
                ProcessEvent::Output(bytes) => output.extend(bytes),
                ProcessEvent::Exited(status) => return (output, status),
            }
        }
    }

    #[tokio::test]
    async fn output_then_exit_code() {
        let spawned = PtySpawner
            .spawn(request("/bin/sh", &["-c", "printf ready; exit 3"]))
            .unwrap();
        let (output, status) = collect(spawned.events).await;
        assert!(String::from_utf8_lossy(&output).contains("ready"));
        assert_eq!(status.code, Some(3));
    }

    #[tokio::test]
    async fn kill_after_exit_is_ok() {
        let spawned = PtySpawner
            .spawn(request("/bin/sh", &["-c", "exit 0"]))
            .unwrap();
        let mut handle = spawned.handle;
        let (_, status) = collect(spawned.events).await;
        assert_eq!(status.code, Some(0));
        handle.kill().unwrap();
        handle.kill().unwrap();
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let result = PtySpawner.spawn(request("/nonexistent/shellmux-test-binary", &[]));
        assert!(matches!(result, Err(SessionError::Spawn(_))));
    }
}
