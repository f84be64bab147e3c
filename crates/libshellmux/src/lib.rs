pub mod batcher;
pub mod config;
pub mod cwd;
pub mod error;
pub mod flow;
pub mod local;
pub mod process;
pub mod registry;
pub mod remote;
pub mod router;
pub mod sink;

mod session;

pub use batcher::OutputBatcher;
pub use config::MuxConfig;
pub use cwd::{HostEnv, Platform, SystemEnv};
pub use error::SessionError;
pub use flow::{FlowControl, FlowTransition};
pub use process::{
    ExitStatus, ProcessEvent, ProcessHandle, ProcessSpawner, PtySpawner, SpawnRequest,
    SpawnedProcess,
};
pub use registry::SessionRegistry;
pub use remote::RemoteSessionOptions;
pub use router::{LocalSessionOptions, SessionRouter};
pub use sink::{ChannelSink, EventSink, SinkHandle};
