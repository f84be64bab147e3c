//! Working-directory tracking for local shells, driven purely by what the
//! user types.

mod parse;
mod resolve;
mod scanner;
mod tracker;

pub use parse::{CwdCommand, parse_cwd_command};
pub use resolve::{HostEnv, Platform, SystemEnv, expand_env_vars, resolve_local_cwd};
pub use scanner::InputScanner;
pub use tracker::CwdTracker;
