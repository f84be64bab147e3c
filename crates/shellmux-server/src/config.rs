use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use libshellmux::MuxConfig;

const APP_DIR: &str = "shellmux";

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default)]
    pub mux: MuxConfig,
}

impl ServerConfig {
    /// Load from `path`, or from the default location when it exists.
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path(), false),
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.mux.validate()?;
        Ok(config)
    }

    /// PID file kept next to the socket.
    pub fn pid_file(&self) -> PathBuf {
        self.socket_path.with_extension("pid")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            mux: MuxConfig::default(),
        }
    }
}

/// `$XDG_RUNTIME_DIR/shellmux.sock`, else a per-user name in the temp dir.
fn default_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join(format!("{APP_DIR}.sock")),
        None => {
            // SAFETY: getuid has no preconditions.
            let uid = unsafe { libc::getuid() };
            std::env::temp_dir().join(format!("{APP_DIR}-{uid}.sock"))
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("config.toml")
}
