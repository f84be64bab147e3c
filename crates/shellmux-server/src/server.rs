use std::sync::Arc;

use anyhow::Context;
use tokio::net::UnixListener;
use tracing::{error, info};

use libshellmux::{PtySpawner, SessionRegistry, SessionRouter, SinkHandle, SystemEnv};

use crate::config::ServerConfig;
use crate::connection;

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // Clean up stale socket
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pid_path = config.pid_file();
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600)).ok();
    }
    info!(
        socket = %config.socket_path.display(),
        pid = std::process::id(),
        "shellmux server started"
    );

    let router = Arc::new(SessionRouter::new(
        config.mux,
        SessionRegistry::new(),
        Arc::new(PtySpawner),
        Arc::new(SystemEnv),
        SinkHandle::new(),
    )?);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let router = Arc::clone(&router);
                    tokio::spawn(async move {
                        connection::handle_client(stream, router).await;
                    });
                }
                Err(e) => error!("accept error: {e}"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down...");
    router.shutdown().await;
    let _ = std::fs::remove_file(&config.socket_path);
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}
