use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::debug;
use zeroize::Zeroizing;

use libshellmux::{
    ChannelSink, EventSink, LocalSessionOptions, RemoteSessionOptions, SessionError, SessionRouter,
};
use shellmux_protocol::{Event, ErrorCode, Request, Response};

const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

type Writer = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Serve one consumer. The connection becomes the router's event sink for
/// as long as it is open; a newer connection takes over.
pub async fn handle_client(stream: UnixStream, router: Arc<SessionRouter>) {
    let (sink, events) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    router.attach_sink(Arc::clone(&sink));
    debug!("consumer attached");

    if let Err(e) = serve(stream, &router, events).await {
        debug!(error = %e, "client disconnected");
    }

    router.sink().detach_if(&sink);
    debug!("consumer detached");
}

async fn serve(
    stream: UnixStream,
    router: &Arc<SessionRouter>,
    mut events: mpsc::UnboundedReceiver<Event>,
) -> anyhow::Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    // Replies to requests that complete in the background.
    let (deferred_tx, mut deferred_rx) = mpsc::unbounded_channel::<Response>();

    loop {
        tokio::select! {
            line = reader.next() => {
                let Some(line) = line else { break };
                let response = match line {
                    Ok(line) => handle_line(&line, router, &deferred_tx).await,
                    Err(LinesCodecError::MaxLineLengthExceeded) => Some(Response::error(
                        None,
                        ErrorCode::InvalidRequest,
                        "request line too long",
                    )),
                    Err(LinesCodecError::Io(e)) => return Err(e.into()),
                };
                if let Some(response) = response {
                    send(&mut writer, &response).await?;
                }
            }
            Some(event) = events.recv() => send(&mut writer, &Response::Event(event)).await?,
            Some(response) = deferred_rx.recv() => send(&mut writer, &response).await?,
        }
    }
    Ok(())
}

async fn send(writer: &mut Writer, response: &Response) -> anyhow::Result<()> {
    let line = serde_json::to_string(response)?;
    writer.send(line).await?;
    Ok(())
}

/// Returns the immediate reply, if any. Fire-and-forget commands only
/// answer when they fail.
async fn handle_line(
    line: &str,
    router: &Arc<SessionRouter>,
    deferred: &mpsc::UnboundedSender<Response>,
) -> Option<Response> {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return Some(Response::error(
                None,
                ErrorCode::InvalidRequest,
                format!("invalid request: {e}"),
            ));
        }
    };

    match request {
        Request::CreateRemoteSession {
            request_id,
            session_id,
            host,
            port,
            username,
            password,
            private_key_path,
            port_forwards,
            cols,
            rows,
        } => {
            let options = RemoteSessionOptions {
                session_id: session_id.clone(),
                host,
                port,
                username,
                password: password.map(|p| Zeroizing::new(p.into_inner())),
                private_key_path,
                port_forwards,
                cols,
                rows,
            };
            let router = Arc::clone(router);
            let deferred = deferred.clone();
            tokio::spawn(async move {
                let response = match router.create_remote_session(options).await {
                    Ok(()) => Response::ok(
                        request_id,
                        serde_json::json!({ "success": true, "session_id": session_id }),
                    ),
                    Err(e) => error_response(request_id, &e),
                };
                let _ = deferred.send(response);
            });
            None
        }

        Request::CreateLocalSession {
            request_id,
            session_id,
            initial_directory,
            cols,
            rows,
        } => {
            let options = LocalSessionOptions {
                session_id: session_id.clone(),
                initial_directory,
                cols,
                rows,
            };
            let router = Arc::clone(router);
            let deferred = deferred.clone();
            tokio::spawn(async move {
                let response = match router.create_local_session(options).await {
                    Ok(dir) => Response::ok(
                        request_id,
                        serde_json::json!({
                            "success": true,
                            "session_id": session_id,
                            "resolved_directory": dir,
                        }),
                    ),
                    Err(e) => error_response(request_id, &e),
                };
                let _ = deferred.send(response);
            });
            None
        }

        Request::SendInput { session_id, data } => {
            router.send_input(&session_id, data).err().map(|e| error_response(None, &e))
        }

        Request::Resize {
            session_id,
            cols,
            rows,
        } => router
            .resize(&session_id, cols, rows)
            .err()
            .map(|e| error_response(None, &e)),

        Request::CloseSession {
            session_id,
            user_initiated,
        } => router
            .close_session(&session_id, user_initiated)
            .err()
            .map(|e| error_response(None, &e)),

        Request::AcknowledgeConsumed {
            session_id,
            byte_count,
        } => router
            .acknowledge_consumed(&session_id, byte_count)
            .err()
            .map(|e| error_response(None, &e)),

        Request::GetCurrentDirectory {
            request_id,
            session_id,
        } => Some(match router.current_directory(&session_id).await {
            Ok(Some(dir)) => Response::ok(
                request_id,
                serde_json::json!({ "success": true, "directory": dir }),
            ),
            Ok(None) => Response::ok(request_id, serde_json::json!({ "success": false })),
            Err(e) => error_response(request_id, &e),
        }),

        Request::SessionList { request_id } => {
            let sessions = router.list_sessions().await;
            Some(Response::ok(
                request_id,
                serde_json::to_value(&sessions).unwrap_or_default(),
            ))
        }
    }
}

fn error_response(request_id: Option<u64>, error: &SessionError) -> Response {
    let (code, message) = error.to_error_code();
    Response::error(request_id, code, message)
}
