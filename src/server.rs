use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use meeting_media::ingest::{IngestSession, SessionEvent};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BIND_ATTEMPTS: u16 = 10;
const MAX_MESSAGE_SIZE: usize = 64 << 20;

pub(crate) type SharedSession = Arc<Mutex<IngestSession>>;

/// Binds `host:port`, moving to the next port while the address is taken.
pub(crate) async fn bind(host: &str, port: u16) -> anyhow::Result<TcpListener> {
    for offset in 0..BIND_ATTEMPTS {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                log::warn!("port {} in use, trying {}", candidate, candidate.wrapping_add(1));
            }
            Err(e) => return Err(e.into()),
        }
    }
    anyhow::bail!("no free port in {}..{}", port, port.saturating_add(BIND_ATTEMPTS))
}

pub(crate) fn start_ingest_server(
    listener: TcpListener,
    session: SharedSession,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new().route("/", get(upgrade)).with_state(session);

        match listener.local_addr() {
            Ok(addr) => log::info!("ingest server listening on ws://{}", addr),
            Err(e) => log::warn!("ingest server address unknown: {}", e),
        }
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("ingest server failed: {}", e);
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down ingest server");
}

async fn upgrade(ws: WebSocketUpgrade, State(session): State<SharedSession>) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_socket(socket, session))
}

async fn serve_socket(mut socket: WebSocket, session: SharedSession) {
    log::info!("media producer connected");
    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Binary(data)) => {
                // Video pushes block while the pipeline applies backpressure.
                let event = tokio::task::block_in_place(|| {
                    session
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .handle_message(&data, Instant::now())
                });
                if let Some(event) = event {
                    log_event(event);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("media producer connection failed: {}", e);
                break;
            }
        }
    }
    log::info!("media producer disconnected");
}

fn log_event(event: SessionEvent) {
    match event {
        SessionEvent::Caption(caption) => log::debug!("caption: {}", caption),
        SessionEvent::AudioFormat(format) => log::info!(
            "audio format: {} ch @ {} Hz",
            format.number_of_channels,
            format.sample_rate
        ),
        SessionEvent::RosterChanged { active } => {
            log::info!("{} participants in meeting", active)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_moves_past_taken_port() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let listener = bind("127.0.0.1", port).await.unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert_ne!(bound, port);
        assert!(bound > port && bound < port.saturating_add(BIND_ATTEMPTS));
    }
}
