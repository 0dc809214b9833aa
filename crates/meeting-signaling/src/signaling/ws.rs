//! WebSocket endpoint: bridges one socket to one [`SignalingSession`].
//!
//! The socket is split; a writer task drains the session's outbound queue
//! while the session consumes text frames from the reader half. Binary
//! frames are accepted when they hold UTF-8 JSON.

use super::protocol::ServerEnvelope;
use super::session::{SignalingContext, SignalingSession};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{future, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound frames buffered per connection before the session waits.
const OUTBOUND_BUFFER: usize = 256;

/// Largest accepted client frame.
const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Router serving `GET /ws`.
pub fn signaling_router(context: SignalingContext) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(context)
}

async fn ws_handler(ws: WebSocketUpgrade, State(context): State<SignalingContext>) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, context))
}

async fn handle_socket(socket: WebSocket, context: SignalingContext) {
    let connection_id = Uuid::new_v4().to_string();
    info!(
        target: "signaling.session",
        connection_id = %connection_id,
        "WebSocket connected"
    );

    let (mut ws_sender, ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEnvelope>(OUTBOUND_BUFFER);

    let writer_connection = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        target: "signaling.session",
                        connection_id = %writer_connection,
                        message_type = envelope.message.label(),
                        error = %e,
                        "Failed to encode server frame"
                    );
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!(
            target: "signaling.session",
            connection_id = %writer_connection,
            "Writer finished"
        );
    });

    let inbound = ws_receiver
        .take_while(|frame| future::ready(matches!(frame, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok(),
                _ => None,
            })
        });

    SignalingSession::new(connection_id.clone(), context, outbound_tx)
        .run(Box::pin(inbound))
        .await;

    // The session dropped its sender; the writer drains and exits.
    let _ = writer.await;
    info!(
        target: "signaling.session",
        connection_id = %connection_id,
        "WebSocket closed"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, RoomRegistryHandle, SignalingHubHandle};
    use crate::media::InMemoryMediaEngine;
    use crate::persistence::{InMemoryStore, MeetingStore};
    use crate::worker_pool::{WorkerPool, WorkerPoolConfig};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    async fn context() -> SignalingContext {
        let pool = WorkerPool::start(Arc::new(InMemoryMediaEngine::new()), WorkerPoolConfig::default())
            .await
            .unwrap();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(pool, Duration::from_secs(30), Arc::clone(&metrics));
        let store: Arc<dyn MeetingStore> = Arc::new(InMemoryStore::new());
        SignalingContext {
            hub: SignalingHubHandle::new(registry, Arc::clone(&store), Arc::clone(&metrics)),
            store,
            ice_servers: Arc::from(Vec::new()),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_plain_http_request_is_rejected() {
        let app = signaling_router(context().await);

        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(
            response.status().is_client_error(),
            "status {}",
            response.status()
        );
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let app = signaling_router(context().await);

        let response = app
            .oneshot(Request::builder().uri("/socket").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
