use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use triad_core::ids::WorkerId;

use crate::coordinator::Coordinator;
use crate::protocol::{
    payload_of, EnvelopeKind, ErrorPayload, RegisteredPayload, RegistrationPayload, StormMessage,
    SERVICE_NAME,
};

/// Endpoint configuration.
#[derive(Clone, Debug)]
pub struct StormConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Coordinator>,
    max_send_queue: usize,
}

/// Build the Axum router with the worker endpoint and health check.
pub fn build_router(coordinator: Arc<Coordinator>, config: &StormConfig) -> Router {
    let state = AppState {
        coordinator,
        max_send_queue: config.max_send_queue,
    };
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the endpoint and spawn the coordinator's background loops. The
/// returned handle keeps the server task alive.
pub async fn start(config: StormConfig, coordinator: Arc<Coordinator>) -> Result<StormHandle, std::io::Error> {
    coordinator.start();

    let router = build_router(Arc::clone(&coordinator), &config);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "storm coordinator listening");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(StormHandle {
        port: local_addr.port(),
        _server: server,
    })
}

pub struct StormHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.coordinator.system_status();
    axum::Json(serde_json::json!({
        "status": "healthy",
        "system": status,
    }))
}

/// Per-connection lifecycle: a writer task drains the worker's outbox into
/// the socket while the reader loop enforces registration-first and feeds
/// envelopes to the coordinator. Either side ending tears the worker down.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_tx, ws_rx) = socket.split();
    let (outbox_tx, outbox_rx) = mpsc::channel::<String>(state.max_send_queue);

    let writer = tokio::spawn(write_loop(ws_tx, outbox_rx));
    let worker = read_loop(ws_rx, outbox_tx, &state).await;

    if let Some(id) = worker {
        state.coordinator.workers().deregister(&id);
        tracing::info!(worker = %id, "worker disconnected");
    }
    writer.abort();
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(text) = rx.recv().await {
        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    outbox: mpsc::Sender<String>,
    state: &AppState,
) -> Option<WorkerId> {
    let mut worker: Option<WorkerId> = None;

    while let Some(Ok(frame)) = ws_rx.next().await {
        let text = match frame {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        // A malformed frame gets an error reply; the connection stays open.
        let msg = match serde_json::from_str::<StormMessage>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                send_error(&outbox, format!("invalid frame: {e}"));
                continue;
            }
        };

        if msg.kind == EnvelopeKind::AgentRegistration {
            worker = Some(register(state, &outbox, &msg));
            continue;
        }
        match &worker {
            None => send_error(&outbox, "registration required".into()),
            Some(id) => state.coordinator.handle_envelope(id, &msg),
        }
    }

    worker
}

/// Register (or re-register) the sending worker and confirm before any other
/// traffic is accepted from this connection identity.
fn register(state: &AppState, outbox: &mpsc::Sender<String>, msg: &StormMessage) -> WorkerId {
    let capabilities = msg
        .payload_as::<RegistrationPayload>()
        .map(|p| p.capabilities)
        .unwrap_or_default();
    let id = WorkerId::from_raw(msg.sender.clone());

    state
        .coordinator
        .workers()
        .register(id.clone(), capabilities.clone(), outbox.clone());

    let confirm = StormMessage::new(EnvelopeKind::AgentRegistration, SERVICE_NAME)
        .to(id.as_str())
        .with_payload(payload_of(&RegisteredPayload::new(id.as_str())));
    if !state.coordinator.workers().send_to(&id, &confirm) {
        tracing::warn!(worker = %id, "failed to queue registration confirmation");
    }

    tracing::info!(worker = %id, ?capabilities, "worker registered");
    id
}

fn send_error(outbox: &mpsc::Sender<String>, error: String) {
    match serde_json::to_string(&ErrorPayload { error }) {
        Ok(json) => {
            let _ = outbox.try_send(json);
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize error reply"),
    }
}
