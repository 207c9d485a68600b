//! cowrite-server - authoritative hub for a single shared rich-text pad.
//!
//! A real-time collaboration server using:
//! - Textual diff/patch merging for last-writer-wins document synchronization
//! - Plain-file persistence with debounced, crash-safe write-out
//! - Axum with WebSocket for client communication
//! - JSON text frames matching the editor shell's message dispatch

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

mod config;
mod doc;
mod media;
mod sync;

use config::Config;
use doc::{DocSaver, DocumentStore};
use sync::protocol;
use sync::registry::Outbound;
use sync::CollabServer;

/// Editor shell served at GET /doc. Opaque to the server.
const CLIENT_SHELL: &str = include_str!("../assets/doc.html");

/// Absolute ceiling on graceful shutdown before the process force-exits.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Transport liveness: ping cadence and pong grace.
const PING_INTERVAL: Duration = Duration::from_secs(10);
const PONG_TIMEOUT: Duration = Duration::from_secs(5);

struct AppState {
    hub: Arc<CollabServer>,
    page: String,
}

async fn doc_page(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Html(state.page.clone())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task pair per socket: the writer drains the outbound channel and owns
/// liveness pings, the reader feeds decoded frames to the hub. Either side
/// ending tears the connection down.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    debug!(%conn_id, "connection opened");

    let last_pong = Arc::new(parking_lot::Mutex::new(Instant::now()));

    let pong_seen = Arc::clone(&last_pong);
    let send_conn = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(Outbound::Message(msg)) => match protocol::encode_server(&msg) {
                        Ok(text) => {
                            if ws_sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(conn_id = %send_conn, "failed to encode message: {e}"),
                    },
                    Some(Outbound::Close) => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if pong_seen.lock().elapsed() > PING_INTERVAL + PONG_TIMEOUT {
                        debug!(conn_id = %send_conn, "pong timeout, closing");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(conn_id = %send_conn, "writer task ended");
    });

    let recv_hub = Arc::clone(&state.hub);
    let recv_conn = conn_id.clone();
    let recv_tx = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match protocol::decode_client(&text) {
                    Ok(client_msg) => recv_hub.handle_message(&recv_conn, &recv_tx, client_msg),
                    Err(e) => warn!(conn_id = %recv_conn, "dropping malformed frame: {e}"),
                },
                Message::Pong(_) => {
                    *last_pong.lock() = Instant::now();
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        debug!(conn_id = %recv_conn, "reader task ended");
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.handle_disconnect(&conn_id);
    debug!(%conn_id, "connection closed");
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut usr2 = signal(SignalKind::user_defined2()).expect("failed to install SIGUSR2 handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = usr2.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cowrite_server=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env());

    let store = Arc::new(DocumentStore::new(
        config.doc_path.clone(),
        config.max_doc_bytes,
    ));
    if let Err(e) = store.load() {
        error!(path = %config.doc_path.display(), "failed to load document: {e}");
        std::process::exit(1);
    }

    let saver = Arc::new(DocSaver::new(Arc::clone(&store), config.save_interval));
    let hub = Arc::new(CollabServer::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&saver),
    ));

    let _saver_task = saver.spawn();
    let _cleanup_task = hub.spawn_cleanup();

    let page = CLIENT_SHELL.replace(
        "__CURSOR_TIMEOUT_MS__",
        &config.cursor_timeout.as_millis().to_string(),
    );
    let state = Arc::new(AppState {
        hub: Arc::clone(&hub),
        page,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/doc", get(doc_page))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("cowrite-server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   listening on: http://{addr}");
    info!("   document page: http://{addr}/doc");
    info!("   websocket: ws://{addr}/ws");

    let (close_listener_tx, close_listener_rx) = tokio::sync::oneshot::channel::<()>();
    {
        let hub = Arc::clone(&hub);
        let saver = Arc::clone(&saver);
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");

            // Hard deadline regardless of how teardown goes.
            tokio::spawn(async {
                tokio::time::sleep(SHUTDOWN_DEADLINE).await;
                error!("shutdown deadline exceeded, force exiting");
                std::process::exit(1);
            });

            // Stop the save timer and any pending debounced save, then take
            // one final blocking save of the last accepted state.
            saver.stop();
            hub.begin_shutdown();
            match tokio::task::spawn_blocking(move || store.save_sync()).await {
                Ok(Ok(())) => info!("final save complete"),
                Ok(Err(e)) => error!("final save failed: {e}"),
                Err(e) => error!("final save task failed: {e}"),
            }

            hub.broadcast_shutdown("The server is shutting down.");
            let _ = close_listener_tx.send(());
        });
    }

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = close_listener_rx.await;
        })
        .await
    {
        error!("server error: {e}");
        std::process::exit(1);
    }

    info!("shutdown complete");
}
