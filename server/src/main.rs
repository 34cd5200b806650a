//! Read-only server harness (spec §6). Owns one `ProcessData` seeded from a
//! binary at startup, accepts a tracer connection per traced thread on a
//! plain TCP listener, and exposes periodic graph snapshots to GUI clients
//! over a WebSocket. The harness never mutates graph state; only the
//! per-connection `Worker` tasks do.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tower_http::services::ServeDir;
use tracegraph_core::graph::{EdgeClass, NodeKind, PerThreadGraph};
use tracegraph_core::signals::CancelFlag;
use tracegraph_core::types::ThreadId;
use tracegraph_core::{BinaryLoader, ProcessData, Worker, WorkerConfig};
use tracing::{error, info, warn};

struct AppState {
    process: Arc<ProcessData>,
    graphs: RwLock<HashMap<ThreadId, Arc<PerThreadGraph>>>,
    next_thread: AtomicU64,
    config: WorkerConfig,
    tx: broadcast::Sender<String>,
    cancel: CancelFlag,
}

impl AppState {
    fn register_thread(&self) -> (ThreadId, Arc<PerThreadGraph>) {
        let thread = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let graph = Arc::new(PerThreadGraph::new(thread));
        self.graphs.write().insert(thread, graph.clone());
        (thread, graph)
    }

    fn snapshot(&self) -> Snapshot {
        let threads = self
            .graphs
            .read()
            .values()
            .map(|g| graph_snapshot(g))
            .collect();
        Snapshot { threads }
    }
}

#[derive(Serialize)]
struct Snapshot {
    threads: Vec<GraphSnapshot>,
}

#[derive(Serialize)]
struct GraphSnapshot {
    thread_id: ThreadId,
    terminated: bool,
    backlog_rate: u64,
    nodes: Vec<NodeSnapshot>,
    edges: Vec<EdgeSnapshot>,
}

#[derive(Serialize)]
struct NodeSnapshot {
    index: usize,
    address: String,
    kind: &'static str,
    a: i64,
    b: i64,
    execution_count: u64,
}

#[derive(Serialize)]
struct EdgeSnapshot {
    source: usize,
    target: usize,
    class: &'static str,
}

fn edge_class_label(class: EdgeClass) -> &'static str {
    match class {
        EdgeClass::New => "new",
        EdgeClass::Old => "old",
        EdgeClass::Call => "call",
        EdgeClass::Return => "return",
        EdgeClass::Exception => "exception",
        EdgeClass::Library => "library",
    }
}

fn graph_snapshot(graph: &PerThreadGraph) -> GraphSnapshot {
    let nodes = (0..graph.num_nodes())
        .filter_map(|idx| {
            graph.with_node(idx, |n| NodeSnapshot {
                index: n.index,
                address: format!("{:x}", n.address()),
                kind: match n.kind {
                    NodeKind::Instruction(_) => "instruction",
                    NodeKind::External { .. } => "external",
                },
                a: n.vcoord.a,
                b: n.vcoord.b,
                execution_count: n.execution_count,
            })
        })
        .collect();

    let edges = graph
        .snapshot_edges()
        .into_iter()
        .map(|e| EdgeSnapshot {
            source: e.source,
            target: e.target,
            class: edge_class_label(e.class),
        })
        .collect();

    GraphSnapshot {
        thread_id: graph.thread_id,
        terminated: graph.terminated.load(Ordering::Relaxed),
        backlog_rate: graph.backlog_rate.load(Ordering::Relaxed),
        nodes,
        edges,
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    info!("tracegraph server starting");

    let process = Arc::new(ProcessData::new());

    let args: Vec<String> = env::args().collect();
    if let Some(binary_path) = args.get(1) {
        info!(path = %binary_path, "loading binary");
        match BinaryLoader::new().and_then(|loader| loader.load_file(&process, Path::new(binary_path))) {
            Ok(_) => info!("binary loaded"),
            Err(e) => error!(error = %e, "failed to load binary"),
        }
    }

    let (tx, _rx) = broadcast::channel(16);
    let state = Arc::new(AppState {
        process: process.clone(),
        graphs: RwLock::new(HashMap::new()),
        next_thread: AtomicU64::new(0),
        config: WorkerConfig::from_env(),
        tx: tx.clone(),
        cancel: CancelFlag::new(),
    });

    tokio::spawn(accept_tracer_connections(state.clone()));
    tokio::spawn(broadcast_snapshots(state.clone()));
    tokio::spawn(watch_for_shutdown_signal(state.clone()));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .nest_service("/", ServeDir::new("frontend/dist"))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind("0.0.0.0:3000").await {
        Ok(l) => l,
        Err(e) => panic!("failed to bind GUI TCP listener: {e}"),
    };
    info!("listening on http://0.0.0.0:3000");

    axum::serve(listener, app).await.unwrap();
}

/// Accepts one TCP connection per traced thread and runs a dedicated
/// `Worker` over it until the tracer closes the pipe (E4).
async fn accept_tracer_connections(state: Arc<AppState>) {
    let listener = match tokio::net::TcpListener::bind("0.0.0.0:3001").await {
        Ok(l) => {
            info!("tracer listener on 0.0.0.0:3001");
            l
        }
        Err(e) => panic!("failed to bind tracer TCP socket: {e}"),
    };

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to accept tracer connection");
                continue;
            }
        };

        let (thread, graph) = state.register_thread();
        let process = state.process.clone();
        let config = state.config.clone();
        let cancel = state.cancel.clone();
        info!(thread, "tracer connected");

        tokio::spawn(async move {
            let mut worker = Worker::new(thread, process, graph, config).with_cancel_flag(cancel);
            worker.run(BufReader::new(stream)).await;
            info!(thread, "tracer disconnected");
        });
    }
}

/// Flips the shared die flag on ctrl-c so every in-flight `Worker` stops at
/// its next checkpoint instead of being killed mid-drain.
async fn watch_for_shutdown_signal(state: Arc<AppState>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received, cancelling workers");
        state.cancel.cancel();
    }
}

/// Periodically publishes a full snapshot to every connected GUI client.
/// Graph state itself is only ever read here, never mutated.
async fn broadcast_snapshots(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    loop {
        interval.tick().await;
        if state.tx.receiver_count() == 0 {
            continue;
        }
        match serde_json::to_string(&state.snapshot()) {
            Ok(json) => {
                let _ = state.tx.send(json);
            }
            Err(e) => error!(error = %e, "failed to serialize snapshot"),
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.tx.subscribe();

    if let Ok(json) = serde_json::to_string(&state.snapshot()) {
        if socket.send(Message::Text(json)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error");
                        break;
                    }
                    // Read-only: any other client frame (text, ping, ...) is ignored.
                    _ => {}
                }
            }
            msg = rx.recv() => {
                match msg {
                    Ok(json) => {
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
