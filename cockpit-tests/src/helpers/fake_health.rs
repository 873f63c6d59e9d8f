//! Local HTTP health endpoint whose answer tests can flip

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Clone)]
struct HealthState {
    healthy: Arc<AtomicBool>,
    hits: Arc<AtomicU32>,
}

/// Serves `GET /health` on an ephemeral port: 200 while healthy, 503 otherwise
pub struct FakeHealthServer {
    addr: SocketAddr,
    state: HealthState,
    task: JoinHandle<()>,
}

impl FakeHealthServer {
    pub async fn start(healthy: bool) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = HealthState {
            healthy: Arc::new(AtomicBool::new(healthy)),
            hits: Arc::new(AtomicU32::new(0)),
        };

        let app = Router::new()
            .route("/health", get(health))
            .with_state(state.clone());

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self { addr, state, task })
    }

    pub fn url(&self) -> String {
        format!("http://{}/health", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Requests served so far
    pub fn hits(&self) -> u32 {
        self.state.hits.load(Ordering::SeqCst)
    }
}

impl Drop for FakeHealthServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn health(State(state): State<HealthState>) -> StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
