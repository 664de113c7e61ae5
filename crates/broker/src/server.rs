//! Observer endpoint: WebSocket fan-out of broker events plus two small
//! JSON probes.

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use nod_common::{Decision, ObserverMessage};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::correlator::RequestCorrelator;
use crate::error::{BrokerError, Result};
use crate::ledger::CreditLedger;
use crate::registry::{ObserverId, ObserverRegistry};

#[derive(Clone)]
pub struct ServerState {
    pub correlator: RequestCorrelator,
    pub registry: ObserverRegistry,
    pub ledger: CreditLedger,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(observer_upgrade))
        .route("/ws", get(observer_upgrade))
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET])
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Bound but not yet serving.
pub struct ObserverServer {
    listener: TcpListener,
    router: Router,
}

impl ObserverServer {
    pub async fn bind(addr: SocketAddr, state: ServerState) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BrokerError::Bind { addr, source })?;
        Ok(Self {
            listener,
            router: router(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves observers until `shutdown` completes.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Observer endpoint listening on ws://{addr}");
        }
        axum::serve(self.listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn observer_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observer_session(socket, state))
}

async fn observer_session(socket: WebSocket, state: ServerState) {
    let (id, mut events) = state.registry.register().await;
    info!(observer_id = id, "Observer connected");

    let (mut sender, mut receiver) = socket.split();
    let mut forward = tokio::spawn(async move {
        while let Some(payload) = events.recv().await {
            if sender.send(Message::Text(payload.to_string())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_observer_text(&state, id, &text).await,
                Some(Ok(Message::Binary(bytes))) => {
                    debug!(observer_id = id, len = bytes.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(observer_id = id, "Observer socket error: {}", err);
                    break;
                }
            },
            _ = &mut forward => break,
        }
    }

    forward.abort();
    state.registry.unregister(id).await;
    info!(observer_id = id, "Observer disconnected");
}

async fn handle_observer_text(state: &ServerState, observer: ObserverId, text: &str) {
    match ObserverMessage::parse(text) {
        Ok(ObserverMessage::Response { id, decision }) => {
            let decision = Decision::parse(&decision);
            if !state.correlator.resolve(id, decision).await {
                debug!(observer_id = observer, request_id = id, "Response had no pending request");
            }
        }
        Err(err) => {
            warn!(observer_id = observer, "Malformed observer message: {}", err);
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "credits": state.ledger.total().await,
        "pending": state.correlator.pending_ids().await,
        "observers": state.registry.len().await,
        "stats": state.correlator.stats(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use nod_common::RiskLevel;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> ServerState {
        ServerState {
            correlator: RequestCorrelator::new(Duration::from_secs(120)),
            registry: ObserverRegistry::default(),
            ledger: CreditLedger::new(),
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = get_json(router(state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn status_snapshot() {
        let state = state();
        state.ledger.add(1.5).await;
        let (_, _) = state
            .correlator
            .allocate("edit", "src/config.js", RiskLevel::Medium, 0.5)
            .await;
        let (_, _) = state
            .correlator
            .allocate("run", "ls", RiskLevel::Low, 0.5)
            .await;
        state.correlator.resolve(1, Decision::Deny).await;
        let (_observer, _rx) = state.registry.register().await;

        let (status, body) = get_json(router(state), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credits"], 1.5);
        assert_eq!(body["pending"], json!([0]));
        assert_eq!(body["observers"], 1);
        assert_eq!(
            body["stats"],
            json!({"allocated": 2, "approved": 0, "denied": 1, "expired": 0})
        );
    }

    #[tokio::test]
    async fn observer_text_resolves_pending_request() {
        let state = state();
        let (request, handle) = state
            .correlator
            .allocate("delete", "old.log", RiskLevel::High, 0.5)
            .await;

        handle_observer_text(&state, 1, "not json").await;
        handle_observer_text(&state, 1, r#"{"type":"response","id":42,"decision":"approve"}"#).await;
        assert_eq!(state.correlator.pending_ids().await, vec![request.id]);

        let text = format!(r#"{{"type":"response","id":{},"decision":"approve"}}"#, request.id);
        handle_observer_text(&state, 1, &text).await;
        assert!(handle.wait().await.is_approved());
    }

    #[tokio::test]
    async fn bind_failure_names_the_address() {
        let first = ObserverServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), state())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        match ObserverServer::bind(addr, state()).await {
            Err(BrokerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("second bind on {addr} succeeded"),
        }
    }
}
