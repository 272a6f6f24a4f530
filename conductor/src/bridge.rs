//! MCP HTTP bridge.
//!
//! Makes `acp:` URLs invisible to the agent: for each such entry in a
//! `session/new` request the bridge binds an ephemeral listener on
//! `127.0.0.1`, rewrites the entry to an ordinary MCP-over-HTTP server,
//! and translates every incoming HTTP request into a control-channel
//! call. A listener serves no request until the router has published
//! the agent-assigned session id for it; early requests park on a watch
//! gate and cancellation poisons them with a 503.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::post;
use axum::{Json, Router};
use futures::SinkExt as _;
use futures::channel::oneshot;
use pacp::frame::{ErrorObject, Id, Message, Response};
use pacp::mcp::{self, McpConnectParams, McpDisconnectParams, McpMessageParams, ServerInfo};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::queue::{ConductorEvent, ControlCall, QueueSender};
use crate::session::SessionEntry;

/// Session-id publication state for one listener.
#[derive(Debug, Clone)]
enum SessionGate {
    Pending,
    Ready(String),
    Cancelled,
}

/// Handle the router keeps for each bound listener.
pub(crate) struct BridgeListenerHandle {
    pub acp_url: String,
    pub local_url: String,
    gate: watch::Sender<SessionGate>,
    connection: Arc<Mutex<BridgeConnection>>,
    queue: QueueSender,
}

impl BridgeListenerHandle {
    pub fn publish(&self, session_id: &str) {
        let _ = self.gate.send(SessionGate::Ready(session_id.to_string()));
    }

    /// Tears the listener down: unparks waiters with a 503, drains the
    /// HTTP server, and emits a best-effort `mcp/disconnect` for any
    /// connection the listener had opened.
    pub fn cancel(&self) {
        debug!(acp_url = %self.acp_url, local_url = %self.local_url, "cancelling bridge listener");
        let _ = self.gate.send(SessionGate::Cancelled);
        let connection = self.connection.clone();
        let mut queue = self.queue.clone();
        tokio::spawn(async move {
            let connection_id = connection.lock().await.connection_id.take();
            if let Some(connection_id) = connection_id {
                let _ = queue
                    .send(ConductorEvent::Control(ControlCall::Disconnect {
                        params: McpDisconnectParams { connection_id },
                    }))
                    .await;
            }
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum BridgeError {
    #[error("failed to bind bridge listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// Rewrites every `acp:` entry in `params.mcpServers`, binding one
/// listener per entry. Returns the minted session key and the registry
/// entry when at least one entry was intercepted.
pub(crate) async fn prepare_session(
    params: &mut Value,
    queue: QueueSender,
) -> Result<Option<(String, SessionEntry)>, BridgeError> {
    let Some(servers) = params.get_mut("mcpServers").and_then(Value::as_array_mut) else {
        return Ok(None);
    };

    let mut entry = SessionEntry {
        listeners: Vec::new(),
        url_map: HashMap::new(),
    };

    for server in servers.iter_mut() {
        let Some(url) = server.get("url").and_then(Value::as_str) else {
            continue;
        };
        if !mcp::is_acp_url(url) {
            continue;
        }
        let acp_url = url.to_string();
        let handle = bind_listener(acp_url.clone(), queue.clone()).await?;
        let local_url = handle.local_url.clone();
        server["url"] = Value::String(local_url.clone());
        server["type"] = Value::String("http".to_string());
        entry.url_map.insert(acp_url, local_url);
        entry.listeners.push(handle);
    }

    if entry.listeners.is_empty() {
        Ok(None)
    } else {
        Ok(Some((format!("session-key:{}", Uuid::new_v4()), entry)))
    }
}

#[derive(Clone)]
struct BridgeState {
    acp_url: String,
    control_tx: QueueSender,
    gate: watch::Receiver<SessionGate>,
    connection: Arc<Mutex<BridgeConnection>>,
}

/// The listener-scoped MCP connection. Opened lazily by the first POST,
/// closed when the listener is torn down.
#[derive(Default)]
struct BridgeConnection {
    connection_id: Option<String>,
    #[allow(dead_code)]
    server_info: Option<ServerInfo>,
}

async fn bind_listener(
    acp_url: String,
    queue: QueueSender,
) -> Result<BridgeListenerHandle, BridgeError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let local_url = format!("http://127.0.0.1:{port}");

    let (gate_tx, gate_rx) = watch::channel(SessionGate::Pending);
    let connection = Arc::new(Mutex::new(BridgeConnection::default()));

    let state = BridgeState {
        acp_url: acp_url.clone(),
        control_tx: queue.clone(),
        gate: gate_rx.clone(),
        connection: connection.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    let app = Router::new()
        .route("/", post(handle_post))
        .layer(cors)
        .with_state(state);

    let mut shutdown_gate = gate_rx;
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_gate
                .wait_for(|gate| matches!(gate, SessionGate::Cancelled))
                .await;
        });
        if let Err(error) = serve.await {
            warn!(%error, "bridge listener terminated abnormally");
        }
    });

    info!(acp_url, local_url, "bound MCP bridge listener");
    Ok(BridgeListenerHandle {
        acp_url,
        local_url,
        gate: gate_tx,
        connection,
        queue,
    })
}

async fn handle_post(State(state): State<BridgeState>, Json(body): Json<Value>) -> HttpResponse {
    let message: Message = match serde_json::from_value(body) {
        Ok(message) => message,
        Err(error) => {
            debug!(%error, "bridge received a non-JSON-RPC body");
            return (
                StatusCode::BAD_REQUEST,
                Json(Response::error(ErrorObject::parse_error(), None)),
            )
                .into_response();
        }
    };

    // Park until the router publishes the agent's session id.
    let session_id = match await_session(state.gate.clone()).await {
        Ok(session_id) => session_id,
        Err(()) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "bridge shut down before the session was established",
            )
                .into_response();
        }
    };

    // One in-flight request per connection: the lock is held across the
    // control-channel round trip, so concurrent posts queue here.
    let mut connection = state.connection.lock().await;

    let connection_id = match &connection.connection_id {
        Some(id) => id.clone(),
        None => match open_connection(&state, &mut connection, &session_id).await {
            Ok(id) => id,
            Err(response) => return response,
        },
    };

    match message {
        Message::Request(request) => match request.id.clone() {
            Some(id) => {
                dispatch_request(&state, connection_id, request.method, request.params, id).await
            }
            None => {
                // MCP notification: invoke and acknowledge without a body.
                let call = ControlCall::Message {
                    params: McpMessageParams {
                        connection_id,
                        method: request.method,
                        params: request.params,
                    },
                    reply: None,
                };
                let mut control_tx = state.control_tx.clone();
                if control_tx.send(ConductorEvent::Control(call)).await.is_err() {
                    return conductor_gone();
                }
                StatusCode::ACCEPTED.into_response()
            }
        },
        Message::Response(_) => {
            warn!("bridge received a response frame over HTTP; dropping");
            StatusCode::ACCEPTED.into_response()
        }
    }
}

async fn open_connection(
    state: &BridgeState,
    connection: &mut BridgeConnection,
    session_id: &str,
) -> Result<String, HttpResponse> {
    let minted = format!("mcp-connection:{}", Uuid::new_v4());
    let (reply_tx, reply_rx) = oneshot::channel();
    let call = ControlCall::Connect {
        params: McpConnectParams {
            connection_id: Some(minted),
            url: state.acp_url.clone(),
        },
        session_id: Some(session_id.to_string()),
        reply: reply_tx,
    };

    let mut control_tx = state.control_tx.clone();
    if control_tx.send(ConductorEvent::Control(call)).await.is_err() {
        return Err(conductor_gone());
    }

    match reply_rx.await {
        Ok(Ok(result)) => {
            debug!(
                connection_id = %result.connection_id,
                server = %result.server_info.name,
                "bridge connection opened"
            );
            connection.connection_id = Some(result.connection_id.clone());
            connection.server_info = Some(result.server_info);
            Ok(result.connection_id)
        }
        Ok(Err(error)) => Err((StatusCode::BAD_GATEWAY, error.message).into_response()),
        Err(_) => Err(conductor_gone()),
    }
}

async fn dispatch_request(
    state: &BridgeState,
    connection_id: String,
    method: String,
    params: Option<Value>,
    id: Id,
) -> HttpResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    let call = ControlCall::Message {
        params: McpMessageParams {
            connection_id,
            method,
            params,
        },
        reply: Some(reply_tx),
    };

    let mut control_tx = state.control_tx.clone();
    if control_tx.send(ConductorEvent::Control(call)).await.is_err() {
        return conductor_gone();
    }

    match reply_rx.await {
        Ok(Ok(result)) => (StatusCode::OK, Json(Response::success(result, id))).into_response(),
        Ok(Err(error)) => {
            (StatusCode::OK, Json(Response::error(error, Some(id)))).into_response()
        }
        Err(_) => conductor_gone(),
    }
}

fn conductor_gone() -> HttpResponse {
    (StatusCode::SERVICE_UNAVAILABLE, "conductor is shutting down").into_response()
}

async fn await_session(mut gate: watch::Receiver<SessionGate>) -> Result<String, ()> {
    let settled = gate
        .wait_for(|gate| !matches!(gate, SessionGate::Pending))
        .await;
    match settled {
        Ok(settled) => match &*settled {
            SessionGate::Ready(session_id) => Ok(session_id.clone()),
            _ => Err(()),
        },
        // Sender dropped: the router is gone.
        Err(_) => Err(()),
    }
}
