//! # Conductor: P/ACP pipeline orchestrator
//!
//! The conductor sits between a client (an editor or orchestration
//! script) and an agent, optionally interposing an ordered chain of
//! proxy components:
//!
//! ```text
//! Client <-frames-> [conductor] <-frames-> Proxy 0 ... Proxy n <-frames-> Agent
//! ```
//!
//! Every component talks to the conductor over one bidirectional frame
//! channel. The conductor:
//!
//! 1. Funnels every inbound frame through the central message queue and
//!    routes it from a single task, preserving submission order at
//!    every hop.
//! 2. Rewrites request ids so each hop has its own monotonically
//!    increasing integer id space, restoring the original id (and its
//!    JSON type) when the matching response returns.
//! 3. Performs the initialize handshake: each proxy is offered
//!    `params._meta.proxy = true` and must acknowledge with
//!    `result._meta.proxy = true`; refusal fails the initialize and
//!    tears the pipeline down.
//! 4. Wraps forward traffic delivered to proxies in
//!    `_proxy/successor/*` envelopes so each proxy only reasons about
//!    its immediate successor; the client and the agent only ever see
//!    unwrapped frames.
//! 5. Consumes the reserved `_mcp/*` control methods itself, and runs
//!    the MCP HTTP bridge that rewrites `acp:` tool-server URLs in
//!    `session/new` before the agent sees them.
//!
//! Any component channel closing or producing an unparseable frame is
//! fatal and tears the whole pipeline down; the one exception is a
//! clean end-of-stream on the client channel, which is the normal
//! shutdown path.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Context as _;
use futures::channel::mpsc;
use futures::{AsyncRead, AsyncWrite, StreamExt as _};
use pacp::frame::{ErrorObject, FrameReader, FrameWriter, Id, Message, Request, Response, ResponseOutcome};
use pacp::mcp::{McpConnectParams, McpDisconnectParams, McpMessageParams};
use pacp::{Cleanup, FrameError, mcp, proxy};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bridge;
use crate::component::{ComponentProvider, read_actor, write_actor};
use crate::control::McpControlHandler;
use crate::mcp_server::{ToolServer, ToolServerRegistry};
use crate::queue::{ConductorEvent, ControlCall, QueueReceiver, QueueSender, message_queue};
use crate::session::SessionRegistry;

/// Hop index of the client channel.
const CLIENT: usize = 0;

/// The conductor. Configure the pipeline and any tool servers, then
/// [`run`](Self::run) it over the client's byte streams.
pub struct Conductor {
    components: Vec<ComponentProvider>,
    tools: ToolServerRegistry,
}

impl Conductor {
    /// `components` are ordered client side first; the last one is the
    /// agent, everything before it is a proxy.
    pub fn new(components: Vec<ComponentProvider>) -> Self {
        Self {
            components,
            tools: ToolServerRegistry::default(),
        }
    }

    /// Registers a tool server and returns its `acp:` URL, for the
    /// client to reference from `session/new.mcpServers`.
    pub fn register_tool_server(&mut self, server: ToolServer) -> String {
        self.tools.register(server)
    }

    /// Runs the pipeline until the client hangs up (`Ok`) or a
    /// component fault tears it down (`Err`). Must be driven inside a
    /// `tokio::task::LocalSet`; `ConductorArgs::run` sets one up.
    pub async fn run(
        self,
        outgoing_bytes: impl AsyncWrite + Send + 'static,
        incoming_bytes: impl AsyncRead + Send + 'static,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.components.is_empty(),
            "must have at least one component"
        );
        info!(
            component_count = self.components.len(),
            "starting conductor pipeline"
        );

        let (queue_tx, mut queue_rx) = message_queue();
        let mut hops = Vec::with_capacity(self.components.len() + 1);

        hops.push(spawn_hop(
            CLIENT,
            "client".to_string(),
            HopKind::Client,
            FrameReader::new(Box::pin(incoming_bytes)),
            FrameWriter::new(Box::pin(outgoing_bytes)),
            Cleanup::None,
            queue_tx.clone(),
        ));

        let last = self.components.len();
        for (offset, provider) in self.components.into_iter().enumerate() {
            let index = offset + 1;
            let kind = if index == last {
                HopKind::Agent
            } else {
                HopKind::Proxy
            };
            let name = provider.describe();
            info!(index, component = %name, is_agent = matches!(kind, HopKind::Agent), "connecting component");
            let conduit = provider
                .connect()
                .await
                .with_context(|| format!("failed to connect component `{name}`"))?;
            hops.push(spawn_hop(
                index,
                name,
                kind,
                conduit.reader,
                conduit.writer,
                conduit.cleanup,
                queue_tx.clone(),
            ));
        }

        let mut router = Router {
            hops,
            control: McpControlHandler::new(self.tools),
            sessions: SessionRegistry::new(),
            handshake: HandshakeState::AwaitingInitialize,
            deferred: VecDeque::new(),
            queue_tx,
        };

        let result = router.serve(&mut queue_rx).await;
        router.shutdown().await;
        result
    }
}

enum HopKind {
    Client,
    Proxy,
    Agent,
}

/// One endpoint of the pipeline, as the router sees it.
struct Hop {
    name: String,
    kind: HopKind,
    outgoing: mpsc::UnboundedSender<Message>,
    writer_task: tokio::task::JoinHandle<()>,
    /// Monotonic id source for requests delivered to this hop.
    next_id: i64,
    /// Live requests delivered to this hop, keyed by the minted id.
    pending: HashMap<i64, PendingRequest>,
    cleanup: Cleanup,
}

impl Hop {
    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn send(&self, message: Message) {
        // A closed mailbox means the write actor died; the matching
        // ChannelDown event is already on its way to the router.
        let _ = self.outgoing.unbounded_send(message);
    }
}

struct PendingRequest {
    origin: usize,
    inbound_id: Option<Id>,
    kind: PendingKind,
}

enum PendingKind {
    Forwarded,
    /// An initialize leg minted by the router during the handshake.
    Handshake,
    /// A session/new delivered to the agent. `session_key` links the
    /// response to parked bridge listeners, when any were created.
    SessionNew { session_key: Option<String> },
}

enum HandshakeState {
    AwaitingInitialize,
    /// initialize delivered to `hop`; its response drives the next leg.
    Offering {
        hop: usize,
        client_id: Id,
        original_params: Option<Value>,
    },
    Complete,
}

struct Router {
    hops: Vec<Hop>,
    control: McpControlHandler,
    sessions: SessionRegistry,
    handshake: HandshakeState,
    /// Client frames that arrived before the handshake completed.
    deferred: VecDeque<Request>,
    queue_tx: QueueSender,
}

impl Router {
    async fn serve(&mut self, queue_rx: &mut QueueReceiver) -> anyhow::Result<()> {
        while let Some(event) = queue_rx.next().await {
            match event {
                ConductorEvent::Frame { hop, message } => self.on_frame(hop, message).await?,
                ConductorEvent::ChannelDown { hop, error } => {
                    return self.on_channel_down(hop, error);
                }
                ConductorEvent::Control(call) => self.on_control_call(call),
            }
        }
        Ok(())
    }

    async fn on_frame(&mut self, from: usize, message: Message) -> anyhow::Result<()> {
        match message {
            Message::Response(response) => self.on_response(from, response).await,
            Message::Request(request) => {
                let method = request.method.as_str();
                if mcp::is_control_namespace(method) {
                    self.on_control_frame(from, request);
                    Ok(())
                } else if from == CLIENT && !matches!(self.handshake, HandshakeState::Complete) {
                    self.on_pre_handshake_client_frame(request)
                } else if request.is_notification() {
                    self.route_notification(from, request);
                    Ok(())
                } else {
                    self.route_request(from, request).await;
                    Ok(())
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Initialize handshake
    // ------------------------------------------------------------------

    fn on_pre_handshake_client_frame(&mut self, request: Request) -> anyhow::Result<()> {
        match &self.handshake {
            HandshakeState::AwaitingInitialize => {
                if request.is_notification() {
                    self.deferred.push_back(request);
                    return Ok(());
                }
                if request.method != "initialize" {
                    debug!(method = %request.method, "request before initialize");
                    let error =
                        ErrorObject::invalid_request("initialize must be the first request");
                    self.respond(CLIENT, Response::error(error, request.id));
                    return Ok(());
                }
                let Some(client_id) = request.id.clone() else {
                    return Ok(());
                };
                info!("starting initialize handshake");
                self.handshake = HandshakeState::Offering {
                    hop: 1,
                    client_id,
                    original_params: request.params.clone(),
                };
                self.send_handshake_leg(1, request.params);
                Ok(())
            }
            HandshakeState::Offering { .. } => {
                self.deferred.push_back(request);
                Ok(())
            }
            HandshakeState::Complete => Ok(()),
        }
    }

    fn send_handshake_leg(&mut self, hop: usize, original_params: Option<Value>) {
        let params = match self.hops[hop].kind {
            // The agent receives the client's params unmodified.
            HopKind::Agent => original_params,
            _ => proxy::offer_proxy(original_params),
        };
        let outbound_id = self.hops[hop].allocate_id();
        self.hops[hop].pending.insert(
            outbound_id,
            PendingRequest {
                origin: CLIENT,
                inbound_id: None,
                kind: PendingKind::Handshake,
            },
        );
        debug!(target = %self.hops[hop].name, outbound_id, "delivering initialize");
        self.hops[hop].send(Message::Request(Request::new(
            "initialize",
            params,
            outbound_id,
        )));
    }

    async fn on_handshake_response(
        &mut self,
        from: usize,
        response: Response,
    ) -> anyhow::Result<()> {
        let HandshakeState::Offering {
            hop,
            client_id,
            original_params,
        } = &self.handshake
        else {
            warn!("initialize response outside the handshake; dropping");
            return Ok(());
        };
        debug_assert_eq!(*hop, from);
        let client_id = client_id.clone();
        let original_params = original_params.clone();

        match self.hops[from].kind {
            HopKind::Proxy => {
                let accepted = match &response.outcome {
                    ResponseOutcome::Success { result } => proxy::acknowledged_proxy(result),
                    ResponseOutcome::Failure { .. } => false,
                };
                if !accepted {
                    let name = self.hops[from].name.clone();
                    error!(proxy = %name, "proxy did not acknowledge the proxy handshake");
                    let message = format!(
                        "proxy `{name}` did not acknowledge the proxy handshake \
                         (missing result._meta.proxy)"
                    );
                    self.respond(
                        CLIENT,
                        Response::error(
                            ErrorObject::invalid_request(message.clone()),
                            Some(client_id),
                        ),
                    );
                    anyhow::bail!(message);
                }
                info!(proxy = %self.hops[from].name, "proxy accepted the handshake");
                let next = from + 1;
                self.handshake = HandshakeState::Offering {
                    hop: next,
                    client_id,
                    original_params: original_params.clone(),
                };
                self.send_handshake_leg(next, original_params);
                Ok(())
            }
            HopKind::Agent => {
                info!("initialize handshake complete");
                self.respond(CLIENT, response.with_id(Some(client_id)));
                self.handshake = HandshakeState::Complete;
                self.replay_deferred().await;
                Ok(())
            }
            HopKind::Client => {
                warn!("handshake response attributed to the client hop; dropping");
                Ok(())
            }
        }
    }

    async fn replay_deferred(&mut self) {
        while let Some(request) = self.deferred.pop_front() {
            if request.is_notification() {
                self.route_notification(CLIENT, request);
            } else {
                self.route_request(CLIENT, request).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Request / notification routing
    // ------------------------------------------------------------------

    async fn route_request(&mut self, from: usize, request: Request) {
        let Some(inbound_id) = request.id.clone() else {
            return;
        };
        match self.hops[from].kind {
            HopKind::Client => {
                if proxy::is_envelope(&request.method) {
                    self.respond_reserved(from, &request.method, inbound_id);
                    return;
                }
                self.deliver_forward_request(CLIENT, request.method, request.params, inbound_id)
                    .await;
            }
            HopKind::Agent => {
                if proxy::is_envelope(&request.method) {
                    self.respond_reserved(from, &request.method, inbound_id);
                    return;
                }
                self.deliver_backward_request(from, request.method, request.params, inbound_id);
            }
            HopKind::Proxy => {
                if request.method == proxy::SUCCESSOR_REQUEST {
                    self.deliver_envelope_request(from, request.params, inbound_id)
                        .await;
                } else if request.method == proxy::SUCCESSOR_NOTIFICATION {
                    self.respond(
                        from,
                        Response::error(
                            ErrorObject::invalid_request(
                                "_proxy/successor/notification must be a notification",
                            ),
                            Some(inbound_id),
                        ),
                    );
                } else {
                    // Raw requests from a proxy travel backward.
                    self.deliver_backward_request(from, request.method, request.params, inbound_id);
                }
            }
        }
    }

    /// Client-originated request to the first hop: wrapped for a proxy,
    /// raw for the agent.
    async fn deliver_forward_request(
        &mut self,
        origin: usize,
        method: String,
        params: Option<Value>,
        inbound_id: Id,
    ) {
        let to = 1;
        match self.hops[to].kind {
            HopKind::Proxy => {
                let outbound_id = self.hops[to].allocate_id();
                self.hops[to].pending.insert(
                    outbound_id,
                    PendingRequest {
                        origin,
                        inbound_id: Some(inbound_id),
                        kind: PendingKind::Forwarded,
                    },
                );
                debug!(method, target = %self.hops[to].name, outbound_id, "forwarding request, wrapped for proxy");
                self.hops[to].send(Message::Request(proxy::wrap_request(
                    method,
                    params,
                    outbound_id,
                )));
            }
            _ => self.deliver_to_agent(origin, method, params, inbound_id).await,
        }
    }

    /// A `_proxy/successor/request` envelope from proxy `from`: passed
    /// through opaquely to the next proxy, unwrapped for the agent.
    async fn deliver_envelope_request(
        &mut self,
        from: usize,
        params: Option<Value>,
        inbound_id: Id,
    ) {
        let to = from + 1;
        match self.hops[to].kind {
            HopKind::Proxy => {
                let outbound_id = self.hops[to].allocate_id();
                self.hops[to].pending.insert(
                    outbound_id,
                    PendingRequest {
                        origin: from,
                        inbound_id: Some(inbound_id),
                        kind: PendingKind::Forwarded,
                    },
                );
                debug!(target = %self.hops[to].name, outbound_id, "passing successor envelope through");
                self.hops[to].send(Message::Request(Request::new(
                    proxy::SUCCESSOR_REQUEST,
                    params,
                    outbound_id,
                )));
            }
            HopKind::Agent => match proxy::unwrap_envelope(params) {
                Ok(envelope) => {
                    self.deliver_to_agent(from, envelope.method, envelope.params, inbound_id)
                        .await;
                }
                Err(error) => {
                    self.respond(from, Response::error(error, Some(inbound_id)));
                }
            },
            HopKind::Client => {
                warn!("successor envelope addressed to the client hop; dropping");
            }
        }
    }

    /// Final forward hop. `session/new` is intercepted here so that no
    /// `acp:` URL ever reaches the agent.
    async fn deliver_to_agent(
        &mut self,
        origin: usize,
        method: String,
        mut params: Option<Value>,
        inbound_id: Id,
    ) {
        let agent = self.hops.len() - 1;
        let mut kind = PendingKind::Forwarded;

        if method == "session/new" {
            kind = PendingKind::SessionNew { session_key: None };
            if let Some(params_value) = params.as_mut() {
                match bridge::prepare_session(params_value, self.queue_tx.clone()).await {
                    Ok(Some((session_key, entry))) => {
                        info!(
                            session_key,
                            listeners = entry.listeners.len(),
                            "intercepted acp: tool servers in session/new"
                        );
                        self.sessions.insert(session_key.clone(), entry);
                        kind = PendingKind::SessionNew {
                            session_key: Some(session_key),
                        };
                    }
                    Ok(None) => {}
                    Err(bridge_error) => {
                        warn!(error = %bridge_error, "failed to set up MCP bridge");
                        self.respond(
                            origin,
                            Response::error(
                                ErrorObject::internal_error(format!(
                                    "failed to set up MCP bridge: {bridge_error}"
                                )),
                                Some(inbound_id),
                            ),
                        );
                        return;
                    }
                }
            }
        }

        let outbound_id = self.hops[agent].allocate_id();
        self.hops[agent].pending.insert(
            outbound_id,
            PendingRequest {
                origin,
                inbound_id: Some(inbound_id),
                kind,
            },
        );
        debug!(method, outbound_id, "delivering request to agent");
        self.hops[agent].send(Message::Request(Request::new(method, params, outbound_id)));
    }

    /// Backward-direction request (agent- or proxy-originated), always
    /// delivered raw.
    fn deliver_backward_request(
        &mut self,
        from: usize,
        method: String,
        params: Option<Value>,
        inbound_id: Id,
    ) {
        let to = from - 1;
        let outbound_id = self.hops[to].allocate_id();
        self.hops[to].pending.insert(
            outbound_id,
            PendingRequest {
                origin: from,
                inbound_id: Some(inbound_id),
                kind: PendingKind::Forwarded,
            },
        );
        debug!(method, target = %self.hops[to].name, outbound_id, "delivering backward request");
        self.hops[to].send(Message::Request(Request::new(method, params, outbound_id)));
    }

    fn route_notification(&mut self, from: usize, notification: Request) {
        let Request { method, params, .. } = notification;
        match self.hops[from].kind {
            HopKind::Client => {
                if proxy::is_envelope(&method) {
                    warn!(method, "successor envelope from the client; dropping");
                    return;
                }
                let to = 1;
                let message = match self.hops[to].kind {
                    HopKind::Proxy => proxy::wrap_notification(method, params),
                    _ => Request::notification(method, params),
                };
                self.hops[to].send(Message::Request(message));
            }
            HopKind::Agent => {
                if proxy::is_envelope(&method) {
                    warn!(method, "successor envelope from the agent; dropping");
                    return;
                }
                let to = from - 1;
                debug!(target = %self.hops[to].name, "delivering backward notification");
                self.hops[to].send(Message::Request(Request::notification(method, params)));
            }
            HopKind::Proxy => {
                if method == proxy::SUCCESSOR_NOTIFICATION {
                    let to = from + 1;
                    match self.hops[to].kind {
                        HopKind::Proxy => {
                            self.hops[to]
                                .send(Message::Request(Request::notification(method, params)));
                        }
                        HopKind::Agent => match proxy::unwrap_envelope(params) {
                            Ok(envelope) => {
                                debug!(method = envelope.method, "delivering notification to agent");
                                self.hops[to].send(Message::Request(Request::notification(
                                    envelope.method,
                                    envelope.params,
                                )));
                            }
                            Err(error) => {
                                warn!(%error, "malformed successor notification envelope; dropping");
                            }
                        },
                        HopKind::Client => {
                            warn!("successor envelope addressed to the client hop; dropping");
                        }
                    }
                } else if method == proxy::SUCCESSOR_REQUEST {
                    warn!("request envelope without an id; dropping");
                } else {
                    let to = from - 1;
                    debug!(method, target = %self.hops[to].name, "delivering backward notification");
                    self.hops[to].send(Message::Request(Request::notification(method, params)));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------

    async fn on_response(&mut self, from: usize, response: Response) -> anyhow::Result<()> {
        let Some(Id::Number(outbound_id)) = response.id.clone() else {
            warn!(hop = %self.hops[from].name, id = ?response.id, "response with an id we never minted; dropping");
            return Ok(());
        };
        let Some(pending) = self.hops[from].pending.remove(&outbound_id) else {
            warn!(hop = %self.hops[from].name, outbound_id, "response for an unknown request; dropping");
            return Ok(());
        };

        match pending.kind {
            PendingKind::Handshake => self.on_handshake_response(from, response).await,
            PendingKind::SessionNew { session_key } => {
                self.on_session_new_response(&response, session_key);
                self.forward_response(response, pending.origin, pending.inbound_id);
                Ok(())
            }
            PendingKind::Forwarded => {
                self.forward_response(response, pending.origin, pending.inbound_id);
                Ok(())
            }
        }
    }

    /// Responses are forwarded verbatim; only the id is restored.
    fn forward_response(&mut self, response: Response, origin: usize, inbound_id: Option<Id>) {
        debug!(target = %self.hops[origin].name, id = ?inbound_id, "forwarding response");
        self.hops[origin].send(Message::Response(response.with_id(inbound_id)));
    }

    fn on_session_new_response(&mut self, response: &Response, session_key: Option<String>) {
        let Some(key) = session_key else {
            return;
        };
        match &response.outcome {
            ResponseOutcome::Success { result } => {
                match result.get("sessionId").and_then(Value::as_str) {
                    Some(session_id) => {
                        info!(session_key = key, session_id, "publishing session id to bridge listeners");
                        self.sessions.publish(&key, session_id);
                    }
                    None => {
                        warn!(session_key = key, "session/new response carries no sessionId; cancelling bridge listeners");
                        self.sessions.cancel(&key);
                    }
                }
            }
            ResponseOutcome::Failure { error } => {
                warn!(session_key = key, code = error.code, "session/new failed; cancelling bridge listeners");
                self.sessions.cancel(&key);
            }
        }
    }

    // ------------------------------------------------------------------
    // Control channel (`_mcp/*`)
    // ------------------------------------------------------------------

    fn on_control_frame(&mut self, from: usize, request: Request) {
        let method = request.method.clone();
        debug!(method, from = %self.hops[from].name, "control-channel frame");

        if mcp::is_bare_control_method(&method) {
            // Reserved spelling: consumed, answered, never forwarded.
            match request.id {
                Some(id) => self.respond(
                    from,
                    Response::error(
                        ErrorObject::invalid_request(format!(
                            "unknown control method `{method}`; extension methods use the `_mcp/` prefix"
                        )),
                        Some(id),
                    ),
                ),
                None => warn!(method, "dropping bare-spelled control notification"),
            }
            return;
        }

        match method.as_str() {
            mcp::MCP_CONNECT => {
                let Some(id) = request.id else {
                    warn!("_mcp/connect requires an id; dropping");
                    return;
                };
                let response = match parse_params::<McpConnectParams>(request.params) {
                    Ok(params) => match self.control.connect(params, None) {
                        Ok(result) => match serde_json::to_value(&result) {
                            Ok(value) => Response::success(value, id),
                            Err(err) => Response::error(
                                ErrorObject::internal_error(err.to_string()),
                                Some(id),
                            ),
                        },
                        Err(error) => Response::error(error, Some(id)),
                    },
                    Err(error) => Response::error(error, Some(id)),
                };
                self.respond(from, response);
            }
            mcp::MCP_MESSAGE => self.on_control_message_frame(from, request),
            mcp::MCP_DISCONNECT => match parse_params::<McpDisconnectParams>(request.params) {
                Ok(params) => {
                    if !self.control.disconnect(&params) {
                        warn!(connection_id = %params.connection_id, "disconnect for an unknown connection");
                    }
                    if let Some(id) = request.id {
                        self.respond(from, Response::success(Value::Null, id));
                    }
                }
                Err(error) => {
                    if let Some(id) = request.id {
                        self.respond(from, Response::error(error, Some(id)));
                    }
                }
            },
            // Unknown methods in the reserved namespace are answered
            // locally, never forwarded.
            other => match request.id {
                Some(id) => self.respond(
                    from,
                    Response::error(ErrorObject::method_not_found(other), Some(id)),
                ),
                None => warn!(method = other, "dropping unknown control notification"),
            },
        }
    }

    fn on_control_message_frame(&mut self, from: usize, request: Request) {
        let id = request.id;
        let params = match parse_params::<McpMessageParams>(request.params) {
            Ok(params) => params,
            Err(error) => {
                if let Some(id) = id {
                    self.respond(from, Response::error(error, Some(id)));
                }
                return;
            }
        };

        match self.control.route_message(&params) {
            Ok((server, cx)) => {
                let McpMessageParams { method, params: payload, .. } = params;
                let outgoing = self.hops[from].outgoing.clone();
                tokio::task::spawn_local(async move {
                    let outcome = server.handle_method(&method, payload, cx).await;
                    if let Some(id) = id {
                        let response = match outcome {
                            Ok(result) => Response::success(result, id),
                            Err(error) => Response::error(error, Some(id)),
                        };
                        let _ = outgoing.unbounded_send(Message::Response(response));
                    }
                });
            }
            Err(error) => {
                if let Some(id) = id {
                    self.respond(from, Response::error(error, Some(id)));
                }
            }
        }
    }

    /// Bridge-synthesized control calls, answered over one-shot channels.
    fn on_control_call(&mut self, call: ControlCall) {
        match call {
            ControlCall::Connect {
                params,
                session_id,
                reply,
            } => {
                let _ = reply.send(self.control.connect(params, session_id));
            }
            ControlCall::Message { params, reply } => match self.control.route_message(&params) {
                Ok((server, cx)) => {
                    let McpMessageParams { method, params: payload, .. } = params;
                    tokio::task::spawn_local(async move {
                        let outcome = server.handle_method(&method, payload, cx).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(outcome);
                        }
                    });
                }
                Err(error) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(error));
                    }
                }
            },
            ControlCall::Disconnect { params } => {
                if !self.control.disconnect(&params) {
                    debug!(connection_id = %params.connection_id, "disconnect for an unknown connection");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Faults and shutdown
    // ------------------------------------------------------------------

    fn on_channel_down(&mut self, hop: usize, fault: Option<FrameError>) -> anyhow::Result<()> {
        let name = self.hops[hop].name.clone();
        match fault {
            None if hop == CLIENT => {
                info!("client channel closed; shutting down");
                Ok(())
            }
            None => {
                error!(component = %name, "component channel closed unexpectedly");
                anyhow::bail!("component `{name}` closed its channel")
            }
            Some(fault) => {
                error!(component = %name, error = %fault, "component channel failed");
                anyhow::bail!("component `{name}` channel failed: {fault}")
            }
        }
    }

    /// Tears everything down in one pass: bridge listeners, MCP
    /// connections, component channels and children. The client writer
    /// is drained so a final error response still reaches the client.
    async fn shutdown(mut self) {
        self.sessions.shutdown();
        self.control.clear_connections();

        let mut writer_tasks = Vec::new();
        for mut hop in self.hops.drain(..) {
            hop.cleanup.release();
            writer_tasks.push(hop.writer_task);
            drop(hop.outgoing);
        }
        for task in writer_tasks {
            let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
        }
    }

    // ------------------------------------------------------------------
    // Small helpers
    // ------------------------------------------------------------------

    fn respond(&mut self, hop: usize, response: Response) {
        self.hops[hop].send(Message::Response(response));
    }

    fn respond_reserved(&mut self, hop: usize, method: &str, id: Id) {
        self.respond(
            hop,
            Response::error(
                ErrorObject::invalid_request(format!("{method} is reserved for pipeline proxies")),
                Some(id),
            ),
        );
    }
}

fn spawn_hop(
    index: usize,
    name: String,
    kind: HopKind,
    reader: FrameReader<pacp::BoxedReader>,
    writer: FrameWriter<pacp::BoxedWriter>,
    cleanup: Cleanup,
    queue_tx: QueueSender,
) -> Hop {
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded();
    tokio::task::spawn_local(read_actor(index, reader, queue_tx.clone()));
    let writer_task = tokio::task::spawn_local(write_actor(index, writer, outgoing_rx, queue_tx));
    Hop {
        name,
        kind,
        outgoing: outgoing_tx,
        writer_task,
        next_id: 1,
        pending: HashMap::new(),
        cleanup,
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorObject> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|err| ErrorObject::invalid_params(err.to_string()))
}
