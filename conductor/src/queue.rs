//! The central message queue.
//!
//! Every frame the conductor forwards — and every control-channel call
//! the bridge synthesizes — enters this queue and is consumed by the
//! single router task, strictly in arrival order. The router never
//! emits a frame except while processing a dequeued event, which is
//! what makes the pipeline-wide ordering guarantee hold: two frames
//! submitted back-to-back by any component can never be reordered at
//! any downstream hop.

use futures::channel::{mpsc, oneshot};
use pacp::frame::ErrorObject;
use pacp::mcp::{McpConnectParams, McpConnectResult, McpDisconnectParams, McpMessageParams};
use pacp::{FrameError, Message};
use serde_json::Value;

const QUEUE_DEPTH: usize = 128; // chosen arbitrarily

/// Everything the router acts on.
pub(crate) enum ConductorEvent {
    /// A frame read from a component's channel.
    Frame { hop: usize, message: Message },
    /// A component channel ended: cleanly (`error: None`) or not.
    ChannelDown {
        hop: usize,
        error: Option<FrameError>,
    },
    /// A control-channel call synthesized by the MCP bridge.
    /// Wire-originated `_mcp/*` frames arrive as `Frame` events instead.
    Control(ControlCall),
}

pub(crate) enum ControlCall {
    Connect {
        params: McpConnectParams,
        /// The published session id, when the caller (the bridge) knows it.
        session_id: Option<String>,
        reply: oneshot::Sender<Result<McpConnectResult, ErrorObject>>,
    },
    Message {
        params: McpMessageParams,
        /// `None` for MCP notifications: the method is invoked and the
        /// outcome dropped.
        reply: Option<oneshot::Sender<Result<Value, ErrorObject>>>,
    },
    Disconnect {
        params: McpDisconnectParams,
    },
}

pub(crate) type QueueSender = mpsc::Sender<ConductorEvent>;
pub(crate) type QueueReceiver = mpsc::Receiver<ConductorEvent>;

pub(crate) fn message_queue() -> (QueueSender, QueueReceiver) {
    mpsc::channel(QUEUE_DEPTH)
}
