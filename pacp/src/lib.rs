//! Proxied ACP (P/ACP) protocol support.
//!
//! P/ACP extends the Agent Client Protocol so that a chain of proxy
//! components can be spliced between a client and an agent. This crate
//! holds the pieces every participant shares:
//!
//! - the newline-delimited JSON-RPC 2.0 frame codec ([`frame`]),
//! - the connector abstraction for opening a frame channel to a
//!   component ([`connect`]),
//! - the `_proxy/successor/*` envelopes and the initialize-time proxy
//!   handshake metadata ([`proxy`]),
//! - the `_mcp/*` extension methods that tunnel MCP over the control
//!   channel ([`mcp`]).
//!
//! The conductor binary lives in the `conductor` crate; this crate is
//! deliberately policy-free so that proxies and test harnesses can use
//! the same building blocks.

pub mod connect;
pub mod frame;
pub mod mcp;
pub mod proxy;

pub use connect::{
    BoxedReader, BoxedWriter, Cleanup, CommandConnector, Conduit, ConnectError, Connector,
    StreamConnector,
};
pub use frame::{
    ErrorObject, FrameError, FrameReader, FrameWriter, Id, Message, Request, Response,
    ResponseOutcome,
};
