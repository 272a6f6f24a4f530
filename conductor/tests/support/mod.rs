//! Shared harness: in-memory peers speaking raw frames to the
//! conductor, standing in for the client, proxies, and the agent.

#![allow(dead_code)]

use std::time::Duration;

use conductor::{ComponentProvider, Conductor};
use pacp::StreamConnector;
use pacp::connect::{BoxedReader, BoxedWriter};
use pacp::frame::{FrameReader, FrameWriter, Message};
use serde_json::{Value, json};
use tokio::io::{DuplexStream, duplex};
use tokio::time::timeout;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// One end of a conductor connection, driven by the test.
pub struct TestPeer {
    reader: FrameReader<BoxedReader>,
    writer: FrameWriter<BoxedWriter>,
}

impl TestPeer {
    pub fn new(read: DuplexStream, write: DuplexStream) -> Self {
        Self {
            reader: FrameReader::new(Box::pin(read.compat())),
            writer: FrameWriter::new(Box::pin(write.compat_write())),
        }
    }

    pub async fn send(&mut self, frame: Value) {
        let message: Message = serde_json::from_value(frame).expect("test frame should be valid");
        self.writer
            .write(&message)
            .await
            .expect("send should succeed");
    }

    pub async fn recv(&mut self) -> Value {
        let message = timeout(RECV_TIMEOUT, self.reader.read())
            .await
            .expect("timed out waiting for a frame")
            .expect("channel closed while waiting for a frame")
            .expect("peer sent an invalid frame");
        serde_json::to_value(&message).expect("frames serialize")
    }

    /// Waits for the conductor to close this channel.
    pub async fn recv_closed(&mut self) {
        let next = timeout(RECV_TIMEOUT, self.reader.read())
            .await
            .expect("timed out waiting for the channel to close");
        assert!(next.is_none(), "expected channel close, got {next:?}");
    }
}

/// The client peer plus the byte streams to hand to `Conductor::run`.
pub fn client_pipes() -> (TestPeer, DuplexStream, DuplexStream) {
    let (peer_out, conductor_in) = duplex(4096);
    let (conductor_out, peer_in) = duplex(4096);
    (TestPeer::new(peer_in, peer_out), conductor_out, conductor_in)
}

/// A mock component peer plus its provider for the pipeline.
pub fn component_pipes() -> (TestPeer, ComponentProvider) {
    let (component_out, conductor_reads) = duplex(4096);
    let (conductor_writes, component_in) = duplex(4096);
    let provider = ComponentProvider::Stream(StreamConnector::from_tokio(
        conductor_reads,
        conductor_writes,
    ));
    (TestPeer::new(component_in, component_out), provider)
}

pub fn spawn_conductor(
    conductor: Conductor,
    conductor_out: DuplexStream,
    conductor_in: DuplexStream,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    tokio::task::spawn_local(conductor.run(conductor_out.compat_write(), conductor_in.compat()))
}

/// A proxy that acknowledges the handshake and forwards every successor
/// envelope untouched, recording the methods it observed. Runs until
/// its channel closes.
pub async fn transparent_proxy(mut peer: TestPeer, observed: tokio::sync::mpsc::UnboundedSender<Value>) {
    // Offset distinguishing the proxy's own outbound ids from the
    // conductor-minted ids it responds to.
    const FORWARD_BASE: i64 = 1000;

    loop {
        let frame = match timeout(RECV_TIMEOUT, peer.reader.read()).await {
            Ok(Some(Ok(message))) => serde_json::to_value(&message).expect("frames serialize"),
            Ok(Some(Err(err))) => panic!("proxy received an invalid frame: {err}"),
            Ok(None) | Err(_) => return,
        };
        let _ = observed.send(frame.clone());

        if frame["method"] == json!("initialize") {
            let id = frame["id"].clone();
            peer.send(json!({
                "jsonrpc": "2.0",
                "result": {"_meta": {"proxy": true}},
                "id": id
            }))
            .await;
        } else if frame["method"] == json!("_proxy/successor/request") {
            let forwarded_id = FORWARD_BASE + frame["id"].as_i64().expect("conductor mints integer ids");
            peer.send(json!({
                "jsonrpc": "2.0",
                "id": forwarded_id,
                "method": "_proxy/successor/request",
                "params": frame["params"],
            }))
            .await;
        } else if frame["method"] == json!("_proxy/successor/notification") {
            peer.send(json!({
                "jsonrpc": "2.0",
                "method": "_proxy/successor/notification",
                "params": frame["params"],
            }))
            .await;
        } else if frame.get("method").is_none() {
            // A response to one of our forwarded requests: map it back
            // to the id the conductor used with us.
            let id = frame["id"].as_i64().expect("responses carry our integer ids") - FORWARD_BASE;
            let mut reply = frame.clone();
            reply["id"] = json!(id);
            let message: Message =
                serde_json::from_value(reply).expect("test frame should be valid");
            peer.writer.write(&message).await.expect("send should succeed");
        }
    }
}
