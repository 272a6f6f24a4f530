//! Pipeline components and their I/O actors.
//!
//! Each component gets two actor tasks: one reading frames into the
//! central queue, one draining its outbound mailbox onto the byte
//! stream. The router only ever touches the mailbox sender, so all
//! blocking I/O stays out of the routing loop.

use futures::channel::mpsc;
use futures::{SinkExt as _, StreamExt as _};
use pacp::connect::{BoxedReader, BoxedWriter};
use pacp::frame::{FrameReader, FrameWriter};
use pacp::{CommandConnector, Conduit, ConnectError, Connector as _, Message, StreamConnector};

use crate::queue::{ConductorEvent, QueueSender};

/// How to reach one component of the pipeline.
pub enum ComponentProvider {
    /// Spawn the command as a child process speaking frames on stdio.
    Command(String),
    /// Adopt an existing byte-stream pair (tests, in-process embeddings).
    Stream(StreamConnector),
}

impl ComponentProvider {
    pub(crate) fn describe(&self) -> String {
        match self {
            ComponentProvider::Command(command) => command.clone(),
            ComponentProvider::Stream(_) => "<stream>".to_string(),
        }
    }

    pub(crate) async fn connect(self) -> Result<Conduit, ConnectError> {
        match self {
            ComponentProvider::Command(command) => CommandConnector::new(command).connect().await,
            ComponentProvider::Stream(connector) => connector.connect().await,
        }
    }
}

/// Reads frames from a component until its channel ends, pushing each
/// into the central queue. EOF and failures surface as `ChannelDown`.
pub(crate) async fn read_actor(
    hop: usize,
    mut reader: FrameReader<BoxedReader>,
    mut queue: QueueSender,
) {
    loop {
        match reader.read().await {
            Some(Ok(message)) => {
                if queue
                    .send(ConductorEvent::Frame { hop, message })
                    .await
                    .is_err()
                {
                    // Router is gone; nothing left to report to.
                    return;
                }
            }
            Some(Err(error)) => {
                let _ = queue
                    .send(ConductorEvent::ChannelDown {
                        hop,
                        error: Some(error),
                    })
                    .await;
                return;
            }
            None => {
                let _ = queue
                    .send(ConductorEvent::ChannelDown { hop, error: None })
                    .await;
                return;
            }
        }
    }
}

/// Drains a component's outbound mailbox onto its byte stream. The
/// mailbox closing is the normal way this actor ends; a write failure
/// is reported as a channel fault.
pub(crate) async fn write_actor(
    hop: usize,
    mut writer: FrameWriter<BoxedWriter>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    mut queue: QueueSender,
) {
    while let Some(message) = outgoing.next().await {
        if let Err(error) = writer.write(&message).await {
            let _ = queue
                .send(ConductorEvent::ChannelDown {
                    hop,
                    error: Some(error),
                })
                .await;
            return;
        }
    }
}
