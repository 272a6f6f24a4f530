//! Opening frame channels to pipeline components.
//!
//! A [`Connector`] produces one [`Conduit`]: the stream of inbound
//! frames, the outbound frame writer, and whatever needs releasing when
//! the channel is torn down. The conductor is agnostic to how the bytes
//! flow; child processes over stdio and in-process stream pairs are the
//! two shipped transports.

use std::pin::Pin;
use std::process::Stdio;

use futures::{AsyncRead, AsyncWrite};
use tokio_util::compat::{TokioAsyncReadCompatExt as _, TokioAsyncWriteCompatExt as _};

use crate::frame::{FrameReader, FrameWriter};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A live, framed, bidirectional channel to one component.
pub struct Conduit {
    pub reader: FrameReader<BoxedReader>,
    pub writer: FrameWriter<BoxedWriter>,
    pub cleanup: Cleanup,
}

/// Resources to release when a conduit is torn down.
pub enum Cleanup {
    None,
    Child(tokio::process::Child),
}

impl Cleanup {
    /// Releases the underlying resource. Killing an already-dead child
    /// is fine; the error is ignored.
    pub fn release(&mut self) {
        if let Cleanup::Child(child) = self {
            let _ = child.start_kill();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("empty component command")]
    EmptyCommand,
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` did not expose stdio pipes")]
    MissingStdio { command: String },
}

/// Opens one bidirectional frame channel to a component.
#[allow(async_fn_in_trait)]
pub trait Connector {
    async fn connect(self) -> Result<Conduit, ConnectError>;
}

/// Spawns a child process and frames its stdin/stdout. The command is
/// split on whitespace: first token is the program, the rest are
/// arguments. Stderr is inherited so component diagnostics stay visible.
pub struct CommandConnector {
    command: String,
}

impl CommandConnector {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Connector for CommandConnector {
    async fn connect(self) -> Result<Conduit, ConnectError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or(ConnectError::EmptyCommand)?;

        let mut child = tokio::process::Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConnectError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ConnectError::MissingStdio {
            command: self.command.clone(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ConnectError::MissingStdio {
            command: self.command.clone(),
        })?;

        tracing::debug!(command = %self.command, pid = ?child.id(), "spawned component");

        let reader: BoxedReader = Box::pin(stdout.compat());
        let writer: BoxedWriter = Box::pin(stdin.compat_write());
        Ok(Conduit {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            cleanup: Cleanup::Child(child),
        })
    }
}

/// Adopts an already-open byte-stream pair. This is how tests and
/// in-process embeddings attach components without spawning anything.
pub struct StreamConnector {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl StreamConnector {
    pub fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }

    /// From tokio I/O types (duplex halves, sockets).
    pub fn from_tokio(
        reader: impl tokio::io::AsyncRead + Send + 'static,
        writer: impl tokio::io::AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader.compat()),
            writer: Box::pin(writer.compat_write()),
        }
    }
}

impl Connector for StreamConnector {
    async fn connect(self) -> Result<Conduit, ConnectError> {
        Ok(Conduit {
            reader: FrameReader::new(self.reader),
            writer: FrameWriter::new(self.writer),
            cleanup: Cleanup::None,
        })
    }
}
