pub mod component;
pub mod conductor;
pub mod mcp_server;

mod bridge;
mod control;
mod queue;
mod session;


pub use component::ComponentProvider;
pub use conductor::Conductor;
pub use mcp_server::{ToolContext, ToolDef, ToolHandler, ToolServer};

use clap::Parser;
use tokio_util::compat::{TokioAsyncReadCompatExt as _, TokioAsyncWriteCompatExt as _};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct ConductorArgs {
    /// Component commands to chain, client side first; the last one is
    /// the agent.
    #[arg(required = true)]
    pub components: Vec<String>,
}

impl ConductorArgs {
    pub async fn run(self) -> anyhow::Result<()> {
        let components = self
            .components
            .into_iter()
            .map(ComponentProvider::Command)
            .collect();
        let conductor = Conductor::new(components);

        let stdout = tokio::io::stdout();
        let stdin = tokio::io::stdin();
        tokio::task::LocalSet::new()
            .run_until(conductor.run(stdout.compat_write(), stdin.compat()))
            .await
    }
}
