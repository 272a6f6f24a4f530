use clap::Parser;
use conductor::ConductorArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Frames own stdout; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    ConductorArgs::parse().run().await
}
