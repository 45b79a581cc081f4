use arraystore_config::CONFIG;
use arraystore_pool::{serve, WorkerState};
use tokio::io::{BufReader, BufWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol, logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| CONFIG.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!(pid = std::process::id(), "arraystore worker starting");
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = BufWriter::with_capacity(1024 * 1024, tokio::io::stdout());

    let mut state = WorkerState::default();
    let result = serve(stdin, stdout, &mut state).await;
    state.shutdown();
    result?;
    Ok(())
}
