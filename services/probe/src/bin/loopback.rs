// Producer and consumer in one process, reading the same clock.
use anyhow::Result;
use clap::Parser;
use probe::app;
use probe::config::{ProbeArgs, ProbeConfig};
use probe::observability;

#[derive(Parser, Debug)]
#[command(
    name = "probe-loopback",
    about = "Publish probes and report their transit latency from one process"
)]
struct Cli {
    #[command(flatten)]
    probe: ProbeArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let metrics_handle = observability::init_observability("probe-loopback")?;
    let config = ProbeConfig::resolve(&cli.probe, "probe-loopback")?;
    observability::spawn_metrics(metrics_handle, config.metrics_bind);

    tracing::info!(
        transport = ?config.transport,
        topic = %config.topic,
        "probe loopback started"
    );
    let (emitted, consumed) = app::run_loopback(&config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    tracing::info!(
        emitted = emitted.emitted,
        received = consumed.received,
        last_position = ?consumed.last_position,
        "probe loopback stopped"
    );
    Ok(())
}
