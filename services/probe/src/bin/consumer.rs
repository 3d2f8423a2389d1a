// Subscribes to the probe topic and reports windowed transit latency.
use anyhow::Result;
use clap::Parser;
use probe::app;
use probe::config::{ProbeArgs, ProbeConfig};
use probe::observability;

#[derive(Parser, Debug)]
#[command(name = "probe-consumer", about = "Report broker transit latency")]
struct Cli {
    #[command(flatten)]
    probe: ProbeArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let metrics_handle = observability::init_observability("probe-consumer")?;
    let config = ProbeConfig::resolve(&cli.probe, "probe-consumer")?;
    observability::spawn_metrics(metrics_handle, config.metrics_bind);

    let summary = app::run_consumer_loop(&config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    tracing::info!(
        received = summary.received,
        transport_errors = summary.transport_errors,
        last_position = ?summary.last_position,
        "probe consumer stopped"
    );
    Ok(())
}
