// Publishes the clearing sentinel, then one timestamp probe per tick.
use anyhow::Result;
use clap::Parser;
use probe::app;
use probe::config::{ProbeArgs, ProbeConfig};
use probe::observability;

#[derive(Parser, Debug)]
#[command(name = "probe-producer", about = "Publish transit-latency probes")]
struct Cli {
    #[command(flatten)]
    probe: ProbeArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let metrics_handle = observability::init_observability("probe-producer")?;
    let config = ProbeConfig::resolve(&cli.probe, "probe-producer")?;
    observability::spawn_metrics(metrics_handle, config.metrics_bind);

    tracing::info!(
        topic = %config.topic,
        brokers = %config.brokers.join(","),
        tick_period_us = config.tick_period_us,
        unit = %config.time_unit,
        "probe producer started"
    );
    let summary = app::run_producer(&config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    tracing::info!(emitted = summary.emitted, "probe producer stopped");
    Ok(())
}
