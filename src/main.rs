use tracing::info;
use tracing_subscriber::EnvFilter;
use viessmann_bridge::{sink::build_sinks, Bridge, Config, ViCareClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting viessmann_bridge");

    let config = Config::load(Config::path_from_env())?;
    let source = ViCareClient::new(
        config.viessmann.clone(),
        config.timezone,
        config.device_index,
        config.burner_count,
    );
    let sinks = build_sinks(&config.actions);

    let bridge = Bridge::new(Box::new(source), sinks, config.poll_interval());
    bridge
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Stopped viessmann_bridge");
    Ok(())
}
