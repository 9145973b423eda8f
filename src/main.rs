use mimalloc::MiMalloc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cfg = tributary::config::Config::load()?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        database_url = %cfg.database_url,
        proxy = %cfg.proxy.as_ref().map(|u| u.as_str()).unwrap_or("<none>"),
        loglevel = %cfg.loglevel,
        "starting tributary"
    );

    let pool = tributary::db::connect(&cfg.database_url).await?;

    let Some(connector) = tributary::connector::RestConnector::from_config(&cfg.service)? else {
        info!("no service configured (set TRIBUTARY_SERVICE__NAME and TRIBUTARY_SERVICE__BASE_URL); nothing to sync");
        return Ok(());
    };

    let engine = tributary::orchestrator::SyncOrchestrator::from_config(pool, &cfg)?;
    let report = engine
        .run_sync(&connector, cfg.force_full_refresh)
        .await?;

    for (stream, count) in &report.stats {
        info!(stream = %stream, upserted = count, "stream synced");
    }
    for err in &report.errors {
        error!(error = %err, "stream failed");
    }
    info!(
        service = %report.service,
        success = report.success,
        partial = report.partial,
        api_calls = report.api_calls,
        elapsed_secs = report.elapsed_seconds,
        "sync finished"
    );

    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}
