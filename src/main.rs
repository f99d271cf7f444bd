use std::sync::Arc;

use anyhow::Context;

use bounce_relay::channels::{ImapConnector, SmtpMailer};
use bounce_relay::config::BounceConfig;
use bounce_relay::pipeline::scheduler::parse_schedule;
use bounce_relay::pipeline::{BounceProcessor, BounceWorker, ProcessorDeps, spawn_bounce_worker};
use bounce_relay::status::status_routes;
use bounce_relay::store::{JsonDealLedger, JsonStateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BounceConfig::from_env().context("loading configuration")?;

    eprintln!("📬 Bounce Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {}@{}:{}", config.imap.user, config.imap.host, config.imap.port);
    eprintln!("   SMTP: {}:{}", config.smtp.host, config.smtp.port);

    let deals = Arc::new(JsonDealLedger::new(config.deals_path.clone()));
    let store = Arc::new(JsonStateStore::new(config.state_path.clone()));
    eprintln!("   State: {}", store.path().display());
    eprintln!("   Deals: {}", deals.path().display());
    eprintln!("   Senders: {}", config.processor.senders.len());

    let deps = ProcessorDeps {
        mailbox: Arc::new(ImapConnector::new(config.imap.clone())),
        transport: Arc::new(SmtpMailer::new(config.smtp.clone())),
        deals,
        store,
    };
    let processor = Arc::new(BounceProcessor::new(deps, config.processor.clone()));

    if config.run_once {
        let report = processor.run().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.is_success() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let schedule = parse_schedule(&config.schedule)?;
    let worker = Arc::new(BounceWorker::new(Arc::clone(&processor), &config.schedule));

    if let Some(port) = config.status_port {
        let app = status_routes(Arc::clone(&worker));
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding status port {port}"))?;
        eprintln!("   Status: http://0.0.0.0:{port}/status");
        tokio::spawn(async move {
            tracing::info!(port, "Status server started");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Status server stopped: {e}");
            }
        });
    }

    eprintln!("   Schedule: {}\n", config.schedule);
    let handle = spawn_bounce_worker(worker, schedule);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for any running pass to finish");
    handle.shutdown().await;

    Ok(())
}
