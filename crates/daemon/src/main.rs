// holdfastd: lease accounting daemon entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use holdfast_daemon::backend::DiskBackend;
use holdfast_daemon::clock::SystemClock;
use holdfast_daemon::config::{self, DaemonConfig};
use holdfast_daemon::crawler::accounting::AccountingCrawler;
use holdfast_daemon::crawler::share_crawler::ShareCrawler;
use holdfast_daemon::store::lease_db::LeaseDb;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = DaemonConfig::load();
    let base_dir = config::global_dir().context("could not determine home directory")?;
    let db_path = config.db_path.clone().unwrap_or_else(|| base_dir.join("leases.db"));
    let shares_root = config.shares_root.clone().unwrap_or_else(|| base_dir.join("shares"));
    let statefile =
        config.statefile.clone().unwrap_or_else(|| base_dir.join("accounting_crawler.state"));

    let policy = config.expiration.build().context("invalid expiration policy")?;
    let db = LeaseDb::open(&db_path)
        .with_context(|| format!("failed to open lease database at `{}`", db_path.display()))?;
    info!(
        db = %db_path.display(),
        shares = %shares_root.display(),
        expiration_enabled = policy.is_enabled(),
        "lease database open"
    );

    let clock: Arc<SystemClock> = Arc::new(SystemClock);
    let delegate =
        AccountingCrawler::new(db, DiskBackend::new(&shares_root), policy, clock.clone());
    let crawler =
        ShareCrawler::new(delegate, clock, config.crawler.to_crawler_config(), &statefile)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = ctrl_c_tx.send(());
    });

    info!("accounting crawler starting");
    crawler.run(shutdown_rx).await
}
