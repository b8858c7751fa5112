//! Settlement saga service
//!
//! ```text
//! SettlementCreated ─▶ Intake ─▶ FeeEngine ─▶ SettlementReady ─▶ WalletCrediting
//!                                                                     │
//!                     Reconciler ◀── SettlementCompleted / SettlementFailed
//! ```
//!
//! Runs every consumer over the in-process bus, plus the recovery worker
//! and (optionally) the bulk intake scanner, until Ctrl-C.
//!
//! Input comes from the bulk scanner (`confirmed_purchases_tb`) or, for
//! local runs, from the `seed` section of the config.

use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};

use settlement_saga::config::{AppConfig, SeedConfig};
use settlement_saga::db::Database;
use settlement_saga::events::{
    Consumer, DeadLetterSink, Dispatcher, EventHandler, EventPublisher, InMemoryBus,
    InMemoryDeadLetters, PgDeadLetterStore, Topic,
};
use settlement_saga::settlement::{
    BulkIntakeScanner, ConfirmedPurchaseSource, FeeEngine, InMemoryPurchaseSource,
    InMemorySettlementLedger, PgPurchaseSource, PgSettlementLedger, RecoveryWorker,
    SettlementIntake, SettlementLedger, SettlementReconciler,
};
use settlement_saga::wallet::{
    InMemoryWalletLedger, PgWalletLedger, WalletCreditingWorker, WalletLedger,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

struct Stores {
    settlements: Arc<dyn SettlementLedger>,
    wallets: Arc<dyn WalletLedger>,
    dead_letters: Arc<dyn DeadLetterSink>,
    purchases: Arc<dyn ConfirmedPurchaseSource>,
}

async fn open_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    let Some(url) = &config.postgres_url else {
        warn!("No postgres_url configured, using in-memory ledgers (single instance only)");
        return Ok(Stores {
            settlements: Arc::new(InMemorySettlementLedger::new()),
            wallets: Arc::new(InMemoryWalletLedger::new()),
            dead_letters: Arc::new(InMemoryDeadLetters::new()),
            purchases: Arc::new(InMemoryPurchaseSource::new()),
        });
    };

    let db = Database::connect(url)
        .await
        .context("connect to PostgreSQL")?;
    db.health_check().await.context("PostgreSQL health check")?;
    db.migrate().await.context("apply schema")?;

    let pool = db.pool().clone();
    Ok(Stores {
        settlements: Arc::new(PgSettlementLedger::new(pool.clone())),
        wallets: Arc::new(PgWalletLedger::new(pool.clone())),
        dead_letters: Arc::new(PgDeadLetterStore::new(pool.clone())),
        purchases: Arc::new(PgPurchaseSource::new(pool)),
    })
}

async fn apply_seed(
    seed: &SeedConfig,
    wallets: &dyn WalletLedger,
    bus: &InMemoryBus,
) -> anyhow::Result<()> {
    for user_id in &seed.accounts {
        wallets
            .open_account(user_id)
            .await
            .with_context(|| format!("open seed account {}", user_id))?;
    }
    for purchase in &seed.purchases {
        bus.publish(purchase.clone().into())
            .await
            .with_context(|| format!("publish seed purchase {}", purchase.source_transaction_id))?;
    }
    if !seed.accounts.is_empty() || !seed.purchases.is_empty() {
        info!(
            accounts = seed.accounts.len(),
            purchases = seed.purchases.len(),
            "Applied startup seed"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("load config for {}", env))?;
    let _log_guard = settlement_saga::logging::init_logging(&config);

    info!(env = %env, git_hash = env!("GIT_HASH"), "Starting settlement saga");

    let stores = open_stores(&config).await?;
    let bus = Arc::new(InMemoryBus::new(config.consumer.channel_capacity));

    let fee_engine = Arc::new(FeeEngine::new(
        stores.settlements.clone(),
        config.fees.clone(),
        bus.clone(),
    ));
    let intake = Arc::new(SettlementIntake::new(
        stores.settlements.clone(),
        fee_engine.clone(),
    ));
    let crediting = Arc::new(WalletCreditingWorker::new(stores.wallets.clone(), bus.clone()));
    let reconciler = Arc::new(SettlementReconciler::new(stores.settlements.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumers = Vec::new();

    let handlers: [(Topic, Arc<dyn EventHandler>); 3] = [
        (Topic::SettlementCreated, intake.clone()),
        (Topic::SettlementReady, crediting),
        (Topic::SettlementOutcome, reconciler),
    ];
    for (topic, handler) in handlers {
        let subscription = bus.subscribe(topic)?;
        let dispatcher = Dispatcher::new(
            handler,
            bus.clone(),
            stores.dead_letters.clone(),
            config.retry.clone(),
        );
        let consumer = Consumer::new(subscription, dispatcher, config.consumer.max_in_flight);
        consumers.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
    }

    apply_seed(&config.seed, stores.wallets.as_ref(), &bus).await?;

    let recovery = RecoveryWorker::new(
        stores.settlements.clone(),
        fee_engine,
        config.recovery.clone(),
    );
    let recovery_rx = shutdown_rx.clone();
    let recovery_task = tokio::spawn(async move { recovery.run(recovery_rx).await });

    let bulk_task = if config.bulk_scan.enabled {
        let scanner = BulkIntakeScanner::new(stores.purchases.clone(), intake, config.bulk_scan.clone());
        let bulk_rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { scanner.run(bulk_rx).await }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await.context("listen for Ctrl-C")?;
    info!("Shutdown requested");
    shutdown_tx.send(true).ok();

    for result in join_all(consumers).await {
        match result {
            Ok(stats) => info!(?stats, "Consumer finished"),
            Err(e) => error!(error = %e, "Consumer task failed"),
        }
    }
    if let Err(e) = recovery_task.await {
        error!(error = %e, "Recovery worker task failed");
    }
    if let Some(handle) = bulk_task
        && let Err(e) = handle.await
    {
        error!(error = %e, "Bulk scanner task failed");
    }

    info!("Settlement saga stopped");
    Ok(())
}
