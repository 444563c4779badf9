// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowtide DB administrative command-line interface.
//!
//! Provides the operational entry points around the persistence core:
//! - `init`: run database migrations
//! - `quota-update`: run one quota reconciliation pass
//! - `watch`: run reconciliation passes periodically until interrupted

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::watch;
use tracing::{error, info};

use flowtide_db::config::Config;
use flowtide_db::migrations;
use flowtide_db::model::ResourceType;
use flowtide_db::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use flowtide_db::sampler::StoreSampler;
use flowtide_db::updater::QuotaUpdater;

#[derive(Parser)]
#[command(name = "flowtide-db", about = "Workflow persistence and accounting core", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the database schema.
    Init,
    /// Run one resource-usage reconciliation pass.
    QuotaUpdate {
        /// Resource types to reconcile.
        #[arg(long, value_enum, default_value_t = ResourceArg::Both)]
        resource: ResourceArg,
        /// Reconcile every subject, bypassing the update policy.
        #[arg(long)]
        force: bool,
        /// Log per-subject reconciliation detail.
        #[arg(long)]
        verbose: bool,
    },
    /// Run reconciliation passes on the configured interval until
    /// interrupted.
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum ResourceArg {
    Cpu,
    Disk,
    Both,
}

impl ResourceArg {
    fn resources(self) -> Vec<ResourceType> {
        match self {
            ResourceArg::Cpu => vec![ResourceType::Cpu],
            ResourceArg::Disk => vec![ResourceType::Disk],
            ResourceArg::Both => ResourceType::ALL.to_vec(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = match &cli.command {
        Command::QuotaUpdate { verbose: true, .. } => "flowtide_db=debug",
        _ => "flowtide_db=info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse().unwrap()),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        pool_size = config.pool_size,
        update_interval_secs = config.update_interval.as_secs(),
        "Configuration loaded"
    );

    let persistence = connect(&config).await?;

    let healthy = persistence.health_check_db().await?;
    info!(healthy, "Database health check passed");

    match cli.command {
        Command::Init => {
            // Migrations already ran during connect; report and exit.
            info!("Database schema initialized");
        }
        Command::QuotaUpdate {
            resource, force, ..
        } => {
            let sampler = Arc::new(StoreSampler::new(persistence.clone()));
            let mut updater = QuotaUpdater::new(
                persistence,
                sampler,
                config.health_bands,
                config.update_policy,
            );
            let report = updater.run_pass(&resource.resources(), force).await?;
            info!(
                subjects = report.subjects_total,
                processed = report.processed,
                failed = report.failed,
                "Quota update finished"
            );
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
        Command::Watch => {
            let sampler = Arc::new(StoreSampler::new(persistence.clone()));
            let mut updater = QuotaUpdater::new(
                persistence,
                sampler,
                config.health_bands,
                config.update_policy,
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let resources = config.update_resources.clone();
            let interval = config.update_interval;
            let updater_handle = tokio::spawn(async move {
                updater.run_periodic(interval, shutdown_rx, &resources).await;
            });

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");
            let _ = shutdown_tx.send(true);
            updater_handle.await?;
            info!("Shutdown complete");
        }
    }

    Ok(())
}

/// Connect to the configured store and run migrations.
async fn connect(config: &Config) -> Result<Arc<dyn Persistence>> {
    if config.database_url.starts_with("sqlite") {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.database_url)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}
