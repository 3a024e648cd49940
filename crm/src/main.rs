use std::sync::Arc;

use clap::{Parser, Subcommand};
use crm::api::{AppState, router};
use crm::config::{AppConfig, redact_db_url};
use crm::schema::{Registry, ReconciliationReport, SchemaConfig, reconcile_schema};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "crm", about = "CRM backend with startup schema reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the schema, then serve the API (default)
    Serve,
    /// Reconcile the schema once and print the report as JSON
    Reconcile {
        /// Log and record the statements that would run without executing them
        #[arg(long, action = clap::ArgAction::SetTrue)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init structured logging (respects RUST_LOG; defaults to info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    let registry = match Registry::canonical() {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(database = %redact_db_url(&config.database_url), "connecting to database");
    let db = Database::connect(&config.database_url).await?;

    match cli.command {
        None | Some(Commands::Serve) => {
            let report = startup(&db, &config, &registry, config.schema.clone()).await;
            serve(&config, report).await?;
        }
        Some(Commands::Reconcile { dry_run }) => {
            let schema = SchemaConfig {
                dry_run,
                ..config.schema.clone()
            };
            let report = startup(&db, &config, &registry, schema).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Migrations, then reconciliation. Any fatal error ends the process here,
/// before a listener is bound.
async fn startup(
    db: &DatabaseConnection,
    config: &AppConfig,
    registry: &Registry,
    schema: SchemaConfig,
) -> ReconciliationReport {
    if schema.dry_run {
        tracing::info!("dry run: skipping migrations");
    } else {
        if let Err(e) = Migrator::up(db, None).await {
            tracing::error!(error = %e, "migrations failed");
            std::process::exit(1);
        }
        tracing::info!("migrations applied");
    }

    match reconcile_schema(db, &config.database_url, registry, &schema).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "schema reconciliation failed; refusing to start");
            std::process::exit(1);
        }
    }
}

async fn serve(
    config: &AppConfig,
    report: ReconciliationReport,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState {
        report: Arc::new(report),
    };

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "API online");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown requested");
        signal.cancel();
    });

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("server stopped");
    Ok(())
}
