//! Salon API server.
//!
//! Usage:
//!   salon_api bootstrap --store Shibuya --name Admin --email a@b.c --password ...
//!   salon_api serve       # default; listens on BIND_ADDR
//!
//! Configuration comes from the environment (and `.env`); see `AppConfig`.

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use salon_api::config::AppConfig;
use salon_api::models::{Record, Store, User};
use salon_api::password::PasswordHasher;
use salon_api::rest::MIN_PASSWORD_LEN;
use salon_api::storage::Storage;
use salon_api::token::Role;
use salon_api::{create_router, AppState};

#[derive(Parser)]
#[command(name = "salon_api", version, about = "Multi-tenant salon back office API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server.
    Serve,
    /// Create a store and its first admin account.
    Bootstrap {
        #[arg(long)]
        store: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
}

/// Stdout for humans, daily-rolling JSON files for machines.
fn init_tracing(config: &AppConfig) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "salon_api.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,salon_api=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    let storage = Storage::open(&config.data_dir)?;
    info!(data_dir = %config.data_dir, "storage opened");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(storage, config).await,
        Command::Bootstrap {
            store,
            name,
            email,
            password,
        } => bootstrap(&storage, &config, store, name, email, password),
    }
}

async fn serve(storage: Storage, config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::new(storage, &config)?;
    let app = create_router(state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, debug = config.debug, "REST server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

fn bootstrap(
    storage: &Storage,
    config: &AppConfig,
    store_name: String,
    name: String,
    email: String,
    password: String,
) -> Result<(), Box<dyn std::error::Error>> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!("password must be at least {MIN_PASSWORD_LEN} characters").into());
    }
    let hasher = PasswordHasher::new(config.hash_params);

    let store = storage.create(Store {
        record: Record::default(),
        name: store_name,
    })?;
    let admin = storage.create_user(User {
        record: Record::default(),
        name,
        email,
        password_hash: hasher.hash(&password)?,
        role: Role::Admin,
        store_id: store.record.id,
    })?;
    storage.flush()?;

    info!(
        store_id = store.record.id,
        user_id = admin.record.id,
        "bootstrap complete"
    );
    println!(
        "created store {} ({}) and admin {} ({})",
        store.record.id, store.name, admin.record.id, admin.email
    );
    Ok(())
}
