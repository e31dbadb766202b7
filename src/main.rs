mod app;

use anyhow::Result;
use clap::Parser;
use routekit::config::Config;
use routekit::db::Database;
use routekit::dispatcher::install_panic_hook;
use routekit::server::ApiServer;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "routekit", version, about = "Demo HTTP+JSON API on the routekit core")]
struct Cli {
    /// Overrides BIND_ADDR
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Overrides DATABASE_PATH
    #[arg(long)]
    database: Option<String>,

    /// Overrides DEFAULT_TOKEN_QUOTA
    #[arg(long)]
    default_quota: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(quota) = cli.default_quota {
        config.default_token_quota = quota;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("routekit={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    install_panic_hook();

    tracing::info!(
        "Configuration: bind_addr={}, default_token_quota={}, database={}",
        config.bind_addr,
        config.default_token_quota,
        if config.database_path.is_empty() { "<temporary>" } else { &config.database_path }
    );

    // The demo always needs storage; fall back to a private temporary database.
    let db = match config.database_path() {
        Some(path) => Database::open(path),
        None => Database::open_temporary(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;
    app::migrate(&db).map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    let mut api = ApiServer::new(config);
    api.set_database(db);
    app::register(&mut api);

    api.build_or_exit()
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
