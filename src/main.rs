use clap::Parser;
use orrery::application::bridge::{Bridge, BridgeConfig};
use orrery::application::credentials::CredentialResolver;
use orrery::application::endpoints::ConnectionRegistry;
use orrery::application::persistence::MemoryTurnStore;
use orrery::config::AppConfig;
use orrery::infrastructure::model::OpenAiProvider;
use orrery::infrastructure::server::{serve, AppState};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orrery", version, about = "Tool-aggregating chat bridge over MCP endpoints")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("orrery=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    info!(
        model = %config.model,
        endpoints = config.endpoints.len(),
        "starting"
    );

    let provider = Arc::new(OpenAiProvider::new(&config.provider));
    let registry = Arc::new(
        ConnectionRegistry::new(
            config.endpoints.clone(),
            Duration::from_secs(config.handshake_timeout_secs),
        )
        .with_call_timeout(Duration::from_secs(config.call_timeout_secs)),
    );
    let resolver = Arc::new(CredentialResolver::new(config.key_service_url.clone()));
    let store = Arc::new(MemoryTurnStore::new());

    let bridge = Arc::new(Bridge::new(
        provider,
        registry.clone(),
        resolver.clone(),
        store,
        BridgeConfig {
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_steps: config.max_steps,
            budget: Duration::from_secs(config.budget_secs),
        },
    ));

    serve(
        AppState {
            bridge,
            registry,
            resolver,
        },
        cli.listen,
    )
    .await?;
    Ok(())
}
