use std::net::SocketAddr;
use std::sync::Arc;

use gateway::apps::DirectoryCatalog;
use gateway::auth::{ApiKeys, TokenManager};
use gateway::config::GatewayConfig;
use gateway::extensions::{ExtensionCatalog, builtin};
use gateway::http::{FileBackend, GatewayState, router};
use gateway::store::{MemoryStore, SharedStore};
use gateway::time::SystemTimeSource;
use gateway::{ApiRegistry, RegistryOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: server_root={}, apps_directory={}, listen_port={}",
        config.server_root.display(),
        config.apps_directory.display(),
        config.listen_port
    );

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());

    let tokens = TokenManager::with_config_file(
        Arc::clone(&store),
        Arc::new(SystemTimeSource),
        config.conf_dir().join("tokenmanager.json"),
    );
    let api_keys = match ApiKeys::load_optional(&config.conf_dir().join("apikeys.json")) {
        Ok(keys) => keys,
        Err(e) => {
            tracing::error!("Failed to load API keys: {e}");
            std::process::exit(1);
        }
    };

    let mut extensions = ExtensionCatalog::new();
    builtin::register_core(&mut extensions, &tokens, api_keys);

    // The core registry file must exist and parse; anything else is fatal.
    let registry = match ApiRegistry::initialize(
        RegistryOptions::new(&config.server_root),
        store,
        &DirectoryCatalog::new(&config.apps_directory),
        &extensions,
    )
    .await
    {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!("Failed to initialize API registry: {e}");
            std::process::exit(1);
        }
    };

    let state = GatewayState {
        registry: Arc::new(registry),
        backend: Arc::new(FileBackend),
        request_timeout: config.request_timeout,
    };
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.listen_port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind: {e}");
            std::process::exit(1);
        });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap_or_else(|e| {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    });
}
