use anyhow::Result;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

mod accounts;
mod adapter;
mod auth;
mod cache;
mod config;
mod converters;
mod dispatcher;
mod error;
mod metrics;
mod middleware;
mod models;
mod resolver;
mod routes;
mod streaming;
mod thinking_parser;
mod tokenizer;

use accounts::{Account, AccountStore, FileAccountStore};
use adapter::KiroAdapter;
use dispatcher::AccountPoolDispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and missing required values)
    if config::needs_interactive_setup() {
        let interactive_config = config::run_interactive_setup()?;

        // Set environment variables from interactive config so Config::load() can use them
        std::env::set_var("PROXY_API_KEY", &interactive_config.proxy_api_key);
        std::env::set_var("KIRO_CLI_DB_FILE", &interactive_config.kiro_cli_db_file);
        std::env::set_var("KIRO_REGION", &interactive_config.kiro_region);
        std::env::set_var("SERVER_PORT", &interactive_config.server_port);
    }

    // Load configuration first (for log level)
    let config = config::Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 Kiro Gateway starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );
    tracing::debug!("Debug mode: {:?}", config.debug_mode);

    // Build the account pool: either a directory of per-account credential
    // pairs, or (legacy) a single kiro-cli SQLite database imported as a
    // one-account pool. Neither path touches the network — accounts are
    // refreshed lazily on first dispatch.
    let store: Arc<dyn AccountStore> = Arc::new(load_account_store(&config).await?);
    let account_count = store.snapshot().len();
    if account_count == 0 {
        tracing::warn!(
            "No usable Kiro accounts loaded. The gateway will start but every \
             request will fail with 503 until accounts are added via the admin API."
        );
    } else {
        tracing::info!("✅ Loaded {} Kiro account(s) into the pool", account_count);
    }

    let adapter = Arc::new(KiroAdapter::new(
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
    ));
    tracing::info!("✅ Kiro adapter initialized with per-account connection pooling");

    let dispatcher = Arc::new(AccountPoolDispatcher::new(
        store.clone(),
        config.account_cooldown_ms,
        config.quota_reset_utc,
    ));
    tracing::info!("✅ Account pool dispatcher initialized");

    // Model cache: no model list endpoint on the Kiro side is part of the
    // core contract, so the cache is seeded once from the known canonical
    // model table rather than fetched per-account at startup.
    let model_cache = cache::ModelCache::new(3600);
    add_known_models(&model_cache);
    tracing::info!(
        "✅ Loaded {} known Kiro model IDs",
        model_cache.get_all_model_ids().len()
    );

    let resolver = resolver::ModelResolver::new(model_cache.clone(), std::collections::HashMap::new());
    tracing::info!("✅ Model resolver initialized");

    let metrics = Arc::new(metrics::MetricsCollector::new());
    tracing::info!("✅ Metrics collector initialized");

    let app_state = routes::AppState {
        proxy_api_key: Arc::new(RwLock::new(config.proxy_api_key.clone())),
        admin_proxy_settings: Arc::new(RwLock::new(routes::AdminProxySettings {
            enabled: true,
            port: config.server_port,
        })),
        model_cache: model_cache.clone(),
        resolver,
        config: Arc::new(config.clone()),
        metrics,
        store,
        adapter,
        dispatcher,
        usage_cache: Arc::new(dashmap::DashMap::new()),
    };

    // Build the application with routes and middleware
    let app = build_app(app_state);

    // Bind to configured host and port
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // Print startup banner
    print_startup_banner(&config);

    // Start server with graceful shutdown
    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Server shutdown complete");

    Ok(())
}

/// Builds the account pool's backing store. `KIRO_ACCOUNTS_DIR` takes
/// priority; if unset, a single `KIRO_CLI_DB_FILE` SQLite database is
/// imported as a one-account pool for backward compatibility with the
/// single-account deployment mode.
async fn load_account_store(config: &config::Config) -> Result<FileAccountStore> {
    if let Some(dir) = &config.kiro_accounts_dir {
        return FileAccountStore::load_from_dir(dir).await;
    }

    let store = FileAccountStore::new(PathBuf::from("."));

    if let Some(db_file) = &config.kiro_cli_db_file {
        match auth::credentials::load_from_sqlite(db_file) {
            Ok(credentials) => {
                let account = Account::new(
                    "default".to_string(),
                    "default".to_string(),
                    credentials,
                );
                tracing::info!(
                    "Imported single account from {} (legacy KIRO_CLI_DB_FILE mode)",
                    db_file.display()
                );
                store.insert(account);
            }
            Err(e) => {
                tracing::error!(
                    "❌ Failed to load credentials from {}: {}",
                    db_file.display(),
                    e
                );
            }
        }
    }

    Ok(store)
}

/// Known Kiro model IDs, seeded at startup so `/v1/models` and the resolver
/// have a pass-through-free table even before any account-specific usage
/// data is fetched. Mirrors the canonical mapping in the request translator.
fn add_known_models(cache: &cache::ModelCache) {
    let known_models = vec![
        ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
        ("claude-opus-4-5", "claude-opus-4.5"),
        ("claude-opus-4-1", "claude-opus-4.1"),
        ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
        ("claude-haiku-4-5", "claude-haiku-4.5"),
        (
            "claude-3-7-sonnet",
            "CLAUDE_3_7_SONNET_20250219_V1_0",
        ),
        (
            "claude-3-5-sonnet-20241022",
            "CLAUDE_3_5_SONNET_20241022_V2_0",
        ),
        (
            "claude-3-5-sonnet-20240620",
            "CLAUDE_3_5_SONNET_20240620_V1_0",
        ),
        (
            "claude-3-5-haiku-20241022",
            "CLAUDE_3_5_HAIKU_20241022_V1_0",
        ),
        ("claude-3-opus-20240229", "CLAUDE_3_OPUS_20240229_V1_0"),
        ("claude-3-sonnet-20240229", "CLAUDE_3_SONNET_20240229_V1_0"),
        ("claude-3-haiku-20240307", "CLAUDE_3_HAIKU_20240307_V1_0"),
        ("amazonq-claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
    ];

    for (display_name, internal_id) in known_models {
        cache.add_hidden_model(display_name, internal_id);
    }
}

/// Build the application with all routes and middleware
fn build_app(state: routes::AppState) -> axum::Router {
    use axum::Router;

    let health_routes = routes::health_routes();
    let openai_routes = routes::openai_routes(state.clone());
    let anthropic_routes = routes::anthropic_routes(state.clone());
    let admin_routes = routes::admin_routes(state.clone());

    Router::new()
        .merge(health_routes)
        .merge(openai_routes)
        .merge(anthropic_routes)
        .merge(admin_routes)
        // Apply middleware stack: CORS → Debug → (Auth is per-route)
        .layer(middleware::cors_layer())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::debug_middleware,
        ))
}

/// Print startup banner
fn print_startup_banner(config: &config::Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║              🚀 Kiro Gateway - Rust Edition              ║
║                                                           ║
║  OpenAI & Anthropic compatible proxy for Kiro API        ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Region:      {}", config.kiro_region);
    println!("  Debug Mode:  {:?}", config.debug_mode);
    println!("  Log Level:   {}", config.log_level);
    println!(
        "  Fake Reasoning: {} (max_tokens: {})",
        if config.fake_reasoning_enabled {
            "enabled"
        } else {
            "disabled"
        },
        config.fake_reasoning_max_tokens
    );
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
