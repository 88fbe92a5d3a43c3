use frontdoor::config::{Config, DEFAULT_CONFIG_FILE};
use frontdoor::handoff::launch;
use frontdoor::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frontdoor=debug".parse().expect("valid log directive")),
        )
        .init();
    install_panic_hook();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let mut config = Config::load_or_default(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;

    match config_path {
        Some(ref path) => info!(path = %path.display(), "Configuration loaded"),
        None if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() => {
            info!(path = DEFAULT_CONFIG_FILE, "Configuration loaded")
        }
        None => info!("Using built-in configuration"),
    }

    print_startup_banner(&config);

    let launched = launch(config).await?;
    info!(addr = %launched.local_addr(), "Accepting connections");

    wait_for_signal().await?;

    launched.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// Route panics from any task through tracing before the default hook runs
fn install_panic_hook() {
    static PANIC_HOOK_INIT: OnceLock<()> = OnceLock::new();
    PANIC_HOOK_INIT.get_or_init(|| {
        let previous_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            let location = panic_info
                .location()
                .map(|loc| format!("{}:{}", loc.file(), loc.line()))
                .unwrap_or_else(|| "<unknown>".to_string());
            let payload = if let Some(message) = panic_info.payload().downcast_ref::<&str>() {
                (*message).to_string()
            } else if let Some(message) = panic_info.payload().downcast_ref::<String>() {
                message.clone()
            } else {
                "<non-string panic payload>".to_string()
            };
            error!(target: "frontdoor::panic", %location, %payload, "Task panicked");
            previous_hook(panic_info);
        }));
    });
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting front door");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        health_path = %config.server.health_path,
        static_dir = %config.server.static_dir,
        placeholder = ?config.server.placeholder,
        "Server configuration"
    );
    info!(
        request_timeout_secs = config.server.request_timeout_secs,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Request handling settings"
    );
    info!(
        max_restarts = config.defaults.max_restarts,
        restart_cooldown_ms = config.defaults.restart_cooldown_ms,
        startup_probe_attempts = config.defaults.startup_probe_attempts,
        keepalive_interval_secs = config.defaults.keepalive_interval_secs,
        "Backend defaults"
    );
    for (name, backend) in &config.backends {
        info!(
            backend = %name,
            port = backend.port,
            base_path = %backend.base_path,
            supervised = backend.is_supervised(),
            "Configured backend"
        );
    }
    info!(
        model = %config.chat.model,
        api_key_set = config.chat.api_key.is_some(),
        "Chat endpoint"
    );
}
