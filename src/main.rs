use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_relay::{
    config::{Config, Provider},
    routes,
    services::{
        completions::{self, CompletionsClient, Upstream},
        credential::{CachedCredential, default_credential},
        page::IndexPage,
    },
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::from_env();
    init_tracing(&cfg);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        provider = ?cfg.provider,
        "chat-relay starting"
    );
    for setting in cfg.missing_settings() {
        warn!(setting, "not configured, chat requests will fail until it is set");
    }

    let index_page = IndexPage::load(&cfg.template_dir).await?;

    let http = completions::http_client(cfg.timeout).context("building HTTP client")?;
    let upstream = match cfg.provider {
        Provider::Azure => {
            let chain = default_credential().context("building identity HTTP client")?;
            info!(credentials = ?chain.names(), "using Azure credential chain");
            Upstream::azure(&cfg, Arc::new(CachedCredential::new(chain)))
        }
        Provider::OpenAi => Upstream::openai(&cfg),
    };
    let completions = CompletionsClient::new(http, upstream, cfg.system_prompt.clone());

    let state = Arc::new(AppState::new(completions, index_page));
    let app = routes::create_router().with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(%addr, "chat relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("chat-relay stopped");
    Ok(())
}

fn init_tracing(cfg: &Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        cfg.log_level.parse::<EnvFilter>().unwrap_or_else(|e| {
            eprintln!(
                "WARN: LOG_LEVEL='{}' is not a valid tracing filter ({e}); falling back to 'info'",
                cfg.log_level
            );
            EnvFilter::new("info")
        })
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
