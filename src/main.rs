//! Duel Relay Server
//!
//! Pairs connections two at a time and relays moves between them.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duel_relay::{
    network::issue_token, GameServer, Identity, MemoryUserStore, ServerConfig, UserRecord,
    UserStore, INITIAL_RATING, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let default_level = if cfg!(feature = "debug-tracing") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Duel Relay Server v{}", VERSION);

    let config = ServerConfig::from_env();
    if !config.auth.is_configured() {
        warn!("AUTH_SECRET not set; every token will be rejected");
    }

    let store = Arc::new(MemoryUserStore::new());
    seed_users(&store, &config).await?;

    info!("Forfeit timeout: {:?}", config.rooms.forfeit_timeout);
    info!("Max connections: {}", config.max_connections);

    let server = GameServer::new(config, store);

    tokio::select! {
        result = server.run() => {
            result.context("server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            server.shutdown();
        }
    }

    Ok(())
}

/// Create accounts listed in `SEED_USERS`; log a token for each when
/// `ISSUE_DEV_TOKENS` is set.
async fn seed_users(store: &MemoryUserStore, config: &ServerConfig) -> anyhow::Result<()> {
    let Ok(seed) = std::env::var("SEED_USERS") else {
        return Ok(());
    };
    let issue_tokens = std::env::var("ISSUE_DEV_TOKENS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    for name in seed.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let identity = Identity::new(name);
        store
            .create_user(UserRecord::new(identity.clone(), INITIAL_RATING))
            .await
            .with_context(|| format!("seeding {}", identity))?;

        if issue_tokens {
            let token = issue_token(&identity, &config.auth)
                .with_context(|| format!("issuing token for {}", identity))?;
            info!("Dev token for {}: {}", identity, token);
        } else {
            info!("Seeded {}", identity);
        }
    }

    Ok(())
}
