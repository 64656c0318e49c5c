//! Companion Link Server
//!
//! Serves the WebSocket control channel and runs the companion
//! simulation thread.

use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use companion_link::{
    VERSION,
    game::{spawn_simulation, CompanionId, CompanionWorld},
    network::{AuthConfig, BridgeServer, JwtValidator, ServerConfig, SessionAuthenticator},
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

    info!("Companion Link Server v{}", VERSION);

    let config = ServerConfig::from_env()?;
    let auth_config = AuthConfig::from_env();
    if !auth_config.is_configured() {
        warn!("Neither AUTH_SECRET nor AUTH_PUBLIC_KEY_PEM is set, every connection will be rejected");
    }

    let world = CompanionWorld::with_companions(
        config.companions.iter().cloned().map(CompanionId::new),
    );
    info!("Simulation starts with {} companions", world.companion_count());
    let (handoff, simulation) = spawn_simulation(world)?;

    let validator = JwtValidator::new(&auth_config)?;
    let authenticator = SessionAuthenticator::new(Arc::new(validator));
    let server = Arc::new(BridgeServer::new(config, authenticator, handoff));
    let listener = server.bind().await?;

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            signal_server.shutdown();
        }
    });

    server.serve(listener).await?;

    // The simulation thread exits once the last handoff (held by the
    // server and its connection tasks) is gone.
    drop(server);
    let world = tokio::task::spawn_blocking(move || simulation.join()).await??;
    let stats = world.stats();
    info!(applied = stats.applied, rejected = stats.rejected, "Simulation finished");

    Ok(())
}
