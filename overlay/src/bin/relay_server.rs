//! `relay-server`: the gatekeeping circuit relay binary.
//!
//! Assembles identity, allow-list, vault, reservation/circuit engines and
//! pairing group registry, then serves the local admin API over a Unix
//! socket until interrupted. The overlay swarm itself -- accepting inbound
//! reservation/circuit requests from peers, and routing streams on
//! `admin::unseal_protocol_id()` to [`admin::handle_unseal_stream`] -- is an
//! external collaborator this binary does not implement; wiring a concrete
//! DHT/transport in here is the documented integration point a deployment
//! supplies.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use overlay::admin::{self, AdminApiState};
use overlay::allowlist::AllowListStore;
use overlay::config::RelayConfig;
use overlay::control_api::bind_with_fresh_cookie;
use overlay::gater::ConnectionGater;
use overlay::identity::IdentityStore;
use overlay::metrics::Metrics;
use overlay::pairing::PairingGroupRegistry;
use overlay::relay::{CircuitEngine, ReservationEngine};
use overlay::telemetry;
use overlay::vault::Vault;

#[derive(Parser)]
#[command(name = "relay-server")]
#[command(about = "Gatekeeping circuit relay for a private overlay network")]
struct Cli {
    /// Path to the relay's TOML config. Defaults to a fully-working
    /// configuration when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,

    /// Rendezvous address advertised in invite codes issued by this relay.
    #[arg(long)]
    rendezvous_address: String,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("overlay")
        .join("relay.toml")
}

fn cookie_path_for(socket_path: &std::path::Path) -> PathBuf {
    socket_path.with_extension("cookie")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose).context("failed to initialize logging")?;

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = RelayConfig::load_or_default(&config_path).context("failed to load relay config")?;

    let identity = IdentityStore::load_or_generate(&config.identity_path).context("failed to load identity")?;
    info!(peer_id = %identity.peer_id(), "relay identity loaded");

    let allowlist = Arc::new(AllowListStore::new(config.authorized_keys_path.clone()));
    let authorized = allowlist.authorized_set().context("failed to load allow-list")?;
    let gater = ConnectionGater::new(authorized);

    let vault = Arc::new(Vault::load(config.vault_path.clone()).context("failed to load vault")?);
    let reservations = Arc::new(ReservationEngine::new(config.reservation_limits(), None));
    let _circuits = Arc::new(CircuitEngine::new(config.circuit_limits(), Arc::clone(&reservations)));
    let groups = Arc::new(PairingGroupRegistry::new());
    let metrics = Metrics::new().context("failed to initialize metrics")?;

    let cancel = CancellationToken::new();

    let admin_cookie_path = cookie_path_for(&config.admin_socket_path);
    let bound = bind_with_fresh_cookie(config.admin_socket_path.clone(), admin_cookie_path)
        .await
        .context("failed to bind relay admin socket")?;
    info!(cookie = %bound.cookie, "relay admin API cookie (share with the operator CLI only)");

    let admin_state = AdminApiState::new(
        config.namespace.clone(),
        cli.rendezvous_address.clone(),
        Arc::clone(&vault),
        Arc::clone(&groups),
    );

    info!(
        protocol = %admin::unseal_protocol_id(&config.namespace),
        "overlay-facing unseal protocol id (route inbound swarm streams on this id to handle_unseal_stream)"
    );

    let auto_seal_vault = Arc::clone(&vault);
    let auto_seal_cancel = cancel.child_token();
    let auto_seal_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = auto_seal_cancel.cancelled() => break,
                _ = ticker.tick() => auto_seal_vault.tick_auto_seal(),
            }
        }
    });

    let admin_cancel = cancel.clone();
    let serve_task = tokio::spawn(admin::serve(bound, admin_state, admin_cancel, identity.peer_id().to_string()));

    info!(
        reservations_cap = config.reservation.max_reservations,
        authorized_peers = gater.current_size(),
        "relay server ready"
    );
    metrics.reservations_current.set(reservations.count() as i64);

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();

    auto_seal_task.await.ok();
    serve_task.await.context("admin API task panicked")?.context("admin API exited with an error")?;

    Ok(())
}
