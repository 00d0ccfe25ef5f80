use anyhow::{Context, Result};
use fleetctl::cloud::build_provider;
use fleetctl::config::Settings;
use fleetctl::controller::FleetController;
use fleetctl::http_api::run_server;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env().context("failed to load configuration")?;
    eprintln!(
        "fleetctl starting: full_match_limit={} min_backup_vms={} max_backup_vms={}",
        settings.full_match_limit, settings.min_backup_vms, settings.max_backup_vms
    );

    let cloud = build_provider(&settings)?;
    let controller = Arc::new(FleetController::new(Arc::from(cloud), settings.clone()));

    controller.reconcile_once().await;

    let reconciler_controller = Arc::clone(&controller);
    let update_interval = Duration::from_millis(settings.update_interval_ms);
    let reconciler_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(update_interval);
        interval.tick().await; // first tick fires immediately; we already ran one above
        loop {
            interval.tick().await;
            reconciler_controller.reconcile_once().await;
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let server = tokio::spawn(run_server(addr, Arc::clone(&controller)));

    tokio::select! {
        result = server => {
            result.context("server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("fleetctl: received shutdown signal");
        }
    }

    reconciler_handle.abort();
    Ok(())
}
