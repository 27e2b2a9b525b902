//! The preinit binary: process 1 of a converted VM image.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use preinit::boot::{self, BootConfig};
use preinit::constants;
use preinit::service::SupervisorState;

#[derive(Parser)]
#[command(name = "preinit", about = "Minimal init for container-derived VM images")]
struct Args {
    /// Instance metadata endpoint (host[:port]).
    #[arg(long, default_value = constants::ENDPOINT_METADATA_DEFAULT)]
    metadata_endpoint: String,

    /// Directory whose entry names select the enabled services.
    #[arg(long, default_value = constants::DIR_SERVICES)]
    services_dir: PathBuf,

    /// Seconds to wait for graceful shutdown before sending SIGKILL.
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,

    /// Enable debug output.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "preinit starting");

    let config = BootConfig {
        metadata_endpoint: args.metadata_endpoint,
        services_dir: args.services_dir,
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        ..BootConfig::default()
    };

    match boot::run(config).await {
        Ok(state) => {
            tracing::info!(state = ?state, "shutdown complete");
            if state == SupervisorState::KilledOnTimeout {
                tracing::warn!("some processes did not exit gracefully");
            }
            power_off();
        }
        Err(err) => {
            tracing::error!(error = %err, "boot failed");
            std::process::exit(1);
        }
    }
}

/// As process 1 there is nothing to return to; ask the kernel to power
/// off the machine. Failure (not PID 1, missing capability) only means
/// we exit instead.
#[cfg(target_os = "linux")]
fn power_off() {
    use nix::sys::reboot::{RebootMode, reboot};
    if let Err(err) = reboot(RebootMode::RB_POWER_OFF) {
        tracing::warn!(error = %err, "unable to power off");
    }
}

#[cfg(not(target_os = "linux"))]
fn power_off() {}
