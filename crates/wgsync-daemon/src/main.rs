// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use wgsync_daemon::config;
use wgsync_daemon::netlink::CurrentGateway;
use wgsync_daemon::reconcile;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Keeps WireGuard devices in sync with their stored peers")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/wgsync/daemon.toml")]
    config: PathBuf,

    /// Re-reconciliation interval in seconds
    #[arg(short, long, default_value_t = 60)]
    interval: u64,

    /// Run the startup pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    info!(config = %args.config.display(), interval = args.interval, "starting wgsync-daemon");

    let config = config::load(&args.config).await?;
    let reconciler = reconcile::build(&config, CurrentGateway::default()).await?;

    let report = reconcile::reconcile_all(&reconciler).await;
    if args.once {
        return match report {
            Some(r) if r.failed.is_empty() => Ok(()),
            Some(r) => Err(format!("{} device(s) failed to sync", r.failed.len()).into()),
            None => Err("reconciliation failed".into()),
        };
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reconcile::reconcile_all(&reconciler).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
