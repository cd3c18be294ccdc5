//! wgmeshd CLI - WireGuard mesh provisioning daemon
//!
//! Runs the REST API daemon against the live `wg`/`ip` control surface,
//! or synthesizes a mesh configuration bundle offline.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use wgmeshd::daemon::{DaemonConfig, DaemonService};
use wgmeshd::keys::{DeterministicPsk, PskStrategy, RandomPsk};
use wgmeshd::mesh;
use wgmeshd::runtime::WgCli;

/// wgmeshd - WireGuard mesh provisioning daemon
#[derive(Parser, Debug)]
#[command(name = "wgmeshd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the provisioning daemon with its REST API
    Daemon {
        /// Address to bind the HTTP server to
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
        bind: IpAddr,

        /// HTTP port for the REST API
        #[arg(long, default_value_t = 8686)]
        port: u16,

        /// State file path (overrides WG_STATE_FILE)
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Lock file path (overrides WG_LOCK_FILE)
        #[arg(long)]
        lock_file: Option<PathBuf>,

        /// WireGuard control binary
        #[arg(long, default_value = "wg")]
        wg_bin: String,

        /// Link control binary
        #[arg(long, default_value = "ip")]
        ip_bin: String,
    },

    /// Resolve a mesh spec and write its config bundle offline
    Generate {
        /// Path to the mesh spec JSON
        #[arg(short, long)]
        spec: PathBuf,

        /// Output: a directory, or a `.zip` path for an archive
        #[arg(short, long)]
        out: PathBuf,

        /// Draw a fresh random PSK per peer pair instead of the
        /// deterministic derivation
        #[arg(long)]
        random_psk: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    match args.command {
        Command::Daemon {
            bind,
            port,
            state_file,
            lock_file,
            wg_bin,
            ip_bin,
        } => {
            let mut config = DaemonConfig::from_env();
            if let Some(path) = state_file {
                config.state_file = path;
            }
            if let Some(path) = lock_file {
                config.lock_file = Some(path);
            }
            config.wg_bin = wg_bin;
            config.ip_bin = ip_bin;

            run_daemon(config, SocketAddr::new(bind, port)).await
        }
        Command::Generate {
            spec,
            out,
            random_psk,
        } => generate(&spec, &out, random_psk),
    }
}

async fn run_daemon(config: DaemonConfig, addr: SocketAddr) -> anyhow::Result<()> {
    tracing::info!(
        "wgmeshd daemon starting (state file {:?})",
        config.state_file
    );

    let runtime = Arc::new(WgCli::new(config.wg_bin.clone(), config.ip_bin.clone()));
    let daemon = DaemonService::new(&config, runtime);

    tokio::select! {
        result = daemon.run_http(addr) => {
            result.context("HTTP server failed")
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down daemon...");
            Ok(())
        }
    }
}

fn generate(spec_path: &PathBuf, out: &PathBuf, random_psk: bool) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(spec_path)
        .with_context(|| format!("could not read spec {spec_path:?}"))?;
    let spec: mesh::MeshSpec = serde_json::from_str(&json).context("invalid mesh spec")?;

    let resolved = mesh::resolve(&spec)?;
    let strategy: &dyn PskStrategy = if random_psk {
        &RandomPsk
    } else {
        &DeterministicPsk
    };
    let bundle = mesh::render_bundle(&spec, &resolved, strategy)?;

    if out.extension().is_some_and(|ext| ext == "zip") {
        let bytes = mesh::build_zip(&bundle)?;
        std::fs::write(out, bytes).with_context(|| format!("could not write {out:?}"))?;
    } else {
        mesh::archive::write_bundle_to_dir(&bundle, out)
            .with_context(|| format!("could not write bundle under {out:?}"))?;
    }

    tracing::info!(
        "generated {} files for {} nodes / {} clients",
        bundle.files.len(),
        resolved.nodes.len(),
        resolved.clients.len()
    );
    Ok(())
}
