use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mvirt_dns::Core;
use mvirt_dns::adapter::{AdapterFactory, MemoryAdapters, UnsupportedAdapters};
use mvirt_dns::catalog::Catalog;
use mvirt_dns::config::{CapabilityFlags, Configuration};
use mvirt_dns::handler::RefusingHandler;
use mvirt_dns::zonefile::{TextZonefileLoader, ZonefileLoader};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvirt-dns")]
#[command(about = "mvirt authoritative DNS data plane")]
struct Args {
    /// JSON configuration file, re-read on SIGHUP
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of worker threads (overrides the file)
    #[arg(short, long)]
    threads: Option<usize>,

    /// UDP listen address, repeatable (overrides the file)
    #[arg(short, long)]
    listen: Vec<SocketAddr>,

    /// Zonefile to serve, repeatable (overrides the file)
    #[arg(short, long)]
    zonefile: Vec<PathBuf>,

    /// Pin workers to CPUs
    #[arg(long)]
    pin: bool,

    /// Parse the zonefiles, print totals and exit
    #[arg(long)]
    check: bool,

    /// Use in-memory adapters instead of capturing on real interfaces
    #[arg(long)]
    offline: bool,

    /// Capture with PF_RING
    #[arg(long)]
    pfring: bool,

    /// Queue transmits instead of sending inline
    #[arg(long)]
    sendq: bool,

    /// Log every packet at trace level
    #[arg(long)]
    packet_trace: bool,
}

impl Args {
    fn flags(&self) -> CapabilityFlags {
        CapabilityFlags {
            pfring: self.pfring,
            sendq: self.sendq,
            offline: self.offline,
            packet_trace: self.packet_trace,
            zonefile_check: self.check,
        }
    }

    fn load_config(&self) -> anyhow::Result<Configuration> {
        let mut config = match &self.config {
            Some(path) => Configuration::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Configuration::default(),
        };
        if let Some(threads) = self.threads {
            config.worker_threads = threads;
        }
        if !self.listen.is_empty() {
            config.listen = self.listen.clone();
        }
        if !self.zonefile.is_empty() {
            config.zonefiles = self.zonefile.clone();
        }
        config.cpu_pinning |= self.pin;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_dns=info".parse()?))
        .init();

    let args = Args::parse();
    let mut config = args.load_config()?;
    let loader = TextZonefileLoader;

    if args.check {
        let stats = loader
            .parse_all(&mut Catalog::new(), &config)
            .context("zonefile check failed")?;
        println!(
            "{} files, {} bytes, {} records",
            stats.files, stats.bytes, stats.records
        );
        return Ok(());
    }

    let adapters: Arc<dyn AdapterFactory> = if args.offline {
        Arc::new(MemoryAdapters::new())
    } else {
        Arc::new(UnsupportedAdapters)
    };
    let mut core = Core::new(args.flags(), adapters, Arc::new(RefusingHandler));

    let initial = Configuration::empty();
    core.reload_catalog(&config, &loader)
        .context("loading zonefiles")?;
    core.change_worker_sockets(&config, &initial)
        .context("binding sockets")?;
    core.change_worker_threads(&config, &initial)
        .context("starting workers")?;
    info!(
        workers = core.worker_count(),
        sockets = ?core.socket_addrs(),
        "mvirt-dns running"
    );

    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading");
                let new = match args.load_config() {
                    Ok(new) => new,
                    Err(e) => {
                        error!(error = %e, "configuration reload failed, keeping current");
                        continue;
                    }
                };

                // A stop signal during the reload waits for it: the core is on
                // the blocking thread until its bounded quiescence waits end.
                let mut task = spawn_reload(core, new, config.clone(), TextZonefileLoader);
                let mut stop = false;
                let (reloaded, applied) = loop {
                    tokio::select! {
                        done = &mut task => break done.context("reload task failed")?,
                        _ = sigint.recv(), if !stop => {
                            info!("Received SIGINT, shutting down after reload...");
                            stop = true;
                        }
                        _ = sigterm.recv(), if !stop => {
                            info!("Received SIGTERM, shutting down after reload...");
                            stop = true;
                        }
                    }
                };
                core = reloaded;
                config = applied;
                if stop {
                    break;
                }
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
        }
    }

    core.shutdown();
    info!("mvirt-dns stopped");
    Ok(())
}

/// Run [`reload`] on the blocking pool so signals are still received while
/// it waits on workers. The core comes back with the applied configuration.
fn spawn_reload<L>(mut core: Core, new: Configuration, old: Configuration, loader: L) -> JoinHandle<(Core, Configuration)>
where
    L: ZonefileLoader + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let applied = reload(&mut core, new, &old, &loader);
        (core, applied)
    })
}

/// Apply `new` over `old`: catalog, then sockets, then threads. A failed step
/// keeps its part of `old`; the configuration actually in force is returned.
fn reload(core: &mut Core, new: Configuration, old: &Configuration, loader: &dyn ZonefileLoader) -> Configuration {
    let mut applied = new.clone();

    if let Err(e) = core.reload_catalog(&new, loader) {
        error!(error = %e, "catalog reload failed");
        applied.zonefiles = old.zonefiles.clone();
    }
    if let Err(e) = core.change_worker_sockets(&new, old) {
        error!(error = %e, "socket reload failed");
        applied.listen = old.listen.clone();
        applied.interfaces = old.interfaces.clone();
    }
    if let Err(e) = core.change_worker_threads(&new, old) {
        error!(error = %e, "worker resize failed");
    }
    applied.worker_threads = core.worker_count();

    for kind in mvirt_dns::generation::ResourceKind::ALL {
        let pending = core.pending_retirements(kind);
        if pending > 0 {
            warn!(%kind, pending, "generations still waiting for workers");
        }
    }
    applied
}
