//! rtsyncd entry point
//!
//! Opens both netlink channels, reports the routes other protocols have
//! installed and the host's addresses, then follows kernel notifications
//! and rescans whenever routes or rules change.

use anyhow::Context;
use clap::Parser;
use rtsyncd::config::DEFAULT_CONFIG_PATH;
use rtsyncd::iface::{self, InterfaceCache};
use rtsyncd::netlink::Connector;
use rtsyncd::sim::SimKernel;
use rtsyncd::{AddressFilter, ChangeHandler, ChangeMask, KernelRouting, RtsyncConfig};
use std::collections::HashSet;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tracing::{debug, error, info, warn};

/// Notification polling period when the listen channel has no descriptor
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Kernel routing table synchronization daemon
#[derive(Parser, Debug)]
#[command(name = "rtsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Run against an in-memory kernel instead of rtnetlink
    #[arg(long)]
    dry_run: bool,

    /// Print foreign routes and addresses, then exit
    #[arg(long)]
    dump_only: bool,

    /// Only react to link changes on these interfaces (repeatable)
    #[arg(short = 'i', long = "interface")]
    interfaces: Vec<String>,

    /// Maximum number of routes reported per dump
    #[arg(long, default_value = "4096")]
    max_routes: usize,

    /// Full rescan period in seconds
    #[arg(long, default_value = "30")]
    rescan_interval: u64,
}

fn init_logging(log_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .init();
}

/// Collects change bits between event loop iterations
struct PendingChanges {
    tracked: Option<HashSet<String>>,
    mask: ChangeMask,
}

impl ChangeHandler for PendingChanges {
    fn is_tracked_link(&self, name: &str) -> bool {
        self.tracked.as_ref().is_none_or(|names| names.contains(name))
    }

    fn on_change(&mut self, mask: ChangeMask) {
        self.mask |= mask;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = RtsyncConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("invalid configuration")?;

    info!(
        protocol = config.netlink.protocol,
        export_table = config.tables.export_table,
        import_tables = ?config.tables.import_tables,
        source_tables = ?config.source_table_range(),
        dry_run = args.dry_run,
        "rtsyncd starting"
    );

    if args.dry_run {
        let routing = KernelRouting::new(&config, SimKernel::new());
        run(routing, &args).await
    } else {
        let routing = KernelRouting::open(&config).context("opening rtnetlink")?;
        run(routing, &args).await
    }
}

async fn run<C: Connector>(mut routing: KernelRouting<C>, args: &Args) -> anyhow::Result<()> {
    let mut names = InterfaceCache::default();

    if args.dump_only {
        let result = report(&mut routing, &mut names, args.max_routes);
        routing.teardown();
        return result;
    }

    let tracked = if args.interfaces.is_empty() {
        None
    } else {
        for name in &args.interfaces {
            match iface::name_to_index(name) {
                Ok(ifindex) => {
                    names.insert(ifindex, name.as_str());
                }
                Err(e) => warn!(error = %e, "Tracked interface does not exist yet"),
            }
        }
        Some(args.interfaces.iter().cloned().collect())
    };
    let mut pending = PendingChanges {
        tracked,
        mask: ChangeMask::empty(),
    };

    routing.setup_listener().context("opening listen channel")?;
    report(&mut routing, &mut names, args.max_routes)?;

    let result = event_loop(&mut routing, &mut pending, &mut names, args).await;
    routing.teardown();
    result
}

async fn event_loop<C: Connector>(
    routing: &mut KernelRouting<C>,
    pending: &mut PendingChanges,
    names: &mut InterfaceCache,
    args: &Args,
) -> anyhow::Result<()> {
    let mut listen: Option<(u64, AsyncFd<OwnedFd>)> = None;
    let mut rescan = tokio::time::interval(Duration::from_secs(args.rescan_interval.max(1)));
    rescan.tick().await;

    info!("Listening for kernel changes");
    loop {
        // A reopened listen socket may get the old descriptor number back,
        // so the watched dup is keyed by generation.
        let generation = routing.listen_generation();
        let current = routing.listen_fd().map(|raw| (generation, raw));
        if listen.as_ref().map(|(watched, _)| *watched) != current.map(|(g, _)| g) {
            // Drop the stale dup first so the old socket is released
            listen = None;
            if let Some((generation, raw)) = current {
                listen = Some((generation, watch(raw)?));
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(());
            }
            ready = listen_ready(listen.as_ref().map(|(_, fd)| fd)) => {
                ready.context("waiting for notifications")?;
                if let Err(e) = routing.drain_changes(pending) {
                    warn!(error = %e, "Draining notifications failed");
                    continue;
                }
            }
            _ = rescan.tick() => {
                debug!("Periodic rescan");
                pending.mask |= ChangeMask::ROUTE;
            }
        }

        let mask = std::mem::replace(&mut pending.mask, ChangeMask::empty());
        if mask.is_empty() {
            continue;
        }
        info!(%mask, "Kernel state changed");
        if mask.contains(ChangeMask::LINK) {
            *names = InterfaceCache::default();
        }
        if let Err(e) = rescan_changes(routing, names, mask, args.max_routes) {
            error!(error = %e, "Rescan failed");
        }
    }
}

fn rescan_changes<C: Connector>(
    routing: &mut KernelRouting<C>,
    names: &mut InterfaceCache,
    mask: ChangeMask,
    max: usize,
) -> rtsyncd::Result<()> {
    if mask.contains(ChangeMask::ROUTE) || mask.contains(ChangeMask::RULE) {
        let routes = routing.dump_routes(max)?;
        info!(found = routes.found, truncated = routes.is_truncated(), "Foreign routes");
    }
    if mask.contains(ChangeMask::ADDRESS) || mask.contains(ChangeMask::LINK) {
        let addresses = routing.dump_addresses(AddressFilter::global(), max)?;
        for record in &addresses.records {
            debug!(address = %record.dest, interface = interface_name(names, record.ifindex), "Local address");
        }
        info!(found = addresses.found, "Local addresses");
    }
    Ok(())
}

fn report<C: Connector>(
    routing: &mut KernelRouting<C>,
    names: &mut InterfaceCache,
    max: usize,
) -> anyhow::Result<()> {
    let routes = routing.dump_routes(max).context("dumping routes")?;
    for record in &routes.records {
        println!("{} dev {}", record, interface_name(names, record.ifindex));
    }
    if routes.is_truncated() {
        warn!(found = routes.found, kept = routes.records.len(), "Route dump truncated");
    }

    let addresses = routing
        .dump_addresses(AddressFilter::global(), max)
        .context("dumping addresses")?;
    for record in &addresses.records {
        println!("local {} dev {}", record.dest, interface_name(names, record.ifindex));
    }
    info!(routes = routes.found, addresses = addresses.found, "Initial scan complete");
    Ok(())
}

fn interface_name(names: &mut InterfaceCache, ifindex: u32) -> String {
    match names.resolve(ifindex) {
        Ok(name) => name.to_string(),
        Err(_) => format!("if{}", ifindex),
    }
}

/// Register a duplicate of the listen descriptor with the reactor.
fn watch(raw: RawFd) -> anyhow::Result<AsyncFd<OwnedFd>> {
    let owned = unsafe {
        let dup = libc::dup(raw);
        if dup < 0 {
            return Err(std::io::Error::last_os_error()).context("dup listen socket");
        }
        OwnedFd::from_raw_fd(dup)
    };
    AsyncFd::new(owned).context("registering listen socket")
}

async fn listen_ready(fd: Option<&AsyncFd<OwnedFd>>) -> std::io::Result<()> {
    match fd {
        Some(fd) => {
            let mut guard = fd.readable().await?;
            guard.clear_ready();
            Ok(())
        }
        None => {
            tokio::time::sleep(IDLE_POLL).await;
            Ok(())
        }
    }
}
