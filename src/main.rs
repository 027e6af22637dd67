//! vtunnel - Minimal encrypted virtual network tunnel
//!
//! Command line front end: parses options, sets up logging, the TUN
//! device and the UDP socket, then hands control to the event loop.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vtunnel::client::{ClientEngine, ClientOptions};
use vtunnel::config::{Mode, RawConfig, TunnelConfig};
use vtunnel::event_loop::{self, LoopOptions};
use vtunnel::netconf::{InterfaceConfigurator, LinuxNetConfig, Worker};
use vtunnel::packet::Codec;
use vtunnel::route::RouteTable;
use vtunnel::server::{ServerEngine, ServerOptions};
use vtunnel::status::TunnelStatus;
use vtunnel::transport;
use vtunnel::tun::TunDevice;

/// vtunnel - Minimal encrypted virtual network tunnel
#[derive(Parser)]
#[command(name = "vtunnel")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Path to a TOML configuration file; command line options override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Shortcut for --log-level debug
    #[arg(long, global = true)]
    debug: bool,

    /// Detach and run in the background
    #[arg(short, long)]
    daemon: bool,

    #[command(flatten)]
    tunnel: TunnelArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Default)]
struct TunnelArgs {
    /// Server mode: listen on HOST:PORT
    #[arg(short = 'l', long = "local", value_name = "HOST:PORT")]
    local: Option<String>,

    /// Client mode: connect to the server at HOST:PORT
    #[arg(short = 'r', long = "remote", value_name = "HOST:PORT")]
    remote: Option<String>,

    /// Tunnel IPv4 address: a.b.c.d/prefix or a point-to-point pair a.b.c.d/e.f.g.h
    #[arg(short = 'a', long = "ipv4-addr")]
    ipv4_addr: Option<String>,

    /// Tunnel IPv6 address: addr/prefix
    #[arg(short = 'A', long = "ipv6-addr")]
    ipv6_addr: Option<String>,

    /// Tunnel MTU [default: 1416]
    #[arg(short = 'm', long)]
    mtu: Option<u16>,

    /// Keepalive interval in seconds [default: 13]
    #[arg(short = 't', long)]
    keepalive: Option<u64>,

    /// Seconds of silence before the client reconnects [default: 60]
    #[arg(long)]
    reconnect_timeout: Option<u64>,

    /// Seconds of silence before the server drops a peer [default: 3 x keepalive]
    #[arg(long)]
    session_expiry: Option<u64>,

    /// Interface name, may contain %d [default: vt%d]
    #[arg(short = 'n', long)]
    ifname: Option<String>,

    /// Write the process id to this file
    #[arg(short = 'p', long)]
    pidfile: Option<PathBuf>,

    /// Pre-shared passphrase
    #[arg(short = 'e', long)]
    encryption_key: Option<String>,

    /// Run without encryption
    #[arg(short = 'N', long, conflicts_with = "encryption_key")]
    no_encryption: bool,

    /// Route in network/prefix=gateway form, may be repeated
    #[arg(short = 'v', long = "route")]
    routes: Vec<String>,

    /// Server: forward traffic between peers instead of via the kernel
    #[arg(long)]
    relay: bool,

    /// Server: require CLIENT_LOGIN before accepting data
    #[arg(long)]
    no_implicit_login: bool,

    /// Server: do not push routes to clients
    #[arg(long)]
    no_route_advertise: bool,

    /// Server: IPv4 pool for client addresses [default: the tunnel network]
    #[arg(long)]
    address_pool: Option<String>,

    /// Write a JSON status snapshot here every second
    #[arg(long)]
    status_file: Option<PathBuf>,
}

impl TunnelArgs {
    fn into_raw(self) -> RawConfig {
        RawConfig {
            local: self.local,
            remote: self.remote,
            ipv4_addr: self.ipv4_addr,
            ipv6_addr: self.ipv6_addr,
            mtu: self.mtu,
            keepalive: self.keepalive,
            reconnect_timeout: self.reconnect_timeout,
            session_expiry: self.session_expiry,
            ifname: self.ifname,
            pidfile: self.pidfile,
            encryption_key: self.encryption_key,
            no_encryption: self.no_encryption,
            routes: self.routes,
            relay: self.relay,
            implicit_login: self.no_implicit_login.then_some(false),
            route_advertise: self.no_route_advertise.then_some(false),
            address_pool: self.address_pool,
            status_file: self.status_file,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the status of a running tunnel
    Status {
        /// Status file the running tunnel was started with
        #[arg(long)]
        status_file: PathBuf,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };

    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    init_logging(level);

    let result = match cli.command {
        Some(Commands::Status { ref status_file, json }) => run_status(status_file, json),
        None => run_tunnel(cli),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Merge the config file with command line options and validate
fn load_config(path: Option<&Path>, args: TunnelArgs) -> anyhow::Result<TunnelConfig> {
    let file = match path {
        Some(path) => RawConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RawConfig::default(),
    };
    let config = TunnelConfig::from_raw(file.merge(args.into_raw()))?;
    Ok(config)
}

fn run_tunnel(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref(), cli.tunnel)?;

    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root; creating the TUN device will probably fail");
    }

    let crypto = config.crypto();
    if crypto.is_encrypted() {
        info!("Key fingerprint {}", hex::encode(&crypto.fingerprint()[..4]));
    }
    let codec = Codec::new(crypto, config.mtu as usize);

    let mut device = TunDevice::create(&config.ifname).context("failed to create TUN device")?;
    let ifname = device.name().to_string();
    let netconf = LinuxNetConfig;
    netconf
        .configure_interface(&ifname, &config.interface_addresses(), config.mtu)
        .with_context(|| format!("failed to configure {}", ifname))?;

    let routes = config.route_table();
    install_routes(&netconf, &routes, &config, &ifname);

    let socket = match &config.mode {
        Mode::Server { listen } => {
            let socket = transport::bind_listener(*listen)?;
            info!("Listening on UDP {}", listen);
            socket
        }
        Mode::Client { server, .. } => transport::bind_for_server(server)?,
    };

    // Threads do not survive fork, so detach before starting any
    if cli.daemon {
        nix::unistd::daemon(false, false).context("failed to daemonize")?;
    }
    if let Some(pidfile) = &config.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pid file {}", pidfile.display()))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("failed to install signal handler")?;
    }

    let worker = Worker::spawn(Box::new(LinuxNetConfig), ifname.clone())?;
    let options = LoopOptions {
        tick: Duration::from_secs(1),
        status_file: config.status_file.clone(),
    };

    info!("vtunnel running on {} (mtu {})", ifname, config.mtu);
    let result = match &config.mode {
        Mode::Server { .. } => {
            let mut engine = ServerEngine::new(
                codec,
                routes,
                ServerOptions::from_config(&config, &ifname),
                Instant::now(),
            );
            event_loop::run(&mut engine, &mut device, &socket, Some(&worker), &shutdown, &options)
        }
        Mode::Client { .. } => {
            let mut engine = ClientEngine::new(
                codec,
                routes,
                ClientOptions::from_config(&config, &ifname)?,
                Instant::now(),
            );
            event_loop::run(&mut engine, &mut device, &socket, Some(&worker), &shutdown, &options)
        }
    };

    if let Some(pidfile) = &config.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    result?;
    info!("vtunnel stopped.");
    Ok(())
}

/// Install configured routes that point at a peer rather than at ourselves
fn install_routes(netconf: &dyn InterfaceConfigurator, routes: &RouteTable, config: &TunnelConfig, ifname: &str) {
    let own = config.tunnel_addresses();
    for route in routes.all() {
        if own.contains(&route.gateway) {
            continue;
        }
        if route.prefix_len() == 0 {
            // Would also capture the tunnel's own UDP traffic
            warn!("Not installing default route {}; add it once the server has a host route", route);
            continue;
        }
        if let Err(e) = netconf.add_route(route, ifname) {
            warn!("Failed to install route {}: {}", route, e);
        }
    }
}

fn run_status(path: &Path, json: bool) -> anyhow::Result<()> {
    let status = TunnelStatus::read_from(path)
        .with_context(|| format!("cannot read status from {}", path.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", status.render());
    }
    Ok(())
}
