//! Runs a server and a client against the in-process loopback hypervisor and
//! reports how the link comes up and goes down.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use vchan::{ChannelNumber, ConnectionState, InitMode, ServerConfig, Vchan, VchanError, WireVersion};
use vchan_hv::loopback::LoopbackHypervisor;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Sync,
    Deferred,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Loopback demo of the vchan handshake")]
struct Args {
    /// Channel number both ends rendezvous on
    #[arg(long, default_value_t = 0)]
    channel: u32,

    /// Wire version offered by the server (1 = frames, 2 = grants); default 2
    #[arg(long)]
    wire_version: Option<u8>,

    /// Server init mode; overrides the config file
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// JSON server configuration; `peer` is replaced by the client domain
    #[arg(long)]
    config: Option<PathBuf>,

    /// Destroy the client domain before it connects
    #[arg(long)]
    kill_peer: bool,

    /// Liveness poll interval for a synchronous server, in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let hv = LoopbackHypervisor::new();
    let server_dom = hv.create_domain();
    let client_dom = hv.create_domain();
    let channel = ChannelNumber(args.channel);

    let mut config = load_config(&args)?;
    config.peer = client_dom;
    info!(%server_dom, %client_dom, %channel, ?config, "domains created");

    if args.kill_peer {
        return run_with_dead_peer(&hv, server_dom, client_dom, channel, &config);
    }

    let server_ctx = hv.context(server_dom);
    let client_ctx = hv.context(client_dom);

    let (mut server, mut client) = match config.mode {
        InitMode::Sync => {
            let server_config = config.clone();
            let server = thread::spawn(move || Vchan::server_init(&server_ctx, channel, &server_config));
            let client = connect_with_retry(&client_ctx, server_dom, channel)?;
            let server = server
                .join()
                .map_err(|_| anyhow::anyhow!("server thread panicked"))?
                .context("server handshake")?;
            (server, client)
        }
        InitMode::Deferred => {
            let mut server = Vchan::server_init(&server_ctx, channel, &config).context("server handshake")?;
            report("server", &mut server);
            let client = Vchan::client_init(&client_ctx, server_dom, channel).context("client handshake")?;
            if !server.is_pending()? {
                bail!("client connected without signalling");
            }
            let completed = server.handle_connected()?;
            info!(completed, "deferred handshake completed");
            (server, client)
        }
    };

    report("server", &mut server);
    report("client", &mut client);
    cursors(&server)?;

    client.close();
    info!("client closed");
    report("server", &mut server);
    server.close();

    let stats = hv.stats();
    info!(?stats, "leftover loopback resources");
    if stats.allocations + stats.mappings + stats.bound_ports + stats.open_event_channels > 0 {
        warn!("resources leaked");
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Ignore error if already set.
    let _ = fmt().with_env_filter(env_filter).try_init();
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<ServerConfig>(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => ServerConfig::default(),
    };
    if let Some(raw) = args.wire_version {
        config.version =
            WireVersion::from_u8(raw).with_context(|| format!("unsupported wire version {raw}"))?;
    }
    match args.mode {
        Some(Mode::Sync) => config.mode = InitMode::Sync,
        Some(Mode::Deferred) => config.mode = InitMode::Deferred,
        None => {}
    }
    match args.poll_ms {
        Some(poll_ms) => config.liveness_poll_ms = poll_ms,
        // Keep the dead-peer demo short.
        None if args.kill_peer => config = config.with_liveness_poll(Duration::from_millis(100)),
        None => {}
    }
    Ok(config)
}

/// Retries discovery until the server has published.
fn connect_with_retry(
    ctx: &vchan::HvContext,
    server: vchan::DomainId,
    channel: ChannelNumber,
) -> Result<Vchan> {
    for _ in 0..200 {
        match Vchan::client_init(ctx, server, channel) {
            Ok(client) => return Ok(client),
            Err(err) if err.is_discovery() => thread::sleep(Duration::from_millis(5)),
            Err(err) => return Err(err).context("client handshake"),
        }
    }
    bail!("server never published channel {channel}")
}

fn run_with_dead_peer(
    hv: &LoopbackHypervisor,
    server_dom: vchan::DomainId,
    client_dom: vchan::DomainId,
    channel: ChannelNumber,
    config: &ServerConfig,
) -> Result<()> {
    let ctx = hv.context(server_dom);
    match config.mode {
        InitMode::Deferred => {
            let mut server = Vchan::server_init(&ctx, channel, config).context("server handshake")?;
            report("server", &mut server);
            hv.destroy_domain(client_dom);
            info!(%client_dom, "client domain destroyed");
            report("server", &mut server);
        }
        InitMode::Sync => {
            let killer = {
                let hv = hv.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(50));
                    hv.destroy_domain(client_dom);
                })
            };
            let outcome = Vchan::server_init(&ctx, channel, config);
            killer
                .join()
                .map_err(|_| anyhow::anyhow!("killer thread panicked"))?;
            match outcome {
                Err(VchanError::PeerGone(peer)) => info!(%peer, "server gave up on vanished peer"),
                Err(err) => return Err(err).context("server handshake"),
                Ok(_) => bail!("server connected to a destroyed domain"),
            }
        }
    }
    Ok(())
}

fn report(name: &str, handle: &mut Vchan) {
    let state: ConnectionState = handle.state();
    info!(
        end = name,
        %state,
        version = %handle.version(),
        reference = %handle.reference(),
        port = ?handle.local_port(),
        advertised = handle.is_advertised(),
        "state"
    );
}

fn cursors(server: &Vchan) -> Result<()> {
    let ring = server.ring()?;
    for direction in [vchan::Direction::ToClient, vchan::Direction::ToServer] {
        let stream = ring.stream(direction);
        info!(
            ?direction,
            producer = stream.producer(),
            consumer = stream.consumer(),
            capacity = stream.capacity(),
            "cursors"
        );
    }
    Ok(())
}
