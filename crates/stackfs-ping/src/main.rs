//! PING/PONG echo over the stackfs socket or RDMA transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver};
use stackfs_transport::{
    init, EventPool, EventPoolConfig, Notification, Transport, TransportConfig, TransportContext,
    TransportEvent,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "stackfs-ping")]
#[command(about = "Echo frames over a stackfs transport", long_about = None)]
struct Cli {
    /// Transport type: socket, tcp, rdma or ib-verbs.
    #[arg(short, long, default_value = "socket", env = "STACKFS_TRANSPORT")]
    transport: String,

    /// Extra transport option, `key=value`. May be repeated.
    #[arg(short = 'o', long = "option", value_parser = parse_option)]
    options: Vec<(String, String)>,

    /// Event pool worker threads.
    #[arg(long, default_value = "2")]
    threads: usize,

    /// Print a JSON metrics snapshot on exit.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer every PING with a PONG carrying the same payload.
    Serve {
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(short, long)]
        port: Option<u16>,
        /// Exit after this many frames; 0 serves forever.
        #[arg(short = 'n', long, default_value = "0")]
        frames: u64,
    },
    /// Send PINGs and wait for each PONG.
    Ping {
        host: String,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short = 'n', long, default_value = "10")]
        count: u64,
        /// Payload bytes carried by each PING.
        #[arg(short, long, default_value = "0")]
        size: usize,
        #[arg(long, default_value = "5")]
        timeout_secs: u64,
    },
}

fn parse_option(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got `{s}`"))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut options: BTreeMap<String, String> = cli.options.iter().cloned().collect();
    options.insert("transport-type".into(), cli.transport.clone());
    match &cli.command {
        Command::Serve { bind, port, .. } => {
            options.insert("transport.socket.bind-address".into(), bind.clone());
            if let Some(port) = port {
                options.insert("transport.socket.listen-port".into(), port.to_string());
            }
        }
        Command::Ping { host, port, .. } => {
            options.insert("remote-host".into(), host.clone());
            if let Some(port) = port {
                options.insert("remote-port".into(), port.to_string());
            }
        }
    }
    let config = TransportConfig::from_options(&options).context("invalid transport options")?;

    let pool = Arc::new(EventPool::new(EventPoolConfig {
        threads: cli.threads,
        ..Default::default()
    })?);
    pool.start()?;
    let ctx = TransportContext::new(pool.clone());

    let result = match cli.command {
        Command::Serve { frames, .. } => serve(&ctx, config, frames),
        Command::Ping {
            count,
            size,
            timeout_secs,
            ..
        } => ping(&ctx, config, count, size, Duration::from_secs(timeout_secs)),
    };

    if cli.metrics {
        println!("{}", serde_json::to_string_pretty(&ctx.metrics().snapshot())?);
    }
    pool.shutdown();
    result
}

fn serve(ctx: &TransportContext, config: TransportConfig, limit: u64) -> Result<()> {
    let (tx, rx) = unbounded();
    let listener = init(ctx, config, Arc::new(tx))?;
    listener.listen().context("listen failed")?;
    info!(addr = %listener.local_info(), kind = ?listener.kind(), "serving");

    let mut served = 0u64;
    while limit == 0 || served < limit {
        let n = rx
            .recv()
            .map_err(|_| anyhow!("notification channel closed"))?;
        match n.event {
            TransportEvent::ChildUp => info!(peer = %n.transport.peer_info(), "client connected"),
            TransportEvent::ChildDown => info!(peer = %n.transport.peer_info(), "client gone"),
            TransportEvent::PollErr => warn!(peer = %n.transport.peer_info(), "connection error"),
            TransportEvent::PollOut => {}
            TransportEvent::PollIn => loop {
                let frame = match n.transport.receive() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %n.transport.peer_info(), error = %e, "receive failed");
                        break;
                    }
                };
                debug!(header = frame.header.len(), payload = frame.payload.len(), "frame");
                let payload = if frame.payload.is_empty() {
                    Vec::new()
                } else {
                    vec![frame.payload]
                };
                let pong = Bytes::from_static(b"PONG");
                if let Err(e) = n.transport.submit(pong, payload, None) {
                    warn!(peer = %n.transport.peer_info(), error = %e, "reply failed");
                    break;
                }
                served += 1;
            }
        }
    }
    listener.disconnect()?;
    Ok(())
}

fn wait_for(
    rx: &Receiver<Notification>,
    t: &Arc<dyn Transport>,
    want: TransportEvent,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let n = rx
            .recv_timeout(left)
            .map_err(|_| anyhow!("timed out waiting for {want:?}"))?;
        if !Arc::ptr_eq(&n.transport, t) {
            continue;
        }
        match n.event {
            e if e == want => return Ok(()),
            TransportEvent::PollErr | TransportEvent::ChildDown => {
                bail!("connection to {} lost", t.peer_info())
            }
            _ => {}
        }
    }
}

fn ping(
    ctx: &TransportContext,
    config: TransportConfig,
    count: u64,
    size: usize,
    timeout: Duration,
) -> Result<()> {
    let (tx, rx) = unbounded();
    let client = init(ctx, config, Arc::new(tx))?;
    client.connect().context("connect failed")?;
    wait_for(&rx, &client, TransportEvent::ChildUp, timeout)?;
    info!(peer = %client.peer_info(), "connected");

    let payload = Bytes::from(vec![0x5au8; size]);
    let mut total = Duration::ZERO;
    let mut worst = Duration::ZERO;
    for seq in 0..count {
        let chunks = if size == 0 {
            Vec::new()
        } else {
            vec![payload.clone()]
        };
        let started = Instant::now();
        client.submit(Bytes::from_static(b"PING"), chunks, None)?;
        let frame = loop {
            if let Some(frame) = client.receive()? {
                break frame;
            }
            wait_for(&rx, &client, TransportEvent::PollIn, timeout)?;
        };
        let rtt = started.elapsed();
        if &frame.header[..] != b"PONG" || frame.payload.len() != size {
            bail!(
                "unexpected reply to PING {seq}: {} byte header, {} byte payload",
                frame.header.len(),
                frame.payload.len()
            );
        }
        println!(
            "PONG from {}: seq={seq} time={:.3} ms",
            client.peer_info(),
            rtt.as_secs_f64() * 1e3
        );
        total += rtt;
        worst = worst.max(rtt);
    }

    if count > 0 {
        let avg = total / u32::try_from(count).unwrap_or(u32::MAX);
        println!(
            "{count} frames, avg {:.3} ms, max {:.3} ms",
            avg.as_secs_f64() * 1e3,
            worst.as_secs_f64() * 1e3
        );
    }
    client.disconnect()?;
    Ok(())
}
