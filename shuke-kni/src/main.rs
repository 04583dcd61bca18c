use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use shuke_kni::ingress::spawn_ingress;
use shuke_kni::port::RawSocketPorts;
use shuke_kni::vif::TapBackend;
use shuke_kni::{BridgeConfig, KniBridge, ShutdownToken};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shuke-kni")]
#[command(about = "Bridge physical ports to kernel virtual interfaces")]
struct Args {
    /// Bridge configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Network device backing a port, in port-id order
    #[arg(short, long = "device", required = true)]
    devices: Vec<String>,

    /// How often kernel requests on the virtual interfaces are serviced
    #[arg(long, default_value_t = 100)]
    request_interval_ms: u64,

    /// Stats log period, 0 disables
    #[arg(long, default_value_t = 10)]
    stats_interval_secs: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("shuke_kni=info".parse()?))
        .init();

    let args = Args::parse();

    let config = BridgeConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let ports = Arc::new(RawSocketPorts::open(&args.devices).context("opening network devices")?);

    let shutdown = ShutdownToken::new();
    let mut bridge = KniBridge::init(
        config,
        ports.clone(),
        Arc::new(TapBackend),
        shutdown.clone(),
    )
    .context("initialising KNI bridge")?;

    // A worker that cannot be launched is fatal
    if let Err(e) = bridge.start_workers() {
        bridge.shutdown();
        bail!("launching egress workers: {e}");
    }

    let mut ingress = Vec::new();
    for port in &bridge.config().ports {
        let Some(path) = bridge.ingress(port.port_id) else {
            continue;
        };
        let handle = spawn_ingress(
            path,
            ports.clone(),
            Arc::clone(&bridge.context().pool),
            shutdown.clone(),
        )
        .with_context(|| format!("spawning ingress worker for port {}", port.port_id))?;
        ingress.push(handle);
    }

    info!(
        workers = bridge.running_workers(),
        ports = bridge.config().ports.len(),
        "Bridge running"
    );

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let mut requests =
        tokio::time::interval(Duration::from_millis(args.request_interval_ms.max(1)));
    let mut stats = tokio::time::interval(Duration::from_secs(args.stats_interval_secs.max(1)));
    stats.tick().await;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = requests.tick() => {
                bridge.handle_requests();
            }
            _ = stats.tick(), if args.stats_interval_secs > 0 => {
                for snap in bridge.stats() {
                    info!(
                        port_id = snap.port_id,
                        rx_packets = snap.rx_packets,
                        rx_dropped = snap.rx_dropped,
                        tx_packets = snap.tx_packets,
                        tx_dropped = snap.tx_dropped,
                        "Port stats"
                    );
                }
            }
        }
    }

    shutdown.trigger();
    for handle in ingress {
        if handle.join().is_err() {
            error!("Ingress worker panicked");
        }
    }
    bridge.shutdown();

    for snap in bridge.stats() {
        info!(
            port_id = snap.port_id,
            rx_packets = snap.rx_packets,
            rx_dropped = snap.rx_dropped,
            tx_packets = snap.tx_packets,
            tx_dropped = snap.tx_dropped,
            "Final port stats"
        );
    }
    info!("Bridge stopped");
    Ok(())
}
