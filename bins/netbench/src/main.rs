mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use netbench_rdma::{select_device, RcConfig, RcTransport};
use netbench_transport::{LocalCollective, LoopbackTransport, StopFlag, Transport};
use netbench_types::PeerId;
use netbench_verbs::{SoftDevice, SoftFabric};

use crate::config::BenchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Reliable connection over the in-process verbs fabric.
    Rc,
    /// In-process channels.
    Loopback,
}

/// Two-rank ping-pong latency benchmark
#[derive(Parser, Debug)]
#[command(name = "netbench", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transport under test
    #[arg(short, long, value_enum, default_value_t = TransportKind::Rc)]
    transport: TransportKind,

    /// Message size in bytes
    #[arg(short, long, default_value_t = 4096)]
    size: usize,

    /// Number of round trips
    #[arg(short, long, default_value_t = 1000)]
    iterations: u32,
}

/// What one rank thread needs to build its transport.
enum RankSetup {
    Rc {
        devices: Vec<Arc<SoftDevice>>,
        collective: LocalCollective,
        config: RcConfig,
    },
    Loopback(LoopbackTransport),
}

impl RankSetup {
    fn into_transport(self, stop: StopFlag) -> anyhow::Result<Box<dyn Transport>> {
        Ok(match self {
            RankSetup::Rc {
                devices,
                collective,
                config,
            } => {
                let device = select_device(&devices, &config)?;
                Box::new(RcTransport::new(device, config, &collective, stop)?)
            }
            RankSetup::Loopback(transport) => Box::new(transport),
        })
    }
}

fn setups(kind: TransportKind, config: &BenchConfig, stop: &StopFlag) -> Vec<RankSetup> {
    match kind {
        TransportKind::Rc => {
            // Every rank gets enough devices for the configured index to exist.
            let fabric = SoftFabric::new();
            let per_rank = config.rdma.device_index + 1;
            LocalCollective::group(2)
                .into_iter()
                .enumerate()
                .map(|(rank, collective)| RankSetup::Rc {
                    devices: (0..per_rank)
                        .map(|index| Arc::new(fabric.open_device(format!("soft_{rank}_{index}"))))
                        .collect(),
                    collective,
                    config: config.rdma.clone(),
                })
                .collect()
        }
        TransportKind::Loopback => LoopbackTransport::group(2, &config.loopback, stop)
            .into_iter()
            .map(RankSetup::Loopback)
            .collect(),
    }
}

/// Bounce one message back and forth; rank 0 returns the mean one-way time.
fn ping_pong(
    transport: &mut dyn Transport,
    size: usize,
    iterations: u32,
) -> anyhow::Result<Option<Duration>> {
    let rank = transport.rank();
    let peer = PeerId(1 - rank.0);
    let mut buf = transport.allocate(size)?;

    if rank == PeerId(0) {
        buf.fill(0xFF);
        let start = Instant::now();
        for _ in 0..iterations {
            transport.send(peer, &buf)?;
            let n = transport.receive(peer, &mut buf)?;
            anyhow::ensure!(n == size, "short receive: {n} of {size} bytes");
        }
        let elapsed = start.elapsed();
        anyhow::ensure!(buf.iter().all(|&b| b == 0xFF), "payload corrupted");
        Ok(Some(elapsed / (2 * iterations.max(1))))
    } else {
        for _ in 0..iterations {
            let n = transport.receive(peer, &mut buf)?;
            anyhow::ensure!(n == size, "short receive: {n} of {size} bytes");
            transport.send(peer, &buf)?;
        }
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = BenchConfig::load(args.config.as_deref())?;
    let _guard = netbench_logging::init_logging(&config.log)?;

    let stop = StopFlag::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received CTRL+C");
            signal_stop.request();
        }
    });

    tracing::info!(
        transport = ?args.transport,
        size = args.size,
        iterations = args.iterations,
        "starting ping-pong"
    );

    let handles: Vec<_> = setups(args.transport, &config, &stop)
        .into_iter()
        .map(|setup| {
            let stop = stop.clone();
            let (size, iterations) = (args.size, args.iterations);
            tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Duration>> {
                let mut transport = setup.into_transport(stop)?;
                let result = ping_pong(transport.as_mut(), size, iterations);
                transport.shutdown();
                result
            })
        })
        .collect();

    let mut latency = None;
    for handle in handles {
        if let Some(mean) = handle.await?? {
            latency = Some(mean);
        }
    }

    if let Some(mean) = latency {
        tracing::info!(
            transport = ?args.transport,
            size = args.size,
            iterations = args.iterations,
            half_round_trip_ns = mean.as_nanos() as u64,
            "ping-pong complete"
        );
    }
    Ok(())
}
