use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use glam::Vec3;
use realmstream_catalog::{CatalogClient, HttpCatalog, InMemoryCatalog};
use realmstream_common::{CellCoord, Transform};
use realmstream_stream::{
    LogSink, ReadinessOutcome, StreamConfig, StreamServices, Streamer, TickingCellFactory,
};
use realmstream_tools::StreamInspector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

const DEMO_REALM: &str = "demo";
const DEMO_BASE: &str = "mem://demo";

#[derive(Parser)]
#[command(name = "realmstream-cli", about = "CLI tool for realmstream operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML stream configuration; REALMSTREAM_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Milliseconds between scheduler ticks
    #[arg(long, default_value = "16", global = true)]
    tick_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate info and the effective configuration
    Info,
    /// Walk an observer through a generated in-memory world
    Simulate {
        /// Number of ticks to run
        #[arg(short, long, default_value = "300")]
        ticks: u64,
        /// Half-width of the generated world, in cells
        #[arg(short, long, default_value = "12")]
        extent: i32,
        /// Observer speed in world units per tick
        #[arg(short, long, default_value = "1.0")]
        speed: f32,
        /// Simulated catalog latency in milliseconds
        #[arg(long, default_value = "20")]
        latency_ms: u64,
        /// Print a summary every this many ticks
        #[arg(long, default_value = "60")]
        report_every: u64,
    },
    /// Stream a generated world, then teleport to a cell and wait for it
    Teleport {
        /// Target cell as "x,z"
        #[arg(allow_hyphen_values = true)]
        target: CellCoord,
        /// Half-width of the generated world, in cells
        #[arg(short, long, default_value = "12")]
        extent: i32,
        /// Ticks to stream before teleporting
        #[arg(long, default_value = "60")]
        warmup: u64,
    },
    /// Connect to a live realm over HTTP and stream around a position
    Connect {
        /// Realm URL (its /about endpoint describes the realm)
        realm: String,
        /// Observer cell as "x,z"
        #[arg(long, default_value = "0,0", allow_hyphen_values = true)]
        at: CellCoord,
        /// Number of ticks to run
        #[arg(short, long, default_value = "600")]
        ticks: u64,
        /// HTTP request timeout in seconds
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = StreamConfig::load(cli.config.as_deref()).context("loading stream config")?;
    let tick = Duration::from_millis(cli.tick_ms.max(1));

    match cli.command {
        Commands::Info => {
            println!("realmstream-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", realmstream_common::crate_info());
            println!("catalog: {}", realmstream_catalog::crate_info());
            println!("stream: {}", realmstream_stream::crate_info());
            println!("tools: {}", realmstream_tools::crate_info());
            println!(
                "config: cell_size={} load_radius={} budget={} lods={}/{} policy={:?} buckets={:?}",
                config.cell_size,
                config.load_radius,
                config.admission_budget,
                config.lod_budget,
                config.reduced_lod_budget,
                config.saturation_policy,
                config.sqr_distance_buckets
            );
        }
        Commands::Simulate {
            ticks,
            extent,
            speed,
            latency_ms,
            report_every,
        } => {
            let catalog = demo_catalog(extent, latency_ms);
            let cell_size = config.cell_size;
            let mut streamer = connect(catalog, config, DEMO_REALM, CellCoord::ORIGIN);
            println!("Simulating {ticks} ticks over a {0}x{0} world", extent * 2 + 1);

            let mut interval = tokio::time::interval(tick);
            let heading = Vec3::new(1.0, 0.0, 0.35).normalize();
            for i in 1..=ticks {
                interval.tick().await;
                let observer = streamer.observer();
                let position = observer.position + heading * speed;
                streamer.set_observer(Transform::looking(position, heading));
                streamer.tick();
                if i % report_every.max(1) == 0 {
                    println!("{}", StreamInspector::summary(&streamer.snapshot()));
                }
            }

            let snapshot = streamer.snapshot();
            println!("\n{}", StreamInspector::summary(&snapshot));
            println!(
                "tick time: mean={:?} worst={:?} over {} samples",
                streamer.timer().mean(),
                streamer.timer().worst(),
                streamer.timer().samples()
            );
            let observer_cell = CellCoord::from_position(snapshot.observer.position, cell_size);
            for info in StreamInspector::list_cells(&snapshot).iter().take(12) {
                println!("  {info}");
            }
            println!("observer cell: {observer_cell}");
            streamer.shutdown();
        }
        Commands::Teleport {
            target,
            extent,
            warmup,
        } => {
            let catalog = demo_catalog(extent, 20);
            let mut streamer = connect(catalog, config, DEMO_REALM, CellCoord::ORIGIN);
            let mut interval = tokio::time::interval(tick);
            for _ in 0..warmup {
                interval.tick().await;
                streamer.tick();
            }
            println!("Before: {}", StreamInspector::summary(&streamer.snapshot()));

            let mut report = streamer.teleport_to(target)?;
            println!("Teleporting to {target}");
            let outcome = loop {
                if let Some(outcome) = report.try_outcome() {
                    break outcome;
                }
                tokio::select! {
                    outcome = report.wait() => break outcome,
                    _ = interval.tick() => {
                        streamer.tick();
                    }
                }
            };
            match &outcome {
                ReadinessOutcome::Succeeded => println!("Teleport succeeded"),
                ReadinessOutcome::Cancelled => println!("Teleport cancelled"),
                ReadinessOutcome::Failed(e) => println!("Teleport failed: {e}"),
            }
            let snapshot = streamer.snapshot();
            println!("After: {}", StreamInspector::summary(&snapshot));
            if let Some(info) = StreamInspector::inspect_cell(&snapshot, target) {
                println!("  {info}");
            }
            streamer.shutdown();
            if let ReadinessOutcome::Failed(e) = outcome {
                bail!("teleport to {target} failed: {e}");
            }
        }
        Commands::Connect {
            realm,
            at,
            ticks,
            timeout_secs,
        } => {
            let catalog = HttpCatalog::with_timeout(Duration::from_secs(timeout_secs))
                .context("building HTTP client")?;
            let mut streamer = connect(Arc::new(catalog), config, &realm, at);
            let mut interval = tokio::time::interval(tick);
            for i in 1..=ticks {
                interval.tick().await;
                streamer.tick();
                if i % 60 == 0 {
                    println!("{}", StreamInspector::summary(&streamer.snapshot()));
                }
            }
            if !streamer.is_connected() {
                bail!("could not connect to realm {realm}");
            }
            let snapshot = streamer.snapshot();
            for info in StreamInspector::list_cells(&snapshot) {
                println!("  {info}");
            }
            streamer.shutdown();
        }
    }

    Ok(())
}

fn demo_catalog(extent: i32, latency_ms: u64) -> Arc<InMemoryCatalog> {
    let catalog = InMemoryCatalog::with_grid_world(DEMO_REALM, DEMO_BASE, extent);
    catalog.set_latency(Duration::from_millis(latency_ms));
    Arc::new(catalog)
}

/// Build a streamer on the current runtime, place the observer and start
/// connecting to `realm`.
fn connect(
    catalog: Arc<dyn CatalogClient>,
    config: StreamConfig,
    realm: &str,
    at: CellCoord,
) -> Streamer {
    let runtime = Handle::current();
    let services = StreamServices {
        factory: Arc::new(TickingCellFactory::new(runtime.clone())),
        runtime,
        catalog,
        sink: Arc::new(LogSink),
        config: Arc::new(config),
    };
    let position = at.center(services.config.cell_size) + Vec3::Y * 1.7;
    let mut streamer = Streamer::new(services);
    streamer.set_observer(Transform::from_position(position));
    streamer.change_realm(realm);
    streamer
}
