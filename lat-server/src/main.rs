//! Composition root: parses the CLI surface, loads configuration, wires
//! C1 through C12 and the external collaborator shims together, and drives
//! the single-threaded event loop (§5).

mod batch;
mod clock;
mod config;
mod distance_filter;
mod distance_model;
mod engine;
mod error;
mod grid;
mod ground_truth;
mod locmod;
mod net;
mod position_filter;
mod replay;
mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use batch::{BatchAssembler, TagOrder};
use clock::Clock;
use config::{Config, LocmodConfig};
use ground_truth::GroundTruthTracker;
use net::estimate_sink::EstimateSink;
use net::operator::{self, OperatorMessage};
use net::reading_source::ReadingSource;
use replay::ReplayDriver;
use store::Store;

#[derive(Parser)]
#[command(name = "lat-frontend", about = "Real-time indoor localization pipeline")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    locmod_config: Option<PathBuf>,
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(long)]
    location_port: Option<u16>,
    #[arg(long)]
    lat_port: Option<u16>,
    #[arg(long)]
    ifd_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Re-run the stored measurement history through a fresh locmod (C11).
    Replay {
        #[arg(long)]
        experiment: PathBuf,
        #[arg(long)]
        configuration_id: Option<u32>,
        #[arg(long)]
        locmod_config: PathBuf,
    },
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder.with_writer(std::sync::Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// Offline-observed distance errors (`measured - true`), one f64 per line,
/// read from `<working_dir>/errors.csv` — the Rust-native stand-in for the
/// source's `errors.pickle` calibration dump.
fn load_histogram_errors(working_dir: &Path) -> anyhow::Result<Vec<f64>> {
    let path = working_dir.join("errors.csv");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading calibration errors from {}", path.display()))?;
    let errors: Vec<f64> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("parsing calibration errors in {}", path.display()))?;
    anyhow::ensure!(!errors.is_empty(), "{} contained no samples", path.display());
    Ok(errors)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    if !cli.working_dir.is_dir() {
        error!(path = %cli.working_dir.display(), "working directory does not exist");
        std::process::exit(1);
    }

    let result = match &cli.command {
        Some(Command::Replay {
            experiment,
            configuration_id,
            locmod_config,
        }) => run_replay(experiment, *configuration_id, locmod_config).await,
        None => run_pipeline(&cli).await,
    };

    if let Err(err) = result {
        error!(%err, "fatal error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_replay(
    experiment: &Path,
    configuration_id: Option<u32>,
    locmod_config_path: &Path,
) -> anyhow::Result<()> {
    let locmod_config = LocmodConfig::load_file(locmod_config_path)
        .with_context(|| format!("loading locmod config {}", locmod_config_path.display()))?;
    let store = Store::open(experiment)
        .await
        .context("opening experiment store")?;
    let histogram_errors =
        load_histogram_errors(experiment.parent().unwrap_or_else(|| Path::new(".")))?;

    let mut driver = ReplayDriver::new(
        &store,
        &locmod_config,
        "replay",
        &histogram_errors,
        configuration_id,
    )
    .await
    .context("building replay driver")?;
    let written = driver.run().await.context("running replay")?;
    info!(written, configuration_id = driver.configuration_id(), "replay complete");
    Ok(())
}

async fn run_pipeline(cli: &Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.working_dir.join("config.txt"));
    let locmod_config_path = cli
        .locmod_config
        .clone()
        .unwrap_or_else(|| cli.working_dir.join("locmod.txt"));

    let config = Config::load_file(&config_path)
        .with_context(|| format!("loading configuration {}", config_path.display()))?;
    let locmod_config = LocmodConfig::load_file(&locmod_config_path)
        .with_context(|| format!("loading locmod configuration {}", locmod_config_path.display()))?;
    let histogram_errors = load_histogram_errors(&cli.working_dir)?;

    let clock = Clock::new();
    let anchors: Vec<lat_types::Anchor> = config.anchors.values().copied().collect();
    let mut locmod = locmod::build(&locmod_config, anchors.clone(), clock.clone(), &histogram_errors, None);

    let store_path = cli.working_dir.join("experiment.db");
    let store = Store::open(&store_path)
        .await
        .with_context(|| format!("opening experiment store {}", store_path.display()))?;
    for anchor in &anchors {
        store.add_anchor(anchor.id, (anchor.x, anchor.y)).await?;
    }
    let configuration_id = store
        .register_configuration("live", &config.text, "live", &locmod_config.text)
        .await?;

    let location_host = if config.location_server_hostname.is_empty() {
        "0.0.0.0".to_string()
    } else {
        config.location_server_hostname.clone()
    };
    let location_port = cli.location_port.unwrap_or(config.location_server_port);
    let lat_host = if config.lat_server_hostname.is_empty() {
        "0.0.0.0".to_string()
    } else {
        config.lat_server_hostname.clone()
    };
    let lat_port = cli.lat_port.unwrap_or(config.lat_server_port);
    let ifd_port = cli.ifd_port.unwrap_or(config.infield_device_port);

    let anchor_ids: Vec<u32> = anchors.iter().map(|a| a.id).collect();
    let mut reading_source = ReadingSource::connect(
        &format!("{location_host}:{location_port}"),
        &anchor_ids,
        clock.clone(),
    )
    .await
    .context("connecting to distance source")?;
    let mut estimate_sink = EstimateSink::connect(&format!("{lat_host}:{lat_port}"), clock.clone())
        .await
        .context("connecting to estimate sink")?;

    let ifd_listener = tokio::net::TcpListener::bind(("0.0.0.0", ifd_port))
        .await
        .with_context(|| format!("binding infield device port {ifd_port}"))?;
    info!(ifd_port, "operator event socket listening");

    let mut assembler = BatchAssembler::new();
    let mut tracker = GroundTruthTracker::new();
    let mut operator_clients: Vec<(tokio::net::TcpStream, String)> = Vec::new();
    let reference_labels: Vec<String> = config.reference_points.keys().cloned().collect();
    let reference_points = config.reference_points.clone();
    let tag_ids = config.tag_ids.clone();

    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, flushing store");
                store.append_ground_truth_distances().await.context("flushing ground truth on shutdown")?;
                break;
            }

            accepted = ifd_listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        info!(%addr, "operator client connected");
                        operator_clients.push((stream, String::new()));
                    }
                    Err(err) => warn!(%err, "failed to accept operator connection"),
                }
            }

            polled = reading_source.poll() => {
                match polled {
                    Ok(Some(readings)) => {
                        for reading in &readings {
                            if let Err(err) = store
                                .add_reading(reading.anchor_id, reading.tag_id, reading.distance, reading.timestamp, None)
                                .await
                            {
                                warn!(%err, "failed persisting reading");
                            }
                        }
                        let (readings, dropped) = batch::most_recent(&readings, TagOrder::default());
                        if dropped > 0 {
                            warn!(dropped, "dropped stale readings under back-pressure");
                        }
                        for reading in readings {
                            if let Some(round) = assembler.push(reading) {
                                locmod.add_reading_batch(&round);
                                let locations = locmod.update_locations(&[round.tag_id]);
                                if let Some(&point) = locations.get(&round.tag_id) {
                                    persist_estimate(&store, configuration_id, round.tag_id, point, round.timestamp, &clock).await;
                                }
                                if let Err(err) = estimate_sink.publish(&locations).await {
                                    warn!(%err, "failed publishing estimates");
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("distance source disconnected");
                    }
                    Err(err) => warn!(%err, "error polling distance source"),
                }
            }

            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }

        poll_operator_clients(
            &mut operator_clients,
            &store,
            &mut tracker,
            &clock,
            &tag_ids,
            &reference_labels,
            &reference_points,
        )
        .await;
    }

    Ok(())
}

async fn persist_estimate(
    store: &Store,
    configuration_id: u32,
    tag_id: u32,
    point: (f64, f64),
    timestamp: f64,
    clock: &Clock,
) {
    let ground_truth = match store.ground_truth(tag_id, clock.now()).await {
        Ok(gt) => gt,
        Err(err) => {
            warn!(%err, tag_id, "failed looking up ground truth");
            None
        }
    };
    let error = ground_truth.map(|gt| lat_types::euclid(point, gt));
    if let Err(err) = store
        .add_estimate(Some(configuration_id), tag_id, point, timestamp, None, error)
        .await
    {
        warn!(%err, tag_id, "failed persisting estimate");
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_operator_clients(
    clients: &mut Vec<(tokio::net::TcpStream, String)>,
    store: &Store,
    tracker: &mut GroundTruthTracker,
    clock: &Clock,
    tag_ids: &[u32],
    reference_labels: &[String],
    reference_points: &std::collections::HashMap<String, (f64, f64)>,
) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut closed = Vec::new();
    for (idx, (stream, buffer)) in clients.iter_mut().enumerate() {
        let mut chunk = [0u8; 1024];
        match stream.try_read(&mut chunk) {
            Ok(0) => closed.push(idx),
            Ok(n) => {
                buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let reply = handle_operator_line(
                        &line,
                        store,
                        tracker,
                        clock,
                        tag_ids,
                        reference_labels,
                        reference_points,
                    )
                    .await;
                    if let Some(reply) = reply {
                        let _ = stream.write_all(format!("{reply}\r\n").as_bytes()).await;
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!(%err, "operator client read error");
                closed.push(idx);
            }
        }
    }
    for idx in closed.into_iter().rev() {
        clients.remove(idx);
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_operator_line(
    line: &str,
    store: &Store,
    tracker: &mut GroundTruthTracker,
    clock: &Clock,
    tag_ids: &[u32],
    reference_labels: &[String],
    reference_points: &std::collections::HashMap<String, (f64, f64)>,
) -> Option<String> {
    match operator::parse_line(line) {
        Ok(OperatorMessage::TagsQuery) => Some(operator::format_tags_reply(tag_ids)),
        Ok(OperatorMessage::ReferenceQuery) => Some(operator::format_reference_reply(reference_labels)),
        Ok(OperatorMessage::Command {
            tag_id,
            reference,
            action,
        }) => {
            let Some(&point) = reference_points.get(&reference) else {
                warn!(reference, tag_id, "command against unconfigured reference point, discarding");
                return None;
            };
            if let Err(err) = tracker
                .handle_event(store, tag_id, clock.now(), &reference, point, action)
                .await
            {
                warn!(%err, tag_id, reference, "failed handling ground-truth event");
            }
            None
        }
        Err(err) => {
            warn!(%err, "malformed operator line, discarding");
            None
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
