//! CLI entry point for flyscan
//!
//! Provides command-line access to:
//! - a complete fly scan on simulated hardware
//! - retrieval of the last capture from a configured box over scp
//! - decoding of a streamed `.bin`/`.txt` pair
//! - configuration checking
//!
//! # Usage
//!
//! ```bash
//! flyscan simulate --duration 2s --resolve
//! flyscan fetch apb_stream
//! flyscan decode /data/apb/2024/03/07/<uuid>.bin
//! flyscan --config config/flyscan.toml check-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use flyscan::config::{DetectorDefinition, FlyscanConfig, DEFAULT_CONFIG_PATH};
use flyscan::decoder::{self, ApbSettings};
use flyscan::detector::{run_paths, DetectorSettings, StreamingDetector};
use flyscan::flyer::FlyOrchestrator;
use flyscan::hardware::apb::NUM_CHANNELS;
use flyscan::hardware::mock::{write_stream_files, MockApb, MockPositioner, ResponderBehavior};
use flyscan::ledger::new_uid;
use flyscan::plan::run_fly_scan;
use flyscan::records::{now_secs, CachingResolver, FileResolver, RecordResolver};
use flyscan::sampling::{derive_sample_target, TrajectorySampleCount};
use flyscan::telemetry;
use flyscan::transfer::{FetchRequest, LocalMirrorFetcher, RemoteFileFetcher, ScpFetcher};

// Use mimalloc for improved allocation performance in multi-threaded scenarios
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Sample rate reported by simulated boxes.
const SIMULATED_RATE_KHZ: f64 = 10.0;

#[derive(Parser)]
#[command(name = "flyscan")]
#[command(about = "Fly-scan orchestration for streaming acquisition boxes", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a complete fly scan against simulated hardware and print the documents
    Simulate {
        /// Trajectory duration
        #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
        duration: Duration,

        /// Local data root (defaults to acquisition.root_path)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Decode every collected record after the scan
        #[arg(long)]
        resolve: bool,
    },

    /// Copy the last capture of a configured box into the data root and decode it
    Fetch {
        /// Detector name (defaults to the first configured detector)
        detector: Option<String>,

        /// Number of rows to print
        #[arg(long, default_value_t = 5)]
        head: usize,
    },

    /// Decode a stream file and print a summary
    Decode {
        /// Path to the `.bin` file; the `.txt` sibling must exist
        path: PathBuf,

        /// Number of rows to print
        #[arg(long, default_value_t = 5)]
        head: usize,
    },

    /// Load and validate the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FlyscanConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Err(e) = config.validate() {
        bail!("invalid configuration: {}", e);
    }
    telemetry::init_from_config(&config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Simulate {
            duration,
            root,
            resolve,
        } => simulate(config, duration, root, resolve).await,
        Commands::Fetch { detector, head } => fetch(&config, detector.as_deref(), head).await,
        Commands::Decode { path, head } => decode_file(path, head),
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn simulate(
    mut config: FlyscanConfig,
    duration: Duration,
    root: Option<PathBuf>,
    resolve: bool,
) -> Result<()> {
    if let Some(root) = root {
        config.acquisition.root_path = root;
    }
    if config.detectors.is_empty() {
        config.detectors.push(DetectorDefinition {
            name: "apb_stream".to_string(),
            prefix: "XF:08IDB-CT{PBA:1}:".to_string(),
            host: "10.8.0.19".to_string(),
        });
    }

    let points = (duration.as_secs_f64() * config.sampling.lut_clock_hz).round() as u64;
    let rows = derive_sample_target(points, SIMULATED_RATE_KHZ, &config.sampling)? as usize;
    let positioner = Arc::new(MockPositioner::timed("hhm", duration).with_trajectory(points));

    let mirror = LocalMirrorFetcher::new(config.acquisition.root_path.join("mirror"));
    let fetcher = Arc::new(mirror.clone());
    let settings = DetectorSettings::from_config(&config);

    let mut responders = Vec::new();
    let mut detectors = Vec::new();
    for definition in &config.detectors {
        let apb = MockApb::new(&definition.prefix, SIMULATED_RATE_KHZ);
        responders.push(apb.spawn_responder(ResponderBehavior {
            start_latency: Duration::from_millis(10),
            idle_on_stop: true,
            ..Default::default()
        }));

        let mut stream_settings = ApbSettings::new(NUM_CHANNELS, SIMULATED_RATE_KHZ);
        stream_settings.trigger_timestamp = now_secs();
        write_stream_files(
            &mirror.remote_path(&definition.host, &config.transfer.remote_bin_path),
            &mirror.remote_path(&definition.host, &config.transfer.remote_txt_path),
            &stream_settings,
            rows,
        )?;

        let device = Arc::new(apb.device(&definition.name, &definition.host));
        let samples = Arc::new(TrajectorySampleCount::new(
            positioner.clone(),
            config.sampling,
        ));
        detectors.push(Arc::new(StreamingDetector::new(
            device,
            fetcher.clone(),
            samples,
            settings.clone(),
        )));
    }

    let mut detectors = detectors.into_iter();
    let Some(primary) = detectors.next() else {
        bail!("no detectors configured");
    };
    let mut flyer = FlyOrchestrator::new(primary, positioner.clone())
        .with_watchdog(config.acquisition.watchdog);
    for auxiliary in detectors {
        flyer = flyer.with_auxiliary(auxiliary);
    }

    info!(flyer = %flyer.name(), ?duration, rows, "starting simulated fly scan");
    let output = run_fly_scan(&flyer).await;
    for responder in &responders {
        responder.abort();
    }
    let output = output?;

    let document = json!({
        "descriptors": output.descriptors,
        "asset_docs": output.asset_docs,
        "records": output.records,
        "reactions": flyer
            .reactions()
            .iter()
            .map(|r| json!({"trigger": r.trigger, "actions": r.actions}))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&document)?);

    if resolve {
        let resolver = CachingResolver::new(FileResolver::from_documents(&output.asset_docs));
        for record in &output.records {
            for reference in record.refs() {
                let run = resolver.resolve(&reference.datum_id).await?;
                let (rows, columns) = run.table.shape();
                println!(
                    "{} {} -> {} rows x {} columns",
                    reference.field, reference.datum_id, rows, columns
                );
            }
        }
    }
    Ok(())
}

async fn fetch(config: &FlyscanConfig, detector: Option<&str>, head: usize) -> Result<()> {
    let definition = match detector {
        Some(name) => config.detectors.iter().find(|d| d.name == name),
        None => config.primary_detector(),
    };
    let Some(definition) = definition else {
        bail!("no detector '{}' configured", detector.unwrap_or_default());
    };

    let (local_bin, local_txt) = run_paths(&config.acquisition.root_path, Local::now(), &new_uid());
    let request = FetchRequest {
        host: definition.host.clone(),
        user: config.transfer.user.clone(),
        remote_bin: config.transfer.remote_bin_path.clone(),
        remote_txt: config.transfer.remote_txt_path.clone(),
        local_bin: local_bin.clone(),
        local_txt,
    };

    let fetcher = ScpFetcher::from_config(&config.transfer);
    info!(detector = %definition.name, host = %definition.host, "fetching last capture");
    fetcher
        .fetch(&request)
        .await
        .with_context(|| format!("failed to fetch from {}", definition.name))?;
    decode_file(local_bin, head)
}

fn decode_file(path: PathBuf, head: usize) -> Result<()> {
    let run = decoder::decode(&path)?;
    let (rows, columns) = run.table.shape();
    println!("file:        {}", path.display());
    println!("shape:       ({}, {})", rows, columns);
    println!("channels:    {}", run.settings.num_channels);
    println!("rate (kHz):  {}", run.settings.sample_rate_khz);
    println!("divider:     {}", run.settings.clock_divider);
    println!("trigger:     {}", run.settings.trigger_timestamp);
    println!("{}", run.table.column_names().join("\t"));
    for index in 0..head.min(rows) {
        if let Some(row) = run.table.row(index) {
            let cells: Vec<String> = row.iter().map(|v| format!("{:.6}", v)).collect();
            println!("{}", cells.join("\t"));
        }
    }
    Ok(())
}
