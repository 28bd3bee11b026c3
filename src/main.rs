//! subband-proc: correlator/beamformer subband processing engine.
//!
//! Runs a synthetic observation through one `SubbandProc` on the host
//! reference queue. Useful to check that a configuration routes and sizes
//! cleanly and to see what it delivers per block.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use subband_proc::device::host::HostQueue;
use subband_proc::parset::{presets, ObservationSettings, SapSettings};
use subband_proc::pipeline::{run, OutputData, OutputSink, RunnerConfig, SubbandProc, SyntheticSource};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Correlator,
    Beamformer,
    Combined,
}

/// Subband processing engine, driven by synthetic input.
#[derive(Parser, Debug)]
#[command(
    name = "subband-proc",
    about = "Correlator/beamformer subband processing on synthetic input",
    version
)]
struct Cli {
    /// Observation settings as JSON; overrides --preset.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Built-in observation to run when no --config is given.
    #[arg(short, long, value_enum, default_value_t = Preset::Combined)]
    preset: Preset,

    /// Stations for the built-in presets.
    #[arg(long, default_value_t = 4)]
    stations: usize,

    /// Blocks per subband.
    #[arg(short = 'n', long, default_value_t = 8)]
    blocks: u64,

    /// Subbands handled concurrently by the processor.
    #[arg(short, long, default_value_t = 1)]
    subbands: usize,

    /// Seed of the synthetic input.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Probability that a station has a flagged stretch in a block.
    #[arg(long, default_value_t = 0.0)]
    flag_fraction: f64,

    /// Print processor statistics as JSON when done.
    #[arg(long, default_value_t = false)]
    stats: bool,
}

/// Logs a line per delivered block.
#[derive(Default)]
struct LogSink {
    coherent: u64,
    incoherent: u64,
    correlated: u64,
}

impl OutputSink for LogSink {
    fn write(&mut self, output: &OutputData) -> anyhow::Result<()> {
        self.coherent += output.emit_coherent as u64;
        self.incoherent += output.emit_incoherent as u64;
        self.correlated += output.emit_correlated as u64;
        tracing::debug!(
            "{}: coherent {:?}, incoherent {:?}, visibilities {:?}",
            output.block,
            output.emit_coherent.then(|| output.coherent.shape()),
            output.emit_incoherent.then(|| output.incoherent.shape()),
            output.emit_correlated.then(|| output.correlated.visibilities.dim()),
        );
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        tracing::info!(
            "delivered: {} coherent, {} incoherent, {} correlated",
            self.coherent,
            self.incoherent,
            self.correlated
        );
    }
}

fn settings_from(cli: &Cli) -> anyhow::Result<ObservationSettings> {
    let mut settings = match &cli.config {
        Some(path) => ObservationSettings::from_json_file(path)?,
        None => match cli.preset {
            Preset::Correlator => presets::correlator(cli.stations, 64),
            Preset::Beamformer => presets::beam_former(
                cli.stations,
                vec![
                    SapSettings {
                        nr_coherent_tabs: 2,
                        nr_incoherent_tabs: 1,
                    },
                    SapSettings {
                        nr_coherent_tabs: 1,
                        nr_incoherent_tabs: 0,
                    },
                ],
            ),
            Preset::Combined => presets::combined(cli.stations),
        },
    };
    settings.nr_subbands_per_subband_proc = cli.subbands;
    Ok(settings)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    tracing::info!("subband-proc v{}", env!("CARGO_PKG_VERSION"));

    let settings = settings_from(&cli)?;
    tracing::info!(
        "{} stations, {} subbands, block size {}, {}-bit",
        settings.nr_stations,
        settings.subbands.len(),
        settings.block_size,
        settings.nr_bits_per_sample,
    );

    let mut proc = SubbandProc::new(settings.clone(), HostQueue::new())
        .context("failed to build the subband processor")?;
    tracing::info!(
        "device memory: {} bytes",
        proc.queue().allocated_bytes()
    );

    let subbands: Vec<usize> = (0..cli.subbands).collect();
    let source = SyntheticSource::new(&settings, subbands, cli.blocks, cli.seed)?
        .with_flag_fraction(cli.flag_fraction);

    let summary = run(&mut proc, source, LogSink::default(), &RunnerConfig::default())?;
    tracing::info!(
        "{} blocks, {} emitted, {} dropped, {} starved, {} non-final",
        summary.blocks,
        summary.emitted,
        summary.dropped,
        summary.starved,
        summary.non_final
    );

    if cli.stats {
        let report = proc.stats().report();
        println!("{}", serde_json::to_string_pretty(&report)?);
        for stage in &report.stages {
            tracing::info!(
                "{}: mean {:.2} ms, p99 {:.2} ms, max {:.2} ms",
                stage.stage,
                stage.mean_ms,
                stage.p99_ms,
                stage.max_ms
            );
        }
    }

    tracing::info!("Done.");
    Ok(())
}
