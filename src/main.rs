//! Completion-probability estimation CLI.
//!
//! Runs the beam-search lower bound or a Monte-Carlo estimator against the
//! built-in synthetic model. Real deployments implement `NextTokenOracle`
//! over their own model and call the library directly.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;

use seq_prob::oracle::DemoOracle;
use seq_prob::search::{
    beam_search, importance_sample, uniform_sample, BeamResult, BeamSearchConfig, CoverageKind,
    CoverageTarget, SampleConfig, SampleResult,
};

/// Which estimator to run.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Estimator {
    /// Adaptive-width beam search (deterministic lower bound)
    #[default]
    Beam,
    /// Model-weighted Monte-Carlo sampling
    Importance,
    /// Uniform-proposal Monte-Carlo sampling (no model queries)
    Uniform,
}

impl Estimator {
    fn as_str(self) -> &'static str {
        match self {
            Self::Beam => "beam",
            Self::Importance => "importance",
            Self::Uniform => "uniform",
        }
    }
}

/// Coverage-threshold update rule for beam search.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Coverage {
    /// Constant absolute beam count
    FixedWidth,
    /// Geometric threshold decay
    #[default]
    Backoff,
    /// Linear threshold descent
    Interpolate,
}

impl Coverage {
    fn kind(self) -> CoverageKind {
        match self {
            Self::FixedWidth => CoverageKind::FixedWidth,
            Self::Backoff => CoverageKind::Backoff,
            Self::Interpolate => CoverageKind::Interpolate,
        }
    }
}

/// Output format for results.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable summary
    #[default]
    Plain,
    /// JSON with full per-step records
    Json,
}

/// Estimate the probability mass a sequence model assigns to completions of
/// partially observed token sequences.
#[derive(Debug, Parser)]
#[command(
    name = "seq-prob",
    version,
    about = "Completion-probability estimators for sequence models",
    long_about = "Estimates the probability mass a generative sequence model assigns to \
                  completions of a given target length, via an adaptive-width beam search \
                  (exact lower bound) or importance sampling (Monte-Carlo).\n\n\
                  This binary drives a small built-in synthetic model; library users plug \
                  in their own next-token oracle."
)]
struct Cli {
    /// Histories: comma-separated token ids, semicolon-separated histories
    /// (e.g. "3,7;1,8,2")
    #[arg(index = 1, default_value = "3,7")]
    histories: String,

    /// Target total lengths, one value broadcast or comma-separated per
    /// history (e.g. "6" or "6,8")
    #[arg(short = 'l', long, default_value = "6")]
    total_len: String,

    /// Vocabulary size of the synthetic model
    #[arg(long, default_value = "50")]
    vocab_size: usize,

    /// Hidden width of the synthetic model
    #[arg(long, default_value = "64")]
    hidden_size: usize,

    /// Weight seed of the synthetic model
    #[arg(long, default_value = "7")]
    model_seed: u64,

    /// Estimator to run
    #[arg(short, long, value_enum, default_value = "beam")]
    estimator: Estimator,

    /// Coverage policy for beam search
    #[arg(short, long, value_enum, default_value = "backoff")]
    coverage: Coverage,

    /// Beam target: absolute width ("5") or mass fraction ("0.9");
    /// comma-separated for per-history targets
    #[arg(short, long, default_value = "0.9")]
    beam_width: String,

    /// Continuations per history for the sampling estimators
    #[arg(short, long, default_value = "256")]
    num_seqs: usize,

    /// Sampling temperature forwarded to the model
    #[arg(short, long, default_value = "1.0")]
    temperature: f64,

    /// Excluded token ids, comma separated
    #[arg(long)]
    excluded: Option<String>,

    /// Random seed for the sampling estimators (non-zero)
    #[arg(long)]
    seed: Option<u64>,

    /// Output format
    #[arg(long, value_enum, default_value = "plain")]
    format: OutputFormat,

    /// Show a progress bar over generation steps
    #[arg(long)]
    progress: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct JsonReport {
    estimator: &'static str,
    vocab_size: usize,
    histories: Vec<Vec<u32>>,
    total_seq_lens: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    beam: Option<Vec<BeamResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    samples: Option<Vec<SampleResult>>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let histories = parse_histories(&cli.histories).context("parse histories")?;
    let total_seq_lens = parse_lengths(&cli.total_len).context("parse --total-len")?;
    let excluded = match cli.excluded.as_deref() {
        Some(raw) => parse_tokens(raw).context("parse --excluded")?,
        None => Vec::new(),
    };
    let coverage = parse_coverage_targets(&cli.beam_width).context("parse --beam-width")?;

    if cli.verbose {
        eprintln!("seq-prob v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("Estimator: {}", cli.estimator.as_str());
        eprintln!(
            "Model: vocab={} hidden={} seed={}",
            cli.vocab_size, cli.hidden_size, cli.model_seed
        );
        eprintln!(
            "Histories: {} (targets {:?}, excluded {:?})",
            histories.len(),
            total_seq_lens,
            excluded
        );
    }

    let device = candle_core::Device::Cpu;
    let oracle = DemoOracle::new(cli.vocab_size, cli.hidden_size, cli.model_seed, &device)
        .context("build synthetic model")?;

    let mut report = JsonReport {
        estimator: cli.estimator.as_str(),
        vocab_size: cli.vocab_size,
        histories: histories.clone(),
        total_seq_lens: total_seq_lens.clone(),
        beam: None,
        samples: None,
    };

    match cli.estimator {
        Estimator::Beam => {
            let config = BeamSearchConfig {
                kind: cli.coverage.kind(),
                coverage,
                temperature: cli.temperature,
                excluded,
                progress: cli.progress,
                ..BeamSearchConfig::default()
            };
            let results = beam_search(&oracle, &histories, &total_seq_lens, &config)
                .context("beam search")?;
            report.beam = Some(results);
        }
        Estimator::Importance => {
            let config = sample_config(&cli, excluded);
            let results = importance_sample(&oracle, &histories, &total_seq_lens, &config)
                .context("importance sampling")?;
            report.samples = Some(results);
        }
        Estimator::Uniform => {
            let config = sample_config(&cli, excluded);
            let results = uniform_sample(&histories, cli.vocab_size, &total_seq_lens, &config)
                .context("uniform sampling")?;
            report.samples = Some(results);
        }
    }

    match cli.format {
        OutputFormat::Plain => print_plain(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn sample_config(cli: &Cli, excluded: Vec<u32>) -> SampleConfig {
    SampleConfig {
        num_seqs: cli.num_seqs,
        temperature: cli.temperature,
        excluded,
        seed: cli.seed,
        progress: cli.progress,
        ..SampleConfig::default()
    }
}

fn print_plain(report: &JsonReport) {
    if let Some(results) = &report.beam {
        for (i, result) in results.iter().enumerate() {
            println!(
                "history {i} {:?} -> target {}",
                report.histories[i],
                target_for(report, i)
            );
            println!("  status: {:?}", result.status);
            println!("  lower bound: {:.6e}", result.lower_bound());
            println!("  widths: {:?}", result.beam_widths);
            if !result.coverages.is_empty() {
                let shown: Vec<String> =
                    result.coverages.iter().map(|c| format!("{c:.4}")).collect();
                println!("  coverages: [{}]", shown.join(", "));
            }
            for (seq, lp) in result.sequences.iter().zip(&result.log_probs).take(5) {
                println!("    {seq:?}  log p = {lp:.4}");
            }
            if result.sequences.len() > 5 {
                println!("    ... {} more candidates", result.sequences.len() - 5);
            }
        }
    }

    if let Some(results) = &report.samples {
        for (i, result) in results.iter().enumerate() {
            println!(
                "history {i} {:?} -> target {}",
                report.histories[i],
                target_for(report, i)
            );
            println!("  status: {:?}", result.status);
            println!(
                "  estimate: {:.6e} over {} samples",
                result.mean_probability(),
                result.sequences.len()
            );
        }
    }
}

fn target_for(report: &JsonReport, i: usize) -> usize {
    if report.total_seq_lens.len() == 1 {
        report.total_seq_lens[0]
    } else {
        report.total_seq_lens[i]
    }
}

fn parse_histories(raw: &str) -> Result<Vec<Vec<u32>>> {
    raw.split(';')
        .filter(|part| !part.trim().is_empty())
        .map(parse_tokens)
        .collect()
}

fn parse_tokens(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .with_context(|| format!("invalid token id {part:?}"))
        })
        .collect()
}

fn parse_lengths(raw: &str) -> Result<Vec<usize>> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .with_context(|| format!("invalid length {part:?}"))
        })
        .collect()
}

/// Parse beam targets the way the experiment configs wrote them: an integer
/// is an absolute width, anything else a mass fraction.
fn parse_coverage_targets(raw: &str) -> Result<Vec<CoverageTarget>> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let part = part.trim();
            if let Ok(width) = part.parse::<usize>() {
                return Ok(CoverageTarget::Width(width));
            }
            part.parse::<f64>()
                .map(CoverageTarget::Mass)
                .with_context(|| format!("invalid beam target {part:?}"))
        })
        .collect()
}
