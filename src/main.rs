//! CPAP card analytics CLI
//!
//! Decodes a copied data card and prints nightly statistics, trends, and
//! waveform envelopes.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use cpap_card_analytics::{
    aggregate::{DailyBucket, TrendBucket, TrendPeriod},
    config::Config,
    decoder::decode_file,
    import::{run_pipeline, CardFile, PipelineOutput},
    session::SignalType,
    VERSION,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cpap-card")]
#[command(version = VERSION)]
#[command(about = "Decode CPAP data cards into nightly therapy statistics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a single file and show what it contains
    Inspect {
        /// File copied from the card
        file: PathBuf,
    },

    /// Show one line of statistics per night
    Days {
        /// Directory holding the card's files
        dir: PathBuf,

        #[command(flatten)]
        run: RunArgs,

        /// Print full buckets as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show weekly or monthly rollups
    Trends {
        /// Directory holding the card's files
        dir: PathBuf,

        #[arg(long, value_enum, default_value = "week")]
        period: PeriodArg,

        #[command(flatten)]
        run: RunArgs,

        /// Print rollups as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a min/max envelope of one signal as JSON
    Viewport {
        /// Directory holding the card's files
        dir: PathBuf,

        #[arg(long, value_enum, default_value = "flow")]
        signal: SignalArg,

        /// Range start (RFC 3339); defaults to the first sample
        #[arg(long)]
        start: Option<String>,

        /// Range end (RFC 3339, exclusive); defaults to just after the last sample
        #[arg(long)]
        end: Option<String>,

        #[arg(long, default_value = "500")]
        max_buckets: usize,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Show configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Per-run overrides of the stored configuration.
#[derive(clap::Args)]
struct RunArgs {
    /// IANA timezone whose days define the nights
    #[arg(long)]
    timezone: Option<String>,

    /// Decoder threads
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum PeriodArg {
    Week,
    Month,
}

impl From<PeriodArg> for TrendPeriod {
    fn from(arg: PeriodArg) -> Self {
        match arg {
            PeriodArg::Week => TrendPeriod::Week,
            PeriodArg::Month => TrendPeriod::Month,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SignalArg {
    Flow,
    Pressure,
    ExhalePressure,
    Leak,
    FlexActive,
}

impl From<SignalArg> for SignalType {
    fn from(arg: SignalArg) -> Self {
        match arg {
            SignalArg::Flow => SignalType::Flow,
            SignalArg::Pressure => SignalType::Pressure,
            SignalArg::ExhalePressure => SignalType::ExhalePressure,
            SignalArg::Leak => SignalType::Leak,
            SignalArg::FlexActive => SignalType::FlexActive,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { file } => cmd_inspect(&file),
        Commands::Days { dir, run, json } => cmd_days(&dir, &run, json),
        Commands::Trends {
            dir,
            period,
            run,
            json,
        } => cmd_trends(&dir, period.into(), &run, json),
        Commands::Viewport {
            dir,
            signal,
            start,
            end,
            max_buckets,
            run,
        } => cmd_viewport(&dir, signal.into(), start, end, max_buckets, &run),
        Commands::Config { init } => cmd_config(init),
    }
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let decoded = decode_file(&bytes, Some(&path.to_string_lossy()));

    let sessions: Vec<_> = decoded
        .sessions
        .iter()
        .map(|s| {
            json!({
                "session_id": s.session_id,
                "start": s.start,
                "end": s.end,
                "duration_secs": s.duration_secs(),
                "events": s.events.len(),
                "samples": s.signals.len(),
                "waveform_samples": s.waveform.as_ref().map(|w| w.len()),
                "min_pressure": s.settings.map(|p| p.min_pressure),
            })
        })
        .collect();

    let summary = json!({
        "source": decoded.source,
        "kind": decoded.kind,
        "magic": decoded.magic,
        "header": decoded.header,
        "sessions": sessions,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_days(dir: &Path, run: &RunArgs, as_json: bool) -> Result<()> {
    let output = import_card(dir, run)?;

    if as_json {
        let days: Vec<&DailyBucket> = output.days.iter().map(|d| d.as_ref()).collect();
        println!("{}", serde_json::to_string_pretty(&days)?);
        return Ok(());
    }

    println!(
        "{:<10}  {:>6}  {:>6}  {:>7}  {:>9}  {:>8}  {:>8}  {:>6}",
        "Night", "Usage", "AHI", "Peak30", "P95 cmH2O", "Leak med", "Leak>thr", "FL med"
    );
    for day in &output.days {
        println!(
            "{:<10}  {:>5.1}h  {:>6}  {:>7}  {:>9}  {:>8}  {:>8}  {:>6}",
            day.date.to_string(),
            day.usage_hours(),
            fmt_opt(day.ahi, 1),
            fmt_opt(day.peak_rolling_ahi, 1),
            fmt_opt(day.pressure.pressure.map(|p| p.p95), 1),
            fmt_opt(day.leak.total.map(|l| l.median), 1),
            fmt_pct(day.leak.over_threshold_fraction),
            fmt_opt(day.flow_limitation.breath_median, 2),
        );
    }
    print_import_footer(&output);
    Ok(())
}

fn cmd_trends(dir: &Path, period: TrendPeriod, run: &RunArgs, as_json: bool) -> Result<()> {
    let output = import_card(dir, run)?;
    let buckets: &[TrendBucket] = match period {
        TrendPeriod::Week => &output.weeks,
        TrendPeriod::Month => &output.months,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(buckets)?);
        return Ok(());
    }

    println!(
        "{:<8}  {:>6}  {:>6}  {:>9}  {:>6}  {:>9}  {:>8}",
        "Period", "Nights", "Used", "Avg usage", "AHI", "P95 cmH2O", "Leak med"
    );
    for bucket in buckets {
        println!(
            "{:<8}  {:>6}  {:>6}  {:>8}h  {:>6}  {:>9}  {:>8}",
            bucket.label,
            bucket.nights,
            bucket.nights_used,
            fmt_opt(bucket.average_usage_hours(), 1),
            fmt_opt(bucket.ahi, 1),
            fmt_opt(bucket.metrics.pressure_p95, 1),
            fmt_opt(bucket.metrics.leak_median, 1),
        );
    }
    print_import_footer(&output);
    Ok(())
}

fn cmd_viewport(
    dir: &Path,
    signal: SignalType,
    start: Option<String>,
    end: Option<String>,
    max_buckets: usize,
    run: &RunArgs,
) -> Result<()> {
    let output = import_card(dir, run)?;
    let Some((first, last)) = output.index.time_range(signal) else {
        bail!("no {signal:?} data on this card");
    };

    let start_ms = match start {
        Some(s) => parse_instant(&s)?.timestamp_millis(),
        None => first,
    };
    let end_ms = match end {
        Some(s) => parse_instant(&s)?.timestamp_millis(),
        None => last + 1,
    };
    if end_ms <= start_ms {
        bail!("viewport end must be after start");
    }

    let points = output.index.query(signal, start_ms, end_ms, max_buckets);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "signal": signal,
            "start_ms": start_ms,
            "end_ms": end_ms,
            "points": points,
        }))?
    );
    Ok(())
}

fn cmd_config(init: bool) -> Result<()> {
    let config = Config::load().unwrap_or_default();
    if init {
        config.save()?;
        println!("Wrote {:?}", Config::config_path());
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Run the full pipeline over a card directory; Ctrl+C cancels it.
fn import_card(dir: &Path, run: &RunArgs) -> Result<PipelineOutput> {
    let mut config = Config::load().unwrap_or_else(|e| {
        warn!("Could not load config, using defaults: {e}");
        Config::default()
    });
    if let Some(tz) = &run.timezone {
        config.aggregator = config.aggregator.with_timezone(tz)?;
    }
    if let Some(workers) = run.workers {
        config.import.workers = workers.max(1);
    }

    let files = read_card_dir(dir)?;
    if files.is_empty() {
        bail!("no files found in {}", dir.display());
    }

    let cancel = Arc::new(AtomicBool::new(false));
    ctrlc_handler(cancel.clone())?;

    Ok(run_pipeline(&files, &config, &cancel)?)
}

/// Read every regular file below `dir`. Unreadable entries are skipped.
fn read_card_dir(dir: &Path) -> Result<Vec<CardFile>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("reading directory {}", current.display()))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            match std::fs::read(&path) {
                Ok(bytes) => files.push(CardFile::new(path.to_string_lossy(), bytes)),
                Err(e) => warn!("Skipping {}: {e}", path.display()),
            }
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("'{s}' is not an RFC 3339 timestamp"))?
        .with_timezone(&Utc))
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{v:.precision$}"))
        .unwrap_or_else(|| "-".to_string())
}

fn fmt_pct(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1}%", v * 100.0))
        .unwrap_or_else(|| "-".to_string())
}

fn print_import_footer(output: &PipelineOutput) {
    println!();
    println!("{}", output.stats.summary());
    println!(
        "{} merged session(s), {} night(s)",
        output.sessions.len(),
        output.days.len()
    );
    for failure in &output.failures {
        eprintln!("Failed: {} ({})", failure.source, failure.reason);
    }
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(cancel: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")
}
