//! poresift entrypoint: adaptive sampling controller for nanopore sequencers.

mod analysis;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use core_client::{SequencerClient, SimClient};
use core_config::{Conf, SharedConf, CLASSIFIED, UNCLASSIFIED};
use core_plugin::{build_aligner, build_caller};
use core_stats::{RunStatistics, DEBUG_LOG_FIELDS};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use analysis::{Analysis, AnalysisOptions};

/// Built-in configuration behind `unblock-all`: every decision maps to
/// unblock, with pass-through plugins.
const UNBLOCK_ALL_TOML: &str = r#"
[caller_settings.no_op]

[mapper_settings.no_op]

[[regions]]
name = "unblock all"
min_chunks = 1
max_chunks = 2
targets = []
single_on = "unblock"
single_off = "unblock"
multi_on = "unblock"
multi_off = "unblock"
no_map = "unblock"
no_seq = "unblock"
above_max_chunks = "unblock"
below_min_chunks = "unblock"
"#;

#[derive(Parser, Debug)]
#[command(
    name = "poresift",
    version,
    about = "Adaptive sampling controller for nanopore sequencers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
struct BaseArgs {
    /// Name of the sequencing position, e.g. MS29042 or X1.
    #[arg(long)]
    device: String,
    /// Description of the experiment being run; enclose in quotes.
    #[arg(long = "experiment-name")]
    experiment_name: String,
    /// Sequencer host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Sequencer port; chosen automatically when omitted.
    #[arg(long)]
    port: Option<u16>,
    /// Time, in seconds, to apply unblock voltage.
    #[arg(long = "unblock-duration", default_value_t = 0.1)]
    unblock_duration: f64,
    /// Minimum interval, in seconds, between two decision cycles.
    #[arg(long, default_value_t = 0.4)]
    throttle: f64,
    /// Replace every unblock action with stop-receiving.
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Maximum read length, in seconds, the sequencer will try to unblock.
    #[arg(long = "max-unblock-read-length-seconds", default_value_t = 5.0)]
    max_unblock_read_length_seconds: f64,
    /// Write logs to this file instead of standard error.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
    /// One of: trace, debug, info, warn, error.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
    /// Log line format: full or compact.
    #[arg(long = "log-format", default_value = "full")]
    log_format: String,
}

#[derive(Args, Debug)]
struct TargetsArgs {
    #[command(flatten)]
    base: BaseArgs,
    /// TOML file specifying the experimental conditions.
    #[arg(long)]
    toml: PathBuf,
    /// Write a per-chunk decision TSV to this path.
    #[arg(long = "debug-log")]
    debug_log: Option<PathBuf>,
    /// Drive the run from a recorded chunk script instead of a live device.
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Flow-cell channel count for replay runs.
    #[arg(long, default_value_t = 512)]
    channels: usize,
    /// Maximum chunks pulled per iteration; defaults to the channel count.
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,
}

#[derive(Args, Debug)]
struct UnblockAllArgs {
    #[command(flatten)]
    base: BaseArgs,
    /// Write a per-chunk decision TSV to this path.
    #[arg(long = "debug-log")]
    debug_log: Option<PathBuf>,
    /// Drive the run from a recorded chunk script instead of a live device.
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Flow-cell channel count for replay runs.
    #[arg(long, default_value_t = 512)]
    channels: usize,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    base: BaseArgs,
    /// TOML file to validate.
    toml: PathBuf,
    /// Validate against a PromethION flow cell (3000 channels) instead of 512.
    #[arg(long)]
    prom: bool,
    /// Also initialise the configured caller and aligner plugins.
    #[arg(long = "check-plugins")]
    check_plugins: bool,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[command(flatten)]
    base: BaseArgs,
    /// Per-chunk decision TSV written by a previous run.
    #[arg(long = "debug-log")]
    debug_log: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run targeted sequencing.
    Targets(TargetsArgs),
    /// Run targeted sequencing with barcode-level conditions.
    BarcodeTargets(TargetsArgs),
    /// Eject every read; used for flow-cell and latency checks.
    UnblockAll(UnblockAllArgs),
    /// Validate an experiment configuration. Exit code is the error count.
    Validate(ValidateArgs),
    /// Summarise a per-chunk decision TSV from a previous run.
    Stats(StatsArgs),
}

impl Command {
    fn base(&self) -> &BaseArgs {
        match self {
            Command::Targets(args) | Command::BarcodeTargets(args) => &args.base,
            Command::UnblockAll(args) => &args.base,
            Command::Validate(args) => &args.base,
            Command::Stats(args) => &args.base,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = configure_logging(cli.command.base())?;
    install_panic_hook();

    let base = cli.command.base();
    info!(
        target: "runtime.startup",
        device = base.device.as_str(),
        experiment = base.experiment_name.as_str(),
        host = base.host.as_str(),
        port = base.port,
        throttle = base.throttle,
        unblock_duration = base.unblock_duration,
        dry_run = base.dry_run,
        max_unblock_read_length_seconds = base.max_unblock_read_length_seconds,
        "startup"
    );

    match cli.command {
        Command::Targets(args) => run_targets(args, false),
        Command::BarcodeTargets(args) => run_targets(args, true),
        Command::UnblockAll(args) => run_unblock_all(args),
        Command::Validate(args) => run_validate(args),
        Command::Stats(args) => run_stats(args),
    }
}

fn configure_logging(base: &BaseArgs) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(base.log_level.clone()));
    let compact = match base.log_format.as_str() {
        "full" => false,
        "compact" => true,
        other => bail!("unknown --log-format {other:?}; expected full or compact"),
    };
    let guard = if let Some(path) = &base.log_file {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let file = path
            .file_name()
            .context("--log-file needs a file name")?
            .to_owned();
        let appender =
            tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false);
        if compact {
            builder.compact().try_init().ok();
        } else {
            builder.try_init().ok();
        }
        Some(guard)
    } else {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        if compact {
            builder.compact().try_init().ok();
        } else {
            builder.try_init().ok();
        }
        None
    };
    Ok(guard)
}

fn install_panic_hook() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(target: "runtime.panic", ?info, "panic");
        default_panic(info);
    }));
}

/// Build the sequencer client for a run subcommand.
///
/// The live vendor transport is an external collaborator; without `--replay`
/// there is nothing to connect with, and saying so early beats hanging.
fn build_client(
    base: &BaseArgs,
    replay: Option<&Path>,
    channels: usize,
) -> Result<SimClient> {
    match replay {
        Some(path) => {
            let client = SimClient::from_replay_file(path, channels)
                .with_context(|| format!("could not load replay script {}", path.display()))?;
            info!(target: "client", replay = %path.display(), "replay client ready");
            Ok(client)
        }
        None => bail!(
            "no live sequencer transport is built into this binary; \
             use --replay FILE to drive a recorded run \
             (requested device {:?} at {}:{})",
            base.device,
            base.host,
            base.port.map_or_else(|| "auto".into(), |p| p.to_string()),
        ),
    }
}

fn run_targets(args: TargetsArgs, require_barcodes: bool) -> Result<ExitCode> {
    let client = build_client(&args.base, args.replay.as_deref(), args.channels)?;
    let channels = client.channel_count();
    let conf = Conf::from_file(&args.toml, channels)
        .with_context(|| format!("could not load configuration {}", args.toml.display()))?;
    if require_barcodes
        && !(conf.barcodes.contains_key(CLASSIFIED) && conf.barcodes.contains_key(UNCLASSIFIED))
    {
        bail!(
            "barcode-targets needs both `{CLASSIFIED}` and `{UNCLASSIFIED}` barcode tables in {}",
            args.toml.display()
        );
    }
    let live_toml = PathBuf::from(format!("{}_live", args.toml.display()));
    run_analysis(
        client,
        conf,
        &args.base,
        args.debug_log.as_deref(),
        args.batch_size,
        live_toml,
    )
}

fn run_unblock_all(args: UnblockAllArgs) -> Result<ExitCode> {
    let client = build_client(&args.base, args.replay.as_deref(), args.channels)?;
    let channels = client.channel_count();
    let conf =
        Conf::from_str(UNBLOCK_ALL_TOML, channels).context("built-in unblock-all configuration")?;
    let live_toml = PathBuf::from("poresift_unblock_all.toml_live");
    run_analysis(
        client,
        conf,
        &args.base,
        args.debug_log.as_deref(),
        None,
        live_toml,
    )
}

fn run_analysis(
    client: SimClient,
    conf: Conf,
    base: &BaseArgs,
    debug_log: Option<&Path>,
    batch_size: Option<usize>,
    live_toml: PathBuf,
) -> Result<ExitCode> {
    let channels = client.channel_count();
    let shared = SharedConf::new(conf);
    let caller = build_caller(&shared.load().caller_settings)
        .context("caller plugin initialisation failed")?;
    let aligner = build_aligner(&shared.load().mapper_settings, &shared)
        .context("aligner plugin initialisation failed")?;

    let mut stats = RunStatistics::new(base.throttle);
    if let Some(path) = debug_log {
        stats = stats
            .with_debug_log(path)
            .with_context(|| format!("could not open debug log {}", path.display()))?;
    }

    let options = AnalysisOptions {
        throttle: Duration::from_secs_f64(base.throttle),
        batch_size: batch_size.unwrap_or(channels),
        unblock_duration: base.unblock_duration,
        dry_run: base.dry_run,
        live_toml,
    };
    Analysis::new(client, shared, caller, aligner, Arc::new(stats), options).run()?;
    Ok(ExitCode::SUCCESS)
}

fn run_validate(args: ValidateArgs) -> Result<ExitCode> {
    let channels = if args.prom { 3000 } else { 512 };
    let conf = match Conf::from_file(&args.toml, channels) {
        Ok(conf) => conf,
        Err(e) => {
            error!(
                target: "validate",
                path = %args.toml.display(),
                error = %e,
                "configuration invalid"
            );
            return Ok(ExitCode::from(1));
        }
    };
    info!(target: "validate", path = %args.toml.display(), "configuration loaded without error");

    let mut errors = 0u8;
    if args.check_plugins {
        let shared = SharedConf::new(conf);
        match build_caller(&shared.load().caller_settings) {
            Ok(caller) => info!(target: "validate", caller = %caller.describe(), "caller initialised"),
            Err(e) => {
                error!(target: "validate", error = %e, "caller could not be initialised");
                errors += 1;
            }
        }
        match build_aligner(&shared.load().mapper_settings, &shared) {
            Ok(aligner) => info!(
                target: "validate",
                aligner = %aligner.describe(&shared.load()),
                "aligner initialised"
            ),
            Err(e) => {
                error!(target: "validate", error = %e, "aligner could not be initialised");
                errors += 1;
            }
        }
    }
    Ok(ExitCode::from(errors))
}

/// Aggregate a per-chunk decision TSV into per-condition decision/action
/// tables.
fn run_stats(args: StatsArgs) -> Result<ExitCode> {
    let text = std::fs::read_to_string(&args.debug_log)
        .with_context(|| format!("could not read {}", args.debug_log.display()))?;
    let mut lines = text.lines();
    let header: Vec<&str> = lines.next().unwrap_or_default().split('\t').collect();
    let column = |name: &str| -> Result<usize> {
        header
            .iter()
            .position(|h| *h == name)
            .with_context(|| format!("{} has no {name:?} column", args.debug_log.display()))
    };
    let mode_col = column("mode")?;
    let action_col = column("decision")?;
    let condition_col = column("condition")?;

    let mut reads = 0u64;
    let mut malformed = 0u64;
    let mut by_mode: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_action: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_condition: BTreeMap<(String, String, String), u64> = BTreeMap::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != DEBUG_LOG_FIELDS.len() {
            malformed += 1;
            continue;
        }
        reads += 1;
        *by_mode.entry(fields[mode_col].to_string()).or_default() += 1;
        *by_action.entry(fields[action_col].to_string()).or_default() += 1;
        *by_condition
            .entry((
                fields[condition_col].to_string(),
                fields[mode_col].to_string(),
                fields[action_col].to_string(),
            ))
            .or_default() += 1;
    }

    println!("Summary of {}", args.debug_log.display());
    println!("  reads evaluated: {reads}");
    if malformed > 0 {
        println!("  malformed rows skipped: {malformed}");
    }
    println!("  decisions:");
    for (mode, count) in &by_mode {
        println!("    {mode:<18} {count}");
    }
    println!("  actions:");
    for (action, count) in &by_action {
        println!("    {action:<18} {count}");
    }
    println!("  per condition:");
    for ((condition, mode, action), count) in &by_condition {
        println!("    {condition:<16} {mode:<18} {action:<16} {count}");
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn builtin_unblock_all_config_is_valid() {
        let conf = Conf::from_str(UNBLOCK_ALL_TOML, 512).unwrap();
        assert_eq!(conf.regions.len(), 1);
        let region = &conf.regions[0];
        assert_eq!(
            region.get_action(core_model::Decision::NoSeq),
            core_model::Action::Unblock
        );
        assert_eq!(
            region.get_action(core_model::Decision::BelowMinChunks),
            core_model::Action::Unblock
        );
    }

    #[test]
    fn missing_replay_fails_fast_with_guidance() {
        let base = BaseArgs {
            device: "X1".into(),
            experiment_name: "test".into(),
            host: "127.0.0.1".into(),
            port: None,
            unblock_duration: 0.1,
            throttle: 0.4,
            dry_run: false,
            max_unblock_read_length_seconds: 5.0,
            log_file: None,
            log_level: "info".into(),
            log_format: "full".into(),
        };
        let err = build_client(&base, None, 512).unwrap_err();
        assert!(err.to_string().contains("--replay"));
    }
}
