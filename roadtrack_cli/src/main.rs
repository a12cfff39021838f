use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use roadtrack::{
    build_dataset, calibrate, discover_videos, extract_track, load_boundaries, read_track,
    track_length, write_dataset, CommandExtractor, FailurePolicy, Params, Track, TrailingPoint,
    CALIBRATION_THRESHOLD_KM, DEFAULT_BOUNDARY_DIR, DEFAULT_EXTRACTOR, DEFAULT_OUTPUT,
    VIDEO_ANCHOR,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT_HASH"), ")");

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Camera video GPS track extraction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract every video under a directory and write the merged dataset JSON
    Build(BuildArgs),
    /// Report per-track parse and calibration details for videos or GPX files
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct PipelineArgs {
    /// Extraction program, invoked as `<program> -s <video> <output-base>`
    #[arg(long, default_value = DEFAULT_EXTRACTOR, value_hint = ValueHint::CommandName)]
    extractor: PathBuf,

    /// Kill the extraction program after this many seconds (waits forever when unset)
    #[arg(long)]
    timeout: Option<f64>,

    /// Directory for temporary extraction artifacts (defaults to the OS temp dir)
    #[arg(long, value_hint = ValueHint::DirPath)]
    temp_dir: Option<PathBuf>,

    /// Path component the per-point video identifier starts from
    #[arg(long, default_value = VIDEO_ANCHOR)]
    anchor: String,

    /// Segment length (km) above which the next point is dropped as a glitch
    #[arg(long, default_value_t = CALIBRATION_THRESHOLD_KM)]
    threshold_km: f64,

    /// Keep each track's final point unless it was flagged as a glitch
    #[arg(long, action = ArgAction::SetTrue)]
    keep_trailing_point: bool,

    /// Verbose logging (includes one line per calibration event)
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct BuildArgs {
    /// Directory searched recursively for .mp4 files
    #[arg(value_hint = ValueHint::DirPath)]
    root: PathBuf,

    /// Output dataset path
    #[arg(short, long, default_value = DEFAULT_OUTPUT, value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Directory of boundary JSON files appended after the video points
    #[arg(long, default_value = DEFAULT_BOUNDARY_DIR, value_hint = ValueHint::DirPath)]
    boundaries: PathBuf,

    /// Log and skip videos that fail instead of aborting the run
    #[arg(long, action = ArgAction::SetTrue)]
    skip_failures: bool,

    /// Process videos on all cores
    #[arg(long, action = ArgAction::SetTrue)]
    parallel: bool,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Videos to extract, or .gpx files to parse directly
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

impl PipelineArgs {
    fn params(&self) -> Result<Params> {
        if !(self.threshold_km >= 0.0) {
            return Err(anyhow!("--threshold-km must be a non-negative number"));
        }
        let mut params = Params::default();
        params.calibration_threshold_km = self.threshold_km;
        params.video_anchor = self.anchor.clone();
        if self.keep_trailing_point {
            params.trailing_point = TrailingPoint::Keep;
        }
        if let Some(dir) = self.temp_dir.as_ref() {
            params.temp_dir = dir.clone();
        }
        Ok(params)
    }

    fn extractor(&self) -> Result<CommandExtractor> {
        let timeout = match self.timeout {
            Some(secs) if secs > 0.0 && secs.is_finite() => Some(Duration::from_secs_f64(secs)),
            Some(secs) => return Err(anyhow!("invalid --timeout {}: expected seconds > 0", secs)),
            None => None,
        };
        Ok(CommandExtractor {
            program: self.extractor.clone(),
            timeout,
            ..CommandExtractor::default()
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Build(args) => args.pipeline.verbose,
        Command::Inspect(args) => args.pipeline.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Build(args) => handle_build(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_build(args: BuildArgs) -> Result<()> {
    let mut params = args.pipeline.params()?;
    params.parallel = args.parallel;
    if args.skip_failures {
        params.failure_policy = FailurePolicy::Skip;
    }
    let extractor = args.pipeline.extractor()?;

    let videos = discover_videos(&args.root)
        .with_context(|| format!("failed to scan {}", args.root.display()))?;
    if videos.is_empty() {
        warn!("No .mp4 files found under {}", args.root.display());
    }
    info!("Found {} videos under {}", videos.len(), args.root.display());

    let boundaries = load_boundaries(&args.boundaries)?;

    let t_build = Instant::now();
    let dataset = build_dataset(&videos, boundaries, &extractor, &params)?;
    info!("Build stage: {:.1} s", t_build.elapsed().as_secs_f64());

    write_dataset(&dataset, &args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!("Wrote dataset: {}", args.output.display());
    if !dataset.errors.is_empty() {
        warn!(
            "{} of {} videos failed; see \"errors\" in {}",
            dataset.errors.len(),
            videos.len(),
            args.output.display()
        );
    }
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let params = args.pipeline.params()?;
    let extractor = args.pipeline.extractor()?;
    let mut report = String::new();

    for path in &args.inputs {
        let is_gpx = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| ext.eq_ignore_ascii_case("gpx"));

        report.push_str(&format!("FILE: {}\n", path.display()));
        if is_gpx {
            let track = read_track(path, &path.display().to_string())
                .with_context(|| format!("failed to parse {}", path.display()))?;
            describe_raw_track(&mut report, &track, &params);
        } else {
            let track = extract_track(path, &extractor, &params)
                .with_context(|| format!("failed to extract {}", path.display()))?;
            describe_track(&mut report, &track, &params);
        }
        report.push('\n');
    }

    write_report(&report, &args.output)
}

/// A GPX read directly has not been calibrated yet.
fn describe_raw_track(report: &mut String, track: &Track, params: &Params) {
    let calibrated = calibrate(&track.points, params);
    report.push_str(&format!("  start: {}\n", track.start_time.to_rfc3339()));
    report.push_str(&format!("  points: {}\n", track.points.len()));
    report.push_str(&format!(
        "  raw_length_km: {:.6}\n",
        track_length(&track.points, params.earth_radius_km)
    ));
    report.push_str(&format!("  calibrated_points: {}\n", calibrated.points.len()));
    report.push_str(&format!(
        "  length_km: {:.6}\n",
        track_length(&calibrated.points, params.earth_radius_km)
    ));
    report.push_str(&format!("  duration_s: {:.3}\n", track.total_duration_s));
    if !calibrated.events.is_empty() {
        report.push_str("  calibration_events:\n");
        for event in &calibrated.events {
            report.push_str(&format!(
                "    - index={} distance_km={:.6} elapsed_s={:.3}\n",
                event.index, event.distance_km, event.elapsed_s
            ));
        }
    }
}

fn describe_track(report: &mut String, track: &Track, params: &Params) {
    report.push_str(&format!("  start: {}\n", track.start_time.to_rfc3339()));
    report.push_str(&format!("  calibrated_points: {}\n", track.points.len()));
    report.push_str(&format!("  length_km: {:.6}\n", track.length_km(params)));
    report.push_str(&format!("  duration_s: {:.3}\n", track.total_duration_s));
    if let Some(first) = track.points.first() {
        report.push_str(&format!("  video: {}\n", first.video));
    }
}

fn write_report(report: &str, path: &Path) -> Result<()> {
    if path.as_os_str() == "-" {
        print!("{}", report);
        return Ok(());
    }
    fs::write(path, report).with_context(|| format!("failed to write {}", path.display()))?;
    info!("Inspection report written: {}", path.display());
    Ok(())
}
