use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use kiln::{BuildConfig, Pipeline, SchedulerConfig};
use tracing::info;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Discovers the projects under the given directories and writes a solution
/// manifest for them.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    /// Directories to scan, one project per directory and language.
    #[arg(default_value = ".")]
    paths: Vec<Utf8PathBuf>,

    /// Output directory.
    #[arg(short, long, default_value = "dist")]
    out: Utf8PathBuf,

    /// Solution name.
    #[arg(short = 'n', long, default_value = "solution")]
    name: String,

    /// Worker threads, defaults to one per core.
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Write the task graph here, as JSON if the extension is `.json` and
    /// as a Mermaid diagram otherwise.
    #[arg(long)]
    graph: Option<Utf8PathBuf>,

    /// Wait loop interval in milliseconds.
    #[arg(long, default_value_t = 200)]
    tick_ms: u64,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "kiln=debug" } else { "kiln=info" }));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose)?;

    let build = BuildConfig::new(args.paths.iter().cloned())
        .out_dir(args.out.clone())
        .solution(args.name.clone());

    let mut config = SchedulerConfig::default().with_tick(Duration::from_millis(args.tick_ms));
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }

    let pipeline = Pipeline::new(&build, config)?;
    let result = pipeline.run();

    if let Some(path) = &args.graph {
        let snapshot = pipeline.scheduler().snapshot();
        let text = match path.extension() {
            Some("json") => snapshot.to_json()?,
            _ => snapshot.render_mermaid(),
        };
        fs::write(path, text)?;
        info!(path = %path, "wrote task graph");
    }

    let report = result?;
    eprintln!("{report}");

    Ok(())
}
