use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kverify_baseline::Baseline;
use kverify_engine::{
    JsonReporter, JunitReporter, Reporter as _, Session, SessionOptions, SessionReport,
    TextReporter,
};
use kverify_fetcher::{Connection, Fetcher, FixtureFetcher, KubeClient, KubeClientOptions};
use miette::{Context as _, IntoDiagnostic as _, Result};
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, prelude::*};

/// Exit status when at least one check could not reach the cluster. Clap
/// already uses 2 for usage errors.
const EXIT_OPERATIONAL: u8 = 3;

#[derive(Parser)]
#[command(name = "kverify")]
#[command(version)]
#[command(about = "Verify deployed Kubernetes resources against a declarative baseline")]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv, -vvvv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a baseline without contacting a cluster.
    Check(CheckArgs),
    /// Run a baseline against a cluster (or recorded fixtures).
    Run(RunArgs),
}

#[derive(Args)]
struct CheckArgs {
    /// Baseline file (JSON5).
    #[arg(value_name = "BASELINE")]
    baseline: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    /// Baseline file (JSON5).
    #[arg(value_name = "BASELINE")]
    baseline: PathBuf,

    /// Kubeconfig to use instead of `KUBECONFIG` or `~/.kube/config`.
    #[arg(long, value_name = "PATH", conflicts_with = "fixtures")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one.
    #[arg(long, value_name = "NAME", conflicts_with = "fixtures")]
    context: Option<String>,

    /// Read resources from `kubectl get -o json` dumps instead of a cluster.
    #[arg(long, value_name = "DIR")]
    fixtures: Option<PathBuf>,

    /// Report format.
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Write the report to a file instead of stdout.
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Number of checks allowed to fetch at the same time.
    #[arg(long, value_name = "N", default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    concurrency: u16,

    /// Per-request timeout in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    timeout: u64,

    /// List passing assertions in the text report.
    #[arg(long)]
    show_passing: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Text,
    Json,
    Junit,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    miette::set_panic_hook();
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Command::Check(args) => check(args),
        Command::Run(args) => run(args).await,
    }
}

fn init_tracing(verbose: u8) -> Result<()> {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().into_diagnostic()?
    } else {
        let level = match verbose {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("error,kverify={level},kverify_={level}"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_fmt::layer().with_writer(std::io::stderr))
        .with(ErrorLayer::default())
        .init();

    Ok(())
}

fn check(args: CheckArgs) -> Result<ExitCode> {
    let baseline = Baseline::load(&args.baseline)?;
    for unit in baseline.checks() {
        let mut line = format!(
            "{}: {} ({} assertions",
            unit.name(),
            unit.resource(),
            unit.assertions().len()
        );
        if let Some(key) = unit.publish_key() {
            line.push_str(&format!(", publishes `{key}`"));
        }
        for dep in unit.dependencies() {
            line.push_str(&format!(", reads `{dep}`"));
        }
        line.push(')');
        println!("{line}");
    }
    println!(
        "{}: {} checks OK",
        args.baseline.display(),
        baseline.checks().len()
    );
    Ok(ExitCode::SUCCESS)
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let baseline = Baseline::load(&args.baseline)?;
    let fetcher = build_fetcher(&args)?;
    let options = SessionOptions {
        max_concurrency: usize::from(args.concurrency),
    };

    let session = Session::new(fetcher, baseline.into_checks(), options)?;
    let report = session.execute().await;

    let rendered = render(&report, &args)?;
    match &args.output {
        Some(path) => write_report(path, &rendered)?,
        None => print!("{rendered}"),
    }

    let code = if report.has_transport_errors() {
        ExitCode::from(EXIT_OPERATIONAL)
    } else if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    };
    Ok(code)
}

fn build_fetcher(args: &RunArgs) -> Result<Arc<dyn Fetcher>> {
    if let Some(dir) = &args.fixtures {
        let fixtures = FixtureFetcher::load_dir(dir)?;
        info!(objects = fixtures.len(), dir = %dir.display(), "using fixtures");
        return Ok(Arc::new(fixtures));
    }

    let connection = Connection::discover(args.kubeconfig.as_deref(), args.context.as_deref())?;
    info!(server = %connection.server, source = %connection.source, "connecting to cluster");
    let options = KubeClientOptions {
        request_timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    };
    Ok(Arc::new(KubeClient::new(&connection, options)?))
}

fn render(report: &SessionReport, args: &RunArgs) -> Result<String> {
    let rendered = match args.format {
        Format::Text => TextReporter {
            verbose: args.show_passing,
        }
        .emit(report)?,
        Format::Json => JsonReporter.emit(report)?,
        Format::Junit => JunitReporter::default().emit(report)?,
    };
    Ok(rendered)
}

fn write_report(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write report to `{}`", path.display()))
}
