use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cohort::beacon::BeaconServer;
use cohort::client::{JobOutcome, Submitter};
use cohort::config::{load_hosts, BeaconConfig};
use cohort::protocol::{Admission, MonitorEvent};
use cohort::scheduler::JobDescriptor;
use cohort::shutdown::wait_for_interrupt;

#[derive(Parser, Debug)]
#[command(name = "cohort")]
#[command(version)]
#[command(about = "Launch a program as a cohort of ranked workers across machines")]
#[command(propagate_version = true)]
struct Args {
    /// Control socket of the local beacon
    #[arg(long, global = true, default_value = "/tmp/cohort-beacon.sock")]
    control_socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the beacon daemon on this machine
    Beacon(BeaconArgs),

    /// Run a program as a job through the local beacon
    Run(RunArgs),

    /// Check that the local beacon is up
    Probe,

    /// Stop the local beacon
    Stop,
}

// =============================================================================
// Beacon Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BeaconArgs {
    /// Address remote beacons dispatch jobs to
    #[arg(long, default_value = "0.0.0.0:2222")]
    listen: SocketAddr,

    /// Password remote beacons must present
    #[arg(long, env = "COHORT_PASSWORD", default_value = "")]
    password: String,

    /// Where bundles are unpacked and worker sockets live
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Number of ranks
    #[arg(short = 'n', long)]
    size: usize,

    /// Hosts file (JSON object of host to {max_procs, password})
    #[arg(short = 'm', long)]
    hosts: Option<PathBuf>,

    /// Program every rank runs
    app: PathBuf,
}

// =============================================================================
// Beacon
// =============================================================================

async fn run_beacon(
    control_socket: PathBuf,
    args: BeaconArgs,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = BeaconConfig::new(control_socket, args.listen).with_password(args.password);
    if let Some(runtime_dir) = args.runtime_dir {
        config = config.with_runtime_dir(runtime_dir);
    }
    if config.password.is_empty() {
        tracing::warn!("No password set, any beacon that can reach this one may dispatch jobs");
    }

    let server = BeaconServer::start(config).await?;
    let interrupts = tokio::spawn(async move {
        match wait_for_interrupt().await {
            Ok(interrupt) => interrupt.reason().to_string(),
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for signals");
                std::future::pending::<String>().await
            }
        }
    });

    tokio::select! {
        reason = interrupts => {
            let reason = reason.unwrap_or_else(|_| "interrupted".to_string());
            server.interrupt(reason);
        }
        _ = server.stopped() => {}
    }
    server.wait().await?;
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// Submitter Commands
// =============================================================================

async fn run_job(
    control_socket: PathBuf,
    args: RunArgs,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let app = std::fs::canonicalize(&args.app)
        .map_err(|e| format!("cannot find {}: {}", args.app.display(), e))?;
    let mut job = JobDescriptor::new(args.size, app)?;
    if let Some(path) = args.hosts {
        job = job.with_hosts(load_hosts(&path)?)?;
    }

    let mut submitter = Submitter::connect(&control_socket).await?;
    if submitter.run(job).await? == Admission::Busy {
        eprintln!("Beacon is busy with another job");
        return Ok(ExitCode::FAILURE);
    }

    let interrupt = CancellationToken::new();
    let on_signal = interrupt.clone();
    tokio::spawn(async move {
        if wait_for_interrupt().await.is_ok() {
            on_signal.cancel();
        }
    });

    let outcome = submitter
        .watch(args.size, interrupt, |event| match event {
            MonitorEvent::Stdout { line, .. } => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", line);
            }
            MonitorEvent::Stderr { line, .. } => eprintln!("{}", line),
            MonitorEvent::Exit { .. } | MonitorEvent::Aborted { .. } => {}
        })
        .await;

    match outcome {
        Ok(JobOutcome::Completed { failed }) if failed.is_empty() => Ok(ExitCode::SUCCESS),
        Ok(JobOutcome::Completed { failed }) => {
            for (rank, code) in failed {
                match code {
                    Some(code) => eprintln!("rank {} exited with code {}", rank, code),
                    None => eprintln!("rank {} was killed by a signal", rank),
                }
            }
            Ok(ExitCode::FAILURE)
        }
        Ok(JobOutcome::Aborted { reason }) => {
            eprintln!("[Aborted]: {}", reason);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            eprintln!("[Aborted]: {}", e.abort_reason());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn probe(control_socket: PathBuf) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut submitter = Submitter::connect(&control_socket).await?;
    submitter.probe(Duration::from_secs(2)).await?;
    println!("Beacon is alive on {}", control_socket.display());
    Ok(ExitCode::SUCCESS)
}

async fn stop(control_socket: PathBuf) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut submitter = Submitter::connect(&control_socket).await?;
    submitter.stop(Duration::from_secs(5)).await?;
    println!("Beacon stopped");
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Beacon(beacon_args) => run_beacon(args.control_socket, beacon_args).await,
        Commands::Run(run_args) => run_job(args.control_socket, run_args).await,
        Commands::Probe => probe(args.control_socket).await,
        Commands::Stop => stop(args.control_socket).await,
    }
}
