use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use lavalite_sbd::config::SbdConfig;
use lavalite_sbd::protocol::message::JobInfo;
use lavalite_sbd::sbd::daemon::{fetch_jobs, SbdDaemon};
use lavalite_sbd::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "sbatchd")]
#[command(version)]
#[command(about = "LavaLite per-host batch execution daemon")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the daemon
    Run(RunArgs),

    /// List the jobs of a running daemon
    Jobs {
        /// Daemon client address
        #[arg(long, short = 'a', default_value = "127.0.0.1:6882")]
        addr: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Daemon Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Run jobs as the daemon's own user
    #[arg(long)]
    debug: bool,

    /// LavaLite shared directory
    #[arg(long, env = "LSB_SHAREDIR", default_value = "/var/lib/lavalite")]
    sharedir: PathBuf,

    /// Port of the local client listener
    #[arg(long, env = "LSB_SBD_PORT", default_value = "6882")]
    port: u16,

    /// mbatchd address
    #[arg(long, env = "LSB_MBD_ADDR", default_value = "127.0.0.1:6881")]
    mbd: String,

    /// Name to register with (defaults to the system hostname)
    #[arg(long)]
    hostname: Option<String>,

    /// Maintenance timer period in seconds
    #[arg(long, default_value = "30")]
    timer_secs: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Daemon
// =============================================================================

async fn run_daemon(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let hostname = match args.hostname {
        Some(name) => name,
        None => nix::unistd::gethostname()?.to_string_lossy().into_owned(),
    };

    let config = SbdConfig::new(args.sharedir)
        .with_debug(args.debug)
        .with_listen_addr(SocketAddr::from(([0, 0, 0, 0], args.port)))
        .with_mbd_addr(args.mbd)
        .with_hostname(hostname)
        .with_timer_interval(Duration::from_secs(args.timer_secs.max(1)));

    if config.debug {
        tracing::warn!("Debug mode: jobs run as the daemon user");
    }

    let shutdown = install_shutdown_handler()?;
    let daemon = SbdDaemon::bind(config).await?;
    daemon.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Job Listing
// =============================================================================

fn print_jobs(jobs: &[JobInfo], output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(jobs)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<10} {:<8} {:<8} {:<8} {:<13} {:<5} {:<5} {:<5} EXIT",
                "JOBID", "PID", "PGID", "STATE", "STAGE", "PID", "EXEC", "FIN"
            );
            println!("{}", "-".repeat(79));
            let mark = |acked: bool, sent: bool| match (acked, sent) {
                (true, _) => "ack",
                (false, true) => "sent",
                (false, false) => "-",
            };
            for job in jobs {
                let exit = if job.missing {
                    "missing".to_string()
                } else if job.exit_status_valid {
                    job.exit_status.to_string()
                } else {
                    "-".to_string()
                };
                println!(
                    "{:<10} {:<8} {:<8} {:<8} {:<13} {:<5} {:<5} {:<5} {}",
                    job.job_id,
                    job.pid,
                    job.pgid,
                    job.state,
                    job.stage,
                    mark(job.pid_acked, job.reply_sent),
                    mark(job.execute_acked, job.execute_sent),
                    mark(job.finish_acked, job.finish_sent),
                    exit
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_daemon(run_args).await?;
        }
        Commands::Jobs { addr, output } => {
            let jobs = fetch_jobs(&addr).await?;
            print_jobs(&jobs, &output)?;
        }
    }

    Ok(())
}
