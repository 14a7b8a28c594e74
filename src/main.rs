use clap::{Parser, Subcommand};
use devstack_lib::logging::{self, LogFormat};
use devstack_lib::ports::ReclaimOutcome;
use devstack_lib::supervisor::WindowStatus;
use devstack_lib::{Result, StackConfig, StackError, StackOrchestrator};
use std::process::ExitCode;
use tracing::{error, info};

/// All stack configuration comes from the environment (TES_PORT,
/// TOOLSERVER_PORT, WORKBENCH_PORT, LIMSX_PORT, SESSION, ...).
#[derive(Debug, Parser)]
#[command(name = "devstack", about = "Run and smoke-test the local service stack", version)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Reclaim ports, start every service and wait until they are ready.
    Up {
        /// Run the end-to-end job check once the stack is ready.
        #[arg(long)]
        verify: bool,
    },
    /// Stop every service in the session.
    Down,
    /// Show whether each service window is alive.
    Status,
    /// Print the captured output of one service.
    Logs {
        service: String,
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
    },
    /// Probe the running stack and submit a job end to end.
    Smoke,
    /// Free every configured port without starting anything.
    Reclaim,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    // Values already in the environment win over .env
    let _ = dotenvy::dotenv();
    logging::init(cli.log_format);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "devstack failed");
            if let Some(body) = err.last_body() {
                eprintln!("last response body:\n{body}");
            }
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(command: Cmd) -> Result<()> {
    let config = StackConfig::from_env()?;
    let orchestrator = StackOrchestrator::new(config);

    match command {
        Cmd::Up { verify } => {
            let up = orchestrator.up().await?;
            info!(
                session = %up.session.id(),
                tolerated_failures = up.health.tolerated_failures().count(),
                "stack is up"
            );
            if verify {
                smoke(&orchestrator).await?;
            }
        }
        Cmd::Down => {
            orchestrator.down().await?;
        }
        Cmd::Status => {
            let states = orchestrator.status().await?;
            for window in &states {
                let pid = window.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                println!("{:<12} {:>7} {:>6}  {:?}", window.name, pid, window.port, window.status);
            }
            if states.iter().any(|w| w.status != WindowStatus::Running) {
                return Err(StackError::Process("one or more windows are not running".into()));
            }
        }
        Cmd::Logs { service, lines } => {
            for line in orchestrator.logs(&service, lines)? {
                println!("{line}");
            }
        }
        Cmd::Smoke => smoke(&orchestrator).await?,
        Cmd::Reclaim => {
            let outcomes = orchestrator.reclaim_ports().await;
            if outcomes.iter().any(|(_, o)| matches!(o, ReclaimOutcome::StillHeld { .. })) {
                return Err(StackError::Process("some ports could not be reclaimed".into()));
            }
        }
    }
    Ok(())
}

async fn smoke(orchestrator: &StackOrchestrator) -> Result<()> {
    let report = orchestrator.smoke().await?;
    info!(run_id = %report.run_id, attempts = report.attempts, "got {} enrichment rows", report.row_count);
    Ok(())
}
