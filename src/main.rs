use std::collections::HashMap;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use pm_lite::command::{Command, SystemCommandArguments, CORE_SYSTEM};
use pm_lite::config::ManagerConfig;
use pm_lite::result::JobResult;
use pm_lite::scheduler::Manager;
use pm_lite::shutdown::install_shutdown_handler;
use pm_lite::stream::consume;
use pm_lite::stream::message::LEVEL_STDOUT;

#[derive(Parser, Debug)]
#[command(name = "pm-lite")]
#[command(version)]
#[command(about = "A node-local job and process supervisor")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one system command under supervision and print its result
    Run(RunArgs),

    /// Decode framed process output read from stdin
    Decode {
        /// Level of lines without a control prefix
        #[arg(long, default_value_t = LEVEL_STDOUT)]
        level: u16,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Job ID (generated when omitted)
    #[arg(long)]
    id: Option<String>,

    /// Named queue serializing jobs that share it
    #[arg(long)]
    queue: Option<String>,

    /// Seconds before the job is killed (0 for no limit)
    #[arg(long, default_value = "0")]
    max_time: u64,

    /// Attempts allowed for a failing job
    #[arg(long, default_value = "0")]
    max_restart: u64,

    /// Re-run the job every this many seconds
    #[arg(long, default_value = "0")]
    recurring: u64,

    /// Literal input written to the child's stdin
    #[arg(long)]
    stdin: Option<String>,

    /// Working directory of the child
    #[arg(long)]
    dir: Option<String>,

    /// Extra environment of the child (KEY=VALUE, repeatable)
    #[arg(long = "env", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Binary to run, then its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    argv: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' in '{s}'"))
}

fn build_command(args: &RunArgs) -> Command {
    let (name, rest) = match args.argv.split_first() {
        Some((name, rest)) => (name.clone(), rest.to_vec()),
        None => (String::new(), Vec::new()),
    };

    let arguments = SystemCommandArguments {
        name,
        dir: args.dir.clone().unwrap_or_default(),
        args: rest,
        env: args.env.iter().cloned().collect::<HashMap<_, _>>(),
        stdin: args.stdin.clone().unwrap_or_default(),
    };

    let mut cmd = Command::new(CORE_SYSTEM).with_arguments(&arguments);
    cmd.id = args.id.clone().unwrap_or_default();
    cmd.queue = args.queue.clone().unwrap_or_default();
    cmd.max_time = args.max_time;
    cmd.max_restart = args.max_restart;
    cmd.recurring_period = args.recurring;
    cmd
}

fn print_result(
    result: &JobResult,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        OutputFormat::Table => {
            println!("Job ID:   {}", result.id);
            println!("State:    {}", result.state);
            println!("Code:     {}", result.code);
            println!("Time:     {}ms", result.time);
            if !result.data.is_empty() {
                println!("Data:     {}", result.data);
            }
            if !result.critical.is_empty() {
                println!("Critical: {}", result.critical);
            }
            if !result.streams.stdout().is_empty() {
                println!("--- stdout ---");
                println!("{}", result.streams.stdout());
            }
            if !result.streams.stderr().is_empty() {
                println!("--- stderr ---");
                println!("{}", result.streams.stderr());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_run(args: RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let manager = Manager::new(ManagerConfig::from_env());

    let job = manager.run(build_command(&args), Vec::new()).await?;
    let job_id = job.command().id.clone();
    job.subscribe(move |msg| {
        tracing::info!(job_id = %job_id, level = msg.level(), "{}", msg.message);
    });

    let result = tokio::select! {
        result = job.wait() => result,
        _ = shutdown.cancelled() => {
            manager.shutdown(&[]).await;
            job.wait().await
        }
    };

    print_result(&result, &args.output)?;
    Ok(result.is_success())
}

fn handle_decode(level: u16) -> Result<(), Box<dyn std::error::Error>> {
    let stdin = std::io::stdin();
    consume(stdin.lock(), level, |msg| println!("{msg}"))?;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            if !handle_run(run_args).await? {
                std::process::exit(1);
            }
        }
        Commands::Decode { level } => handle_decode(level)?,
    }

    Ok(())
}
