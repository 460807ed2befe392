//! courier - a durable HTTP job scheduler.
//!
//! Usage:
//!   courier run [--jobs DIR]   Run the engine, submitting job files from DIR first
//!   courier validate DIR       Validate job files without running
//!   courier submit FILE        Submit one job definition
//!   courier trigger JOB        Fire a recurring job now
//!   courier cancel JOB         Cancel a recurring job
//!   courier inspect            Print executions
//!   courier jobs               List stored job definitions
//!
//! Every command reads the engine configuration from `--config` (or
//! `COURIER_CONFIG`); without one, defaults and in-memory storage are used.

use clap::{Parser, Subcommand};
use courier::{
    EngineConfig, EventBus, ExecutionFilter, ExecutionState, HttpDispatcher, JobService,
    LoggingHandler, Scheduler, YamlLoader, load_jobs_from_directory,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// courier - a durable HTTP job scheduler
#[derive(Parser)]
#[command(name = "courier")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(short, long, global = true, env = "COURIER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until Ctrl+C
    Run {
        /// Directory of job YAML files to submit before starting
        #[arg(short, long, value_name = "JOBS_DIR")]
        jobs: Option<PathBuf>,
    },

    /// Validate job files without running
    Validate {
        /// Directory containing job YAML files
        #[arg(value_name = "JOBS_DIR")]
        jobs_dir: PathBuf,
    },

    /// Submit one job definition
    Submit {
        /// Job YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Fire a recurring job now, outside its schedule
    Trigger {
        #[arg(value_name = "JOB")]
        job: String,
    },

    /// Cancel a recurring job
    Cancel {
        #[arg(value_name = "JOB")]
        job: String,
    },

    /// Print executions
    Inspect {
        /// Only executions of this job
        #[arg(long)]
        job: Option<String>,

        /// Only executions in this state (pending, enqueued, running, ...)
        #[arg(long, value_parser = parse_state)]
        state: Option<ExecutionState>,

        /// Maximum number of executions to print
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// List stored job definitions
    Jobs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { jobs } => run_engine(config, jobs).await?,
        Commands::Validate { jobs_dir } => validate_jobs(&config, &jobs_dir)?,
        Commands::Submit { file } => submit_job(&config, &file).await?,
        Commands::Trigger { job } => {
            let service = open_service(&config).await?;
            let id = service.trigger_now(job.as_str()).await?;
            println!("Triggered '{}' (execution: {})", job, id);
        }
        Commands::Cancel { job } => {
            let service = open_service(&config).await?;
            if service.cancel_recurring(job.as_str()).await? {
                println!("Cancelled '{}'", job);
            } else {
                println!("No recurring job named '{}'", job);
            }
        }
        Commands::Inspect { job, state, limit } => {
            let mut filter = ExecutionFilter::all().limit(limit);
            if let Some(job) = job {
                filter = filter.job(job);
            }
            if let Some(state) = state {
                filter = filter.state(state);
            }
            inspect_executions(&config, &filter).await?;
        }
        Commands::Jobs => list_jobs(&config).await?,
    }

    Ok(())
}

fn parse_state(s: &str) -> Result<ExecutionState, String> {
    s.parse().map_err(|_| {
        let known: Vec<&str> = ExecutionState::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown state '{}' (expected one of: {})", s, known.join(", "))
    })
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(YamlLoader::load_engine_config(path)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

async fn open_service(config: &EngineConfig) -> Result<JobService, Box<dyn std::error::Error>> {
    let storage = config.storage.open().await?;
    Ok(JobService::new(storage, config.queue_set()))
}

/// Run the engine, optionally submitting job files first.
async fn run_engine(
    config: EngineConfig,
    jobs_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = config.storage.open().await?;
    let dispatcher = Arc::new(HttpDispatcher::new(config.dispatch_timeout())?);

    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let scheduler = Scheduler::new(storage, dispatcher)
        .with_config(config.clone())
        .with_event_bus(event_bus);

    if let Some(dir) = jobs_dir {
        info!("Loading jobs from: {}", dir.display());
        let jobs = load_jobs_from_directory(&dir, &config)?;
        if jobs.is_empty() {
            warn!("No job files found in {}", dir.display());
        }
        let service = scheduler.service();
        for job in jobs {
            let name = job.name.clone();
            let job_type = job.job_type;
            match service.submit(job).await {
                Ok(_) => info!("  - {} ({}) submitted", name, job_type.as_str()),
                Err(e) => warn!("  - {} rejected: {}", name, e),
            }
        }
    }

    info!("Starting engine with {} worker(s)...", config.workers);
    info!("Press Ctrl+C to stop");

    let (handle, scheduler_task) = scheduler.start().await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    Ok(())
}

/// Validate job files without running.
fn validate_jobs(config: &EngineConfig, jobs_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating jobs in: {}", jobs_dir.display());

    match load_jobs_from_directory(jobs_dir, config) {
        Ok(jobs) => {
            info!("All {} job(s) are valid:", jobs.len());
            for job in &jobs {
                info!("  - {} ({}): OK", job.name, job.job_type.as_str());
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

async fn submit_job(config: &EngineConfig, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let definition = YamlLoader::load_job_definition(file, config)?;
    let service = open_service(config).await?;
    let receipt = service.submit(definition).await?;
    match receipt.execution_id {
        Some(id) => println!("Submitted '{}' (execution: {})", receipt.job_name, id),
        None => println!("Submitted '{}'", receipt.job_name),
    }
    Ok(())
}

async fn inspect_executions(
    config: &EngineConfig,
    filter: &ExecutionFilter,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = open_service(config).await?;
    let executions = service.inspect(filter).await?;

    if executions.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    for exec in &executions {
        println!("{}  {}", exec.id, exec.job_name);
        println!("  State: {}", exec.state);
        println!("  Queue: {}", exec.queue);
        println!("  Attempts: {}/{}", exec.attempt_count, exec.max_retries + 1);
        println!("  Ready at: {}", exec.ready_at);
        if let Some(scheduled_for) = exec.scheduled_for {
            println!("  Scheduled for: {}", scheduled_for);
        }
        if let Some(error) = &exec.last_error {
            println!("  Last error: {}", error);
        }
        println!();
    }
    Ok(())
}

async fn list_jobs(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let service = open_service(config).await?;
    let jobs = service.list_jobs().await?;

    if jobs.is_empty() {
        println!("No jobs stored");
        return Ok(());
    }

    for job in &jobs {
        let def = &job.definition;
        println!("{}", def.name);
        println!("  Type: {}", def.job_type.as_str());
        if let Some(expr) = &def.cron_expression {
            println!("  Schedule: {} ({})", expr, def.timezone_or_default());
        }
        if let Some(next) = job.next_fire_at {
            println!("  Next fire: {}", next);
        }
        println!("  Request: {} {}", def.request.method, def.request.url);
        println!("  Queue: {}", def.queue);
        println!("  Max retries: {}", def.max_retries);
        println!();
    }
    Ok(())
}
