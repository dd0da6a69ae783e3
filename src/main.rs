use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use bgjobs::config::Config;
use bgjobs::events::LogSink;
use bgjobs::job::{JobId, JobRecordStore, JobStatus, JsonJobStore};
use bgjobs::orchestration::JobManager;
use bgjobs::registry::{HandlerRegistry, TaskContext};
use bgjobs::task::TaskSeed;
use bgjobs::{jlog_error, Error, Result};

/// Name of the demo handler shipped with the binary.
const SLEEP_HANDLER: &str = "sleep";

/// bgjobs - durable background jobs with bounded concurrency
#[derive(Parser, Debug)]
#[command(name = "bgjobs")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    BGJOBS_DEBUG=1  Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.bgjobs/bgjobs.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a job of sleeping tasks and wait for it to finish
    Run {
        #[arg(long)]
        name: String,

        /// Number of tasks
        #[arg(long)]
        tasks: usize,

        /// Tasks allowed to run at once (defaults to the configured value)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Make every M-th task fail
        #[arg(long)]
        fail_every: Option<usize>,

        /// How long each task sleeps
        #[arg(long, default_value_t = 200)]
        delay_ms: u64,

        /// Actor recorded as the job's starter
        #[arg(long, default_value = "cli")]
        actor: String,

        /// Job-level field set at creation; repeatable
        #[arg(long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },

    /// Resume jobs interrupted by a restart and wait for them
    Resume,

    /// List jobs started by an actor
    List {
        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Show a page of a job's tasks
    Tasks {
        job_id: String,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Cancel a running job
    Cancel { job_id: String },

    /// Delete a job and its task records
    Delete { job_id: String },
}

/// Task state used by the sleep handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SleepTask {
    n: usize,
    delay_ms: u64,
    fail: bool,
    #[serde(default)]
    slept: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    bgjobs::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    config.ensure_dirs()?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cli.command, config));
    if let Err(e) = &result {
        jlog_error!("Command failed: {}", e);
    }
    result
}

async fn run(command: Command, config: Config) -> Result<()> {
    let jobs: Arc<dyn JobRecordStore> = Arc::new(JsonJobStore::new(config.jobs_file()?));
    let registry = Arc::new(HandlerRegistry::new());
    let limit = match &command {
        Command::Run {
            concurrency: Some(k),
            ..
        } => *k,
        _ => config.effective_concurrency(),
    };
    register_sleep(&registry, limit)?;
    let manager = JobManager::new(jobs, Arc::new(LogSink), registry, config.store_root()?);

    match command {
        Command::Run {
            name,
            tasks,
            fail_every,
            delay_ms,
            actor,
            fields,
            ..
        } => {
            let state = parse_fields(&fields)?;
            run_job(&manager, &name, &actor, tasks, fail_every, delay_ms, state).await
        }
        Command::Resume => run_resume(&manager).await,
        Command::List { actor } => run_list(&manager, &actor).await,
        Command::Tasks {
            job_id,
            offset,
            limit,
        } => run_tasks_page(&manager, &parse_job_id(&job_id)?, offset, limit).await,
        Command::Cancel { job_id } => {
            let id = parse_job_id(&job_id)?;
            manager.cancel_job(&id).await?;
            println!("Cancelled job {}", id);
            Ok(())
        }
        Command::Delete { job_id } => {
            let id = parse_job_id(&job_id)?;
            manager.delete_job(&id).await?;
            println!("Deleted job {}", id);
            Ok(())
        }
    }
}

fn register_sleep(registry: &HandlerRegistry, limit: usize) -> Result<()> {
    registry.register(SLEEP_HANDLER, limit, |ctx: TaskContext| async move {
        let mut task: SleepTask = ctx.state_as().await?;
        tokio::time::sleep(Duration::from_millis(task.delay_ms)).await;
        if task.fail {
            return Err(Error::task(format!("task {} was told to fail", task.n)));
        }
        task.slept = true;
        ctx.set_state_from(&task).await
    })?;
    registry.register_presentation(SLEEP_HANDLER, "builtin/sleep");
    Ok(())
}

fn parse_job_id(s: &str) -> Result<JobId> {
    s.parse()
        .map_err(|_| Error::Validation(format!("not a job id: {}", s)))
}

async fn run_job(
    manager: &JobManager,
    name: &str,
    actor: &str,
    count: usize,
    fail_every: Option<usize>,
    delay_ms: u64,
    state: Value,
) -> Result<()> {
    let seeds = (0..count)
        .map(|n| {
            let fail = matches!(fail_every, Some(m) if m > 0 && (n + 1) % m == 0);
            let task = SleepTask {
                n,
                delay_ms,
                fail,
                slept: false,
            };
            Ok(TaskSeed::new(serde_json::to_value(&task)?))
        })
        .collect::<Result<Vec<TaskSeed>>>()?;

    let handle = manager
        .start_job_with_state(name, actor, seeds, SLEEP_HANDLER, state)
        .await?;
    println!("Started job {} ({} tasks)", handle.id(), count);
    let id = handle.id();
    let status = handle.wait().await?;
    println!("Job {} finished: {}", id, status);
    Ok(())
}

/// `KEY=VALUE` pairs as a JSON object. Values that parse as JSON keep their
/// type; anything else is stored as a string.
fn parse_fields(fields: &[String]) -> Result<Value> {
    let mut map = Map::new();
    for field in fields {
        let (key, raw) = field
            .split_once('=')
            .ok_or_else(|| Error::Validation(format!("expected KEY=VALUE, got '{}'", field)))?;
        if key.trim().is_empty() {
            return Err(Error::Validation(format!("empty key in '{}'", field)));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(Value::Object(map))
}

async fn run_resume(manager: &JobManager) -> Result<()> {
    let report = manager.resume_all_unfinished().await?;
    for id in &report.unrecoverable {
        println!("Cannot resume {}: handler not registered", id);
    }
    for (id, e) in &report.failed {
        println!("Failed to resume {}: {}", id, e);
    }
    if report.resumed.is_empty() {
        println!("No jobs to resume");
        return Ok(());
    }
    for handle in report.resumed {
        let id = handle.id();
        println!("Resumed job {}", id);
        let status = handle.wait().await?;
        println!("Job {} finished: {}", id, status);
    }
    Ok(())
}

async fn run_list(manager: &JobManager, actor: &str) -> Result<()> {
    let jobs = manager.list_jobs_for(actor).await?;
    if jobs.is_empty() {
        println!("No jobs for {}", actor);
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<16} {:>3}%  {:<18} {}",
            job.id,
            format_status(job.status),
            job.progress,
            job.name,
            job.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

async fn run_tasks_page(manager: &JobManager, id: &JobId, offset: usize, limit: usize) -> Result<()> {
    let page = manager.tasks_page(id, offset, limit).await?;
    for task in &page.tasks {
        println!("{:>5}  {:<12} {}", task.index, task.status.to_string(), task.state);
    }
    if let Some(next) = page.next_offset {
        println!("More tasks: --offset {}", next);
    }
    Ok(())
}

fn format_status(status: JobStatus) -> String {
    match status {
        JobStatus::Scheduled => "scheduled".to_string(),
        JobStatus::InProgress => "running".to_string(),
        JobStatus::Done => "done".to_string(),
        JobStatus::DoneWithErrors => "done with errors".to_string(),
        JobStatus::Cancelled => "cancelled".to_string(),
    }
}
