//! jobq CLI — operator interface to a jobq database.

use chrono::Utc;
use clap::{Parser, Subcommand};
use jobq::{Engine, Jid, PutRequest};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jobq", about = "Embedded job queue")]
struct Cli {
    /// Path to the queue database
    #[arg(long, default_value = "jobq.db")]
    db: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a job
    Put {
        /// Destination queue
        queue: String,
        /// JSON payload
        #[arg(long)]
        data: Option<String>,
        /// Explicit jid (random if omitted)
        #[arg(long)]
        jid: Option<String>,
        /// Priority (higher pops first)
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Seconds before the job becomes available
        #[arg(long, default_value_t = 0)]
        delay: i64,
        /// Retry budget
        #[arg(long, default_value_t = 5)]
        retries: i64,
        /// Tags
        #[arg(long)]
        tag: Vec<String>,
        /// Jids this job must wait on
        #[arg(long)]
        depends: Vec<String>,
    },
    /// Pop jobs for a worker
    Pop {
        queue: String,
        worker: String,
        #[arg(long, default_value_t = 1)]
        count: u64,
    },
    /// Inspect waiting jobs without taking a lease
    Peek {
        queue: String,
        #[arg(long, default_value_t = 1)]
        count: u64,
    },
    /// Show a job
    Show { jid: String },
    /// List queues with their counts
    Queues,
    /// Wait/run statistics for a queue today
    Stats { queue: String },
    /// Failure groups, or jids within one group
    Failed {
        group: Option<String>,
        #[arg(long, default_value_t = 25)]
        limit: u64,
    },
    /// Move failed jobs back into a queue
    Unfail {
        group: String,
        queue: String,
        #[arg(long, default_value_t = 25)]
        count: u64,
    },
    /// Configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show one key, or all effective settings
    Get { key: Option<String> },
    /// Store a value
    Set { key: String, value: String },
    /// Revert a key to its default
    Unset { key: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut engine = Engine::open(&cli.db)?;
    let now = Utc::now();

    match cli.command {
        Command::Put {
            queue,
            data,
            jid,
            priority,
            delay,
            retries,
            tag,
            depends,
        } => {
            let data: serde_json::Value = match data {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::json!({}),
            };
            let mut req = PutRequest::new(&queue)
                .data(data)
                .priority(priority)
                .delay(delay)
                .retries(retries)
                .tags(tag)
                .depends(depends.into_iter().map(Jid::from).collect());
            if let Some(jid) = jid {
                req = req.jid(Jid::from(jid));
            }
            let jid = engine.put(req, now)?;
            println!("{jid}");
        }
        Command::Pop {
            queue,
            worker,
            count,
        } => {
            for job in engine.pop(&queue, &worker, count, now)? {
                println!("{}  {}", job.jid, serde_json::to_string(&job.data)?);
            }
        }
        Command::Peek { queue, count } => {
            for job in engine.peek(&queue, count, now)? {
                println!("{}  {}", job.jid, serde_json::to_string(&job.data)?);
            }
        }
        Command::Show { jid } => {
            let jid = Jid::from(jid);
            match engine.get(&jid)? {
                Some(job) => print!("{}", serde_json::to_string_pretty(&job)?),
                None => anyhow::bail!("no job {jid}"),
            }
            println!();
        }
        Command::Queues => {
            println!(
                "{:<24}  {:>7}  {:>9}  {:>7}  {:>7}  {:>7}  {:>9}",
                "QUEUE", "WAITING", "SCHEDULED", "RUNNING", "STALLED", "DEPENDS", "RECURRING"
            );
            for c in engine.queues(now)? {
                println!(
                    "{:<24}  {:>7}  {:>9}  {:>7}  {:>7}  {:>7}  {:>9}",
                    c.name, c.waiting, c.scheduled, c.running, c.stalled, c.depends, c.recurring
                );
            }
        }
        Command::Stats { queue } => {
            let stats = engine.stats(&queue, now)?;
            println!("queue:    {}", stats.queue);
            println!("failed:   {}", stats.failed);
            println!("retries:  {}", stats.retries);
            println!(
                "wait:     n={} mean={:.3}s std={:.3}s",
                stats.wait.count,
                stats.wait.mean,
                stats.wait.std_dev()
            );
            println!(
                "run:      n={} mean={:.3}s std={:.3}s",
                stats.run.count,
                stats.run.mean,
                stats.run.std_dev()
            );
        }
        Command::Failed { group, limit } => match group {
            Some(group) => {
                for jid in engine.failed_jobs(&group, 0, limit)? {
                    println!("{jid}");
                }
            }
            None => {
                for (group, count) in engine.failed()? {
                    println!("{count:>7}  {group}");
                }
            }
        },
        Command::Unfail {
            group,
            queue,
            count,
        } => {
            let moved = engine.unfail(&group, &queue, count, now)?;
            println!("{moved} job(s) moved to {queue}");
        }
        Command::Config { action } => match action {
            ConfigAction::Get { key: Some(key) } => match engine.config_get(&key)? {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("unknown key '{key}'"),
            },
            ConfigAction::Get { key: None } => {
                for (key, value) in engine.config_all()? {
                    println!("{key} = {value}");
                }
            }
            ConfigAction::Set { key, value } => engine.config_set(&key, &value)?,
            ConfigAction::Unset { key } => engine.config_unset(&key)?,
        },
    }

    Ok(())
}
