use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use taskhub_client::BlockingControlPlaneClient;
use taskhub_core::api::{
    BatchRetryRequest, ClearQueueRequest, CreateTaskRequest, ListTasksQuery, QueueStatsResponse,
    TaskDetailResponse, TaskListResponse, WorkerStats,
};
use taskhub_core::WorkerConfig;

#[derive(Parser, Debug)]
#[command(name = "tq-admin")]
#[command(about = "Task hub admin CLI", long_about = None)]
struct Args {
    /// Control plane base URL
    #[arg(long, env = "TASKHUB_URL", default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered workers
    Workers,

    /// Show one worker and its task statistics
    Worker {
        name: String,
    },

    /// Remove a worker registration
    DeleteWorker {
        name: String,
    },

    /// List tasks
    Tasks {
        #[arg(short, long)]
        worker: Option<String>,

        /// pending, running, success, fail or dead
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long)]
        queue: Option<String>,

        #[arg(short, long, default_value = "50")]
        limit: i64,

        #[arg(long, default_value = "0")]
        offset: i64,
    },

    /// Show a task and its attempts
    Task {
        task_id: String,
    },

    /// Submit a task through the control plane
    Submit {
        #[arg(short, long)]
        worker: String,

        #[arg(short, long)]
        queue: String,

        #[arg(short = 'P', long)]
        priority: Option<String>,

        #[arg(long)]
        task_id: Option<String>,

        /// Payload file containing JSON
        #[arg(short, long)]
        payload_file: String,

        #[arg(long)]
        delay: Option<i64>,
    },

    /// Replay a finished task under a new id
    Replay {
        task_id: String,

        #[arg(long)]
        delay: Option<i64>,
    },

    /// Replay failed tasks in bulk
    BatchRetry {
        #[arg(short, long)]
        worker: Option<String>,

        #[arg(short, long)]
        status: Option<String>,

        /// Explicit task ids; overrides the filters
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,

        #[arg(short, long)]
        limit: Option<i64>,
    },

    /// Broker counters for every queue of a worker
    Queues {
        worker: String,
    },

    /// Delete pending (or, with --dead, archived) tasks from a worker's queues
    ClearQueue {
        worker: String,

        #[arg(short, long)]
        queue: Option<String>,

        #[arg(short = 'P', long)]
        priority: Option<String>,

        #[arg(long)]
        dead: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = BlockingControlPlaneClient::new(args.api.as_str())?;
    let format = args.format;

    match args.command {
        Commands::Workers => {
            let workers = client.list_workers()?;
            print_with(format, &workers, workers_table)?;
        }

        Commands::Worker { name } => {
            let worker = client.get_worker(&name)?;
            let stats = client.worker_stats(&name)?;
            match format {
                OutputFormat::Table => {
                    println!("{}", workers_table(&vec![worker.clone()]));
                    println!("{}", stats_table(&stats));
                }
                _ => emit(format, &serde_json::json!({ "worker": worker, "stats": stats }))?,
            }
        }

        Commands::DeleteWorker { name } => {
            client.delete_worker(&name)?;
            println!("Worker {name} deleted");
        }

        Commands::Tasks { worker, status, queue, limit, offset } => {
            let tasks = client.list_tasks(&ListTasksQuery {
                worker_name: worker,
                status,
                queue,
                limit: Some(limit),
                offset: Some(offset),
            })?;
            print_with(format, &tasks, tasks_table)?;
        }

        Commands::Task { task_id } => {
            let detail = client.get_task(&task_id)?;
            print_with(format, &detail, task_detail_table)?;
        }

        Commands::Submit { worker, queue, priority, task_id, payload_file, delay } => {
            let contents = std::fs::read_to_string(&payload_file)?;
            let payload = serde_json::value::RawValue::from_string(contents)?;
            let created = client.create_task(&CreateTaskRequest {
                worker_name: worker,
                queue,
                priority,
                task_id,
                payload,
                delay_seconds: delay,
                run_at: None,
            })?;
            match format {
                OutputFormat::Table => println!("Task enqueued: {}", created.task_id),
                _ => emit(format, &created)?,
            }
        }

        Commands::Replay { task_id, delay } => {
            let replayed = client.replay(&task_id, delay)?;
            match format {
                OutputFormat::Table => println!("Task {task_id} replayed as {}", replayed.new_task_id),
                _ => emit(format, &replayed)?,
            }
        }

        Commands::BatchRetry { worker, status, ids, limit } => {
            let result = client.batch_retry(&BatchRetryRequest {
                worker_name: worker,
                status,
                task_ids: Some(ids).filter(|ids| !ids.is_empty()),
                limit,
            })?;
            match format {
                OutputFormat::Table => {
                    println!("Retried {} task(s)", result.total_retried);
                    for id in &result.new_task_ids {
                        println!("  new: {id}");
                    }
                    for id in &result.failed_task_ids {
                        println!("  failed: {id}");
                    }
                }
                _ => emit(format, &result)?,
            }
        }

        Commands::Queues { worker } => {
            let stats = client.queue_stats(&worker)?;
            print_with(format, &stats, queues_table)?;
        }

        Commands::ClearQueue { worker, queue, priority, dead } => {
            let cleared = client.clear_queue(
                &ClearQueueRequest {
                    worker_name: worker,
                    queue,
                    priority,
                },
                dead,
            )?;
            match format {
                OutputFormat::Table => println!("Deleted {} task(s)", cleared.deleted),
                _ => emit(format, &cleared)?,
            }
        }
    }

    Ok(())
}

fn print_with<T: Serialize>(format: OutputFormat, value: &T, table: impl Fn(&T) -> Table) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            println!("{}", table(value));
            Ok(())
        }
        _ => emit(format, value),
    }
}

fn emit<T: Serialize>(format: OutputFormat, value: &T) -> anyhow::Result<()> {
    match format {
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(header);
    table
}

fn workers_table(workers: &Vec<WorkerConfig>) -> Table {
    let mut table = new_table(vec!["Worker", "Enabled", "Queue Groups", "Retry", "Timeout", "Last Heartbeat"]);
    for worker in workers {
        let groups = worker
            .queue_groups
            .iter()
            .map(|g| format!("{}({})", g.name, g.concurrency))
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            worker.worker_name.clone(),
            worker.is_enabled.to_string(),
            groups,
            worker.default_retry_count.to_string(),
            format!("{}s", worker.default_timeout_seconds),
            worker
                .last_heartbeat_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    table
}

fn stats_table(stats: &WorkerStats) -> Table {
    let mut table = new_table(vec!["Metric", "Value"]);
    table.add_row(vec!["Total Tasks".to_string(), stats.total.to_string()]);
    for (status, count) in &stats.by_status {
        table.add_row(vec![format!("Status {status}"), count.to_string()]);
    }
    for (queue, count) in &stats.by_queue {
        table.add_row(vec![format!("Queue {queue}"), count.to_string()]);
    }
    table.add_row(vec!["Success Rate".to_string(), format!("{:.1}%", stats.success_rate * 100.0)]);
    table.add_row(vec!["Avg Duration".to_string(), format!("{:.0} ms", stats.avg_duration_ms)]);
    table
}

fn tasks_table(tasks: &TaskListResponse) -> Table {
    let mut table = new_table(vec!["Task ID", "Worker", "Queue", "Priority", "Status", "Attempt", "Updated"]);
    for task in &tasks.items {
        table.add_row(vec![
            task.task_id.clone(),
            task.worker_name.clone(),
            task.queue.clone(),
            task.priority_name.clone(),
            task.status.to_string(),
            task.last_attempt.to_string(),
            task.updated_at.to_rfc3339(),
        ]);
    }
    table
}

fn task_detail_table(detail: &TaskDetailResponse) -> Table {
    let task = &detail.item;
    let mut table = new_table(vec!["Field", "Value"]);
    table.add_row(vec!["ID".to_string(), task.task_id.clone()]);
    table.add_row(vec!["Worker".to_string(), task.worker_name.clone()]);
    table.add_row(vec!["Queue".to_string(), format!("{}:{}", task.queue, task.priority_name)]);
    table.add_row(vec!["Status".to_string(), task.status.to_string()]);
    table.add_row(vec!["Last Attempt".to_string(), task.last_attempt.to_string()]);
    table.add_row(vec!["Created".to_string(), task.created_at.to_rfc3339()]);
    if !task.last_error.is_empty() {
        table.add_row(vec!["Error".to_string(), task.last_error.clone()]);
    }
    table.add_row(vec!["Payload".to_string(), task.payload.to_string()]);

    for attempt in &detail.attempts {
        let duration = attempt
            .duration_ms
            .map(|ms| format!(" {ms}ms"))
            .unwrap_or_default();
        table.add_row(vec![
            format!("Attempt {}", attempt.attempt),
            format!("{}{} by {}", attempt.status, duration, attempt.worker_name),
        ]);
    }
    table
}

fn queues_table(stats: &QueueStatsResponse) -> Table {
    let mut table = new_table(vec![
        "Queue", "Priority", "Pending", "Active", "Scheduled", "Retry", "Archived", "Completed",
    ]);
    for entry in &stats.queues {
        let c = &entry.counters;
        table.add_row(vec![
            entry.queue.clone(),
            entry.priority.clone(),
            c.pending.to_string(),
            c.active.to_string(),
            c.scheduled.to_string(),
            c.retry.to_string(),
            c.archived.to_string(),
            c.completed.to_string(),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhub_core::api::{QueueCounters, QueueStatsEntry};
    use taskhub_core::QueueGroup;

    #[test]
    fn test_parse_batch_retry_ids() {
        let args = Args::try_parse_from(["tq-admin", "--format", "json", "batch-retry", "--ids", "a1,b2"]).unwrap();
        assert_eq!(args.format, OutputFormat::Json);
        match args.command {
            Commands::BatchRetry { ids, worker, .. } => {
                assert_eq!(ids, vec!["a1".to_string(), "b2".to_string()]);
                assert!(worker.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_workers_table_lists_groups() {
        let worker = WorkerConfig::new("w1-worker", vec![QueueGroup::new("jobs", 5)])
            .normalized()
            .unwrap();
        let rendered = workers_table(&vec![worker]).to_string();
        assert!(rendered.contains("w1-worker"));
        assert!(rendered.contains("jobs(5)"));
    }

    #[test]
    fn test_queues_table() {
        let stats = QueueStatsResponse {
            worker_name: "w1-worker".into(),
            queues: vec![QueueStatsEntry {
                routing_key: "w1-worker:jobs:critical".into(),
                queue: "jobs".into(),
                priority: "critical".into(),
                counters: QueueCounters {
                    pending: 7,
                    ..Default::default()
                },
            }],
        };
        let rendered = queues_table(&stats).to_string();
        assert!(rendered.contains("critical"));
        assert!(rendered.contains('7'));
    }
}
