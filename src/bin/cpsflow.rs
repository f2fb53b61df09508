use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cpsflow::cli::{self, ResumeAction, StatusReport};
use cpsflow::config::EngineConfig;
use cpsflow::runtime::Executable;
use cpsflow::utils::LoggingConfig;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "cpsflow", version, about = "Durable flow runner", author)]
struct Cli {
    /// JSON engine configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a script in a fresh execution directory
    Run {
        script: PathBuf,
        /// Defaults to a directory under the configured home
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, requires = "number")]
        job: Option<String>,
        #[arg(long, requires = "job")]
        number: Option<u64>,
        #[arg(long)]
        sandbox: bool,
        #[arg(long)]
        wait: bool,
    },
    /// Reload an execution and optionally resume a thread or answer an input
    Resume {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, conflicts_with = "input")]
        thread: Option<u32>,
        /// JSON value passed to the thread or input
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        input: Option<String>,
        #[arg(long, requires = "input")]
        abort: bool,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        wait: bool,
    },
    /// Print the flow graph
    Graph {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Print the execution record and thread dump
    Status {
        #[arg(long)]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::from_env()?,
    };
    LoggingConfig::init_for(&config);

    let name = cli.command.name();
    if let Err(err) = execute(cli.command, &config).await {
        cpsflow::log_error!(err, command = name);
        return Err(err);
    }
    Ok(())
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Run { .. } => "run",
            Command::Resume { .. } => "resume",
            Command::Graph { .. } => "graph",
            Command::Status { .. } => "status",
        }
    }
}

async fn execute(command: Command, config: &EngineConfig) -> anyhow::Result<()> {
    match command {
        Command::Run {
            script,
            dir,
            job,
            number,
            sandbox,
            wait,
        } => {
            let build = job.zip(number).map(|(job, number)| Executable::new(job, number));
            let dir = dir.unwrap_or_else(|| config.execution_dir(&script, build.as_ref()));
            let report = cli::run_script(&script, &dir, build, sandbox, wait, config).await?;
            render_status(&report);
        }
        Command::Resume {
            dir,
            thread,
            value,
            input,
            abort,
            user,
            wait,
        } => {
            let value = parse_value(value)?;
            let action = match (thread, input) {
                (Some(id), _) => ResumeAction::Thread { id, value },
                (None, Some(input)) if abort => ResumeAction::Abort { input, user },
                (None, Some(input)) => ResumeAction::Proceed { input, value },
                (None, None) => ResumeAction::None,
            };
            let report = cli::resume(&dir, action, wait, config).await?;
            render_status(&report);
        }
        Command::Graph { dir } => {
            for line in cli::graph(&dir, config).await? {
                println!("{line}");
            }
        }
        Command::Status { dir } => {
            let record = cli::read_record(&dir)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            let report = cli::status(&dir, config).await?;
            render_status(&report);
        }
    }
    Ok(())
}

fn parse_value(value: Option<String>) -> anyhow::Result<Value> {
    match value {
        None => Ok(Value::Null),
        Some(text) => Ok(serde_json::from_str(&text).unwrap_or(Value::String(text))),
    }
}

fn render_status(report: &StatusReport) {
    println!("{:<12} {}", "Execution", report.url);
    println!("{:<12} {}", "Result", report.result);
    println!("{:<12} {}", "Complete", report.complete);
    println!("{:<12} {}", "Heads", report.heads.join(", "));
    if !report.threads.is_empty() {
        println!("{:<8} {:<8} {:<10} {:<10} {}", "Thread", "Head", "Node", "Runnable", "Step");
        for thread in &report.threads {
            println!(
                "{:<8} {:<8} {:<10} {:<10} {}",
                thread.id,
                thread.head,
                thread.node.clone().unwrap_or_default(),
                thread.runnable,
                thread.step.clone().unwrap_or_default()
            );
        }
    }
    for input in &report.pending_inputs {
        println!("Waiting for input `{input}`");
    }
    for line in &report.console {
        println!("| {line}");
    }
}
