use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{info, warn};

use spindle::compiler::{compile, load_process_from_yaml, load_registry};
use spindle::events::Event;
use spindle::runtime::evaluator::{EvalexprEvaluator, Evaluator};
use spindle::runtime::redis_storage::RedisSnapshotStore;
use spindle::runtime::storage::{persist, restore};
use spindle::runtime::task::StateMask;
use spindle::{serializer, Workflow};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a process and run it until it completes or has to wait
    Run {
        /// Path to the process YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// YAML files of processes callable as sub-processes
        #[arg(long = "subprocess", short = 's')]
        subprocesses: Vec<PathBuf>,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,

        /// Write the resulting snapshot to this file
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Also store the snapshot in Redis under this key
        #[arg(long, requires = "redis")]
        key: Option<String>,

        /// Redis connection URL
        #[arg(long)]
        redis: Option<String>,
    },

    /// Upgrade a stored snapshot to the current serializer version
    Migrate {
        /// Snapshot JSON file
        input: PathBuf,

        /// Where to write the migrated snapshot (defaults to stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Load a snapshot, deliver events or fire timers, and keep running
    Resume {
        /// Snapshot JSON file; rewritten in place
        snapshot: PathBuf,

        /// Message to deliver
        #[arg(long)]
        message: Option<String>,

        /// Signal to deliver
        #[arg(long)]
        signal: Option<String>,

        /// Correlation properties of the message (key=value)
        #[arg(long, short = 'C', value_parser = parse_key_val)]
        correlation: Vec<(String, Value)>,

        /// Payload of the message, as JSON
        #[arg(long)]
        payload: Option<String>,

        /// Fire every timer that is due now
        #[arg(long)]
        timers: bool,
    },

    /// Load a snapshot from Redis, run what is ready, and store it back
    Step {
        #[arg(long, default_value = "redis://127.0.0.1:6379/0")]
        redis: String,

        key: String,
    },

    /// Show what is likely to run next
    Predict {
        snapshot: PathBuf,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse JSON from {}", path.display()))
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("Failed to write {}", path.display()))
}

fn report(workflow: &Workflow) {
    if workflow.is_completed() {
        info!(generation = workflow.generation(), "workflow completed");
        println!("{}", Value::Object(workflow.data()));
        return;
    }
    for task in workflow.get_tasks(StateMask::LIVE) {
        info!(task_id = %task.id, spec = %task.spec, state = %task.state, "pending");
    }
}

fn drive(workflow: &mut Workflow) {
    match workflow.advance_ready_tasks() {
        Ok(count) => info!(count, "tasks advanced"),
        Err(e) => warn!(error = %e, "run stopped on an error"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let evaluator: Arc<dyn Evaluator> = Arc::new(EvalexprEvaluator::new());

    match cli.command {
        Commands::Run { file, subprocesses, vars, snapshot, key, redis: redis_url } => {
            let process = load_process_from_yaml(&file)?;
            let data: Map<String, Value> = vars.into_iter().collect();

            let blueprint = compile(process).with_context(|| format!("Failed to compile {}", file.display()))?;
            let registry = load_registry(&subprocesses)?;
            info!(process = %blueprint.id, "starting");

            let mut workflow = Workflow::new(Arc::new(blueprint), registry, evaluator)?.with_data(data);
            drive(&mut workflow);
            report(&workflow);

            if let Some(path) = snapshot {
                write_json(&path, &serializer::serialize(&workflow)?)?;
            }
            if let (Some(key), Some(url)) = (key, redis_url) {
                let store = RedisSnapshotStore::new(redis::Client::open(url)?);
                persist(&store, &key, &workflow, None).await?;
                info!(key = %key, "snapshot stored");
            }
        }

        Commands::Migrate { input, output } => {
            let original = read_json(&input)?;
            let migrated = serializer::migrate(&original)
                .with_context(|| format!("Failed to migrate {}", input.display()))?;
            match output {
                Some(path) => write_json(&path, &migrated)?,
                None => println!("{}", serde_json::to_string_pretty(&migrated)?),
            }
        }

        Commands::Resume { snapshot, message, signal, correlation, payload, timers } => {
            let mut workflow = serializer::deserialize(read_json(&snapshot)?, evaluator)?;

            if let Some(name) = message {
                let mut event = Event::message(&name);
                for (k, v) in correlation {
                    event = event.with_correlation(&k, v);
                }
                if let Some(raw) = payload {
                    event = event.with_payload(serde_json::from_str::<Value>(&raw).context("Invalid payload JSON")?);
                }
                let caught = workflow.throw(event)?;
                info!(message = %name, caught, "message delivered");
            }
            if let Some(name) = signal {
                let caught = workflow.throw(Event::signal(&name))?;
                info!(signal = %name, caught, "signal delivered");
            }
            if timers {
                let fired = workflow.refresh_waiting_tasks(Utc::now())?;
                info!(fired, "timers checked");
            }

            drive(&mut workflow);
            report(&workflow);
            if let Some(next) = workflow.earliest_timer() {
                info!(at = %next, "next timer");
            }
            write_json(&snapshot, &serializer::serialize(&workflow)?)?;
        }

        Commands::Step { redis: url, key } => {
            let store = RedisSnapshotStore::new(redis::Client::open(url)?);
            let Some(mut workflow) = restore(&store, &key, evaluator).await? else {
                anyhow::bail!("no workflow stored under '{}'", key);
            };
            let loaded = workflow.generation();
            drive(&mut workflow);
            report(&workflow);
            persist(&store, &key, &workflow, Some(loaded)).await?;
        }

        Commands::Predict { snapshot } => {
            let workflow = serializer::deserialize(read_json(&snapshot)?, evaluator)?;
            for p in workflow.predict() {
                println!("{:indent$}{} {}", "", p.state, p.spec, indent = p.depth * 2);
            }
        }
    }

    Ok(())
}
