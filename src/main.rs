use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use switchyard_agents::BuiltinFactory;
use switchyard_core::config::AppConfig;
use switchyard_core::event::EventBus;
use switchyard_core::guardrail::{Guardrails, ProposedAction};
use switchyard_core::traits::TraceStore;
use switchyard_core::types::{JsonMap, RunRequest, RunResult, RunStatus, TraceQuery};
use switchyard_core::workflow::WorkflowConfig;
use switchyard_engine::{Engine, ReplayComparison, RunLogger};
use switchyard_store::SqliteTraceStore;

#[derive(Parser)]
#[command(name = "switchyard", version, about = "Agent graph execution engine")]
struct Cli {
    /// Path to engine settings
    #[arg(short, long, default_value = "switchyard.toml", env = "SWITCHYARD_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task through a workflow
    Run {
        /// Workflow document (TOML or JSON)
        #[arg(short, long)]
        workflow: PathBuf,
        /// Runtime memory as a JSON object, merged over the workflow's global seed
        #[arg(short, long)]
        memory: Option<String>,
        /// The task text
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,
    },
    /// Replay a stored trace, optionally under a different workflow
    Replay {
        task_id: String,
        /// Substitute workflow (default: the configuration captured in the trace)
        #[arg(short, long)]
        workflow: Option<PathBuf>,
    },
    /// Validate a workflow document without running it
    Validate {
        #[arg(short, long)]
        workflow: PathBuf,
    },
    /// Inspect stored traces
    Traces {
        #[command(subcommand)]
        action: TracesAction,
    },
    /// Dry-run an agent's guardrail
    Check {
        #[command(subcommand)]
        action: CheckAction,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum TracesAction {
    /// List traces, newest first
    List {
        #[arg(long)]
        organization: Option<String>,
        #[arg(long)]
        workflow: Option<String>,
        /// running, ok, error or stopped
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print one trace as JSON
    Show { task_id: String },
}

#[derive(Subcommand)]
enum CheckAction {
    /// Check a SQL statement against a database agent's guardrail
    Sql {
        #[arg(short, long)]
        workflow: PathBuf,
        #[arg(short, long)]
        agent: String,
        sql: String,
    },
    /// Check a URL against an API agent's guardrail
    Url {
        #[arg(short, long)]
        workflow: PathBuf,
        #[arg(short, long)]
        agent: String,
        #[arg(short, long, default_value = "GET")]
        method: String,
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("switchyard=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle commands that need no settings first
    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "switchyard", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { ref workflow } => {
            let config = load_workflow(workflow)?;
            println!(
                "{}: ok ({} agents, entry {})",
                workflow.display(),
                config.agents.len(),
                config.entry_agent().map(|a| a.name.as_str()).unwrap_or("-")
            );
            return Ok(());
        }
        Commands::Check { ref action } => return check(action),
        _ => {}
    }

    let config = load_settings(&cli.config)?;
    let store = Arc::new(SqliteTraceStore::open(&config.store_path())?);

    match cli.command {
        Commands::Run {
            workflow,
            memory,
            task,
        } => {
            let workflow = load_workflow(&workflow)?;
            let memory = memory.as_deref().map(parse_memory).transpose()?;
            let mut request = RunRequest::new(task.join(" "));
            request.memory = memory;

            let session = Session::start(&config, store.clone());
            let prepared = session.engine.prepare(workflow)?;
            let result = session.engine.run(&prepared, request).await;
            session.finish().await;

            let result = result?;
            print_result(&result)?;
            exit_for(&result);
        }
        Commands::Replay { task_id, workflow } => {
            let workflow = workflow.as_deref().map(load_workflow).transpose()?;
            let original = store
                .load(&task_id)?
                .with_context(|| format!("trace {} not found", task_id))?;

            let session = Session::start(&config, store.clone());
            let result = session.engine.replay_by_id(&task_id, workflow).await;
            session.finish().await;

            let result = result?;
            print_result(&result)?;
            if let Some(replay) = store.load(result.task_id.as_str())? {
                let comparison = ReplayComparison::between(&original, &replay);
                println!("{}", serde_json::to_string_pretty(&comparison)?);
            }
            exit_for(&result);
        }
        Commands::Traces { action } => match action {
            TracesAction::List {
                organization,
                workflow,
                status,
                limit,
            } => {
                let summaries = store.list(&TraceQuery {
                    organization,
                    workflow,
                    status,
                    limit: Some(limit),
                })?;
                if summaries.is_empty() {
                    println!("No traces.");
                }
                for s in summaries {
                    println!(
                        "{}  {:<8} {:>4} steps  ${:.4}  {}  {}{}",
                        s.task_id,
                        s.status.as_str(),
                        s.step_count,
                        s.total_cost,
                        s.started_at.format("%Y-%m-%d %H:%M:%S"),
                        s.workflow_id.as_deref().unwrap_or("-"),
                        s.replay_of
                            .map(|r| format!("  (replay of {})", r))
                            .unwrap_or_default()
                    );
                }
            }
            TracesAction::Show { task_id } => {
                let trace = store
                    .load(&task_id)?
                    .with_context(|| format!("trace {} not found", task_id))?;
                println!("{}", serde_json::to_string_pretty(&trace)?);
            }
        },
        Commands::Completions { .. } | Commands::Validate { .. } | Commands::Check { .. } => {}
    }

    Ok(())
}

/// Engine plus its optional JSONL run logger.
struct Session {
    engine: Engine,
    logger: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Session {
    fn start(config: &AppConfig, store: Arc<SqliteTraceStore>) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let logger = if config.log.enabled {
            let cancel = CancellationToken::new();
            let logger = RunLogger::new(config.log_dir(), config.log.level);
            let handle = tokio::spawn(logger.run(event_bus.clone(), cancel.clone()));
            info!(level = config.log.level, dir = %config.log_dir().display(), "Run logging enabled");
            Some((cancel, handle))
        } else {
            None
        };

        let factory = Arc::new(BuiltinFactory::new(config.clone()));
        let engine = Engine::new(factory, store).with_events(event_bus);
        Self { engine, logger }
    }

    /// Stop the logger after it has written every queued event.
    async fn finish(self) {
        if let Some((cancel, handle)) = self.logger {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Run logger task failed");
            }
        }
    }
}

fn load_settings(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading settings");
        Ok(AppConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "Settings file not found, using defaults");
        Ok(AppConfig::default())
    }
}

fn load_workflow(path: &Path) -> anyhow::Result<WorkflowConfig> {
    WorkflowConfig::load(path).with_context(|| format!("invalid workflow {}", path.display()))
}

fn parse_memory(raw: &str) -> anyhow::Result<JsonMap> {
    match serde_json::from_str::<serde_json::Value>(raw).context("--memory is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("--memory must be a JSON object"),
    }
}

fn print_result(result: &RunResult) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

/// Exit 1 on error, 2 when a ceiling stopped the run.
fn exit_for(result: &RunResult) {
    match result.status {
        RunStatus::Error => std::process::exit(1),
        RunStatus::Stopped => std::process::exit(2),
        RunStatus::Ok | RunStatus::Running => {}
    }
}

fn check(action: &CheckAction) -> anyhow::Result<()> {
    let (workflow, agent, proposed) = match action {
        CheckAction::Sql {
            workflow,
            agent,
            sql,
        } => (workflow, agent, ProposedAction::sql(sql.as_str())),
        CheckAction::Url {
            workflow,
            agent,
            method,
            url,
        } => (workflow, agent, ProposedAction::http(url.as_str(), method.as_str())),
    };

    let config = load_workflow(workflow)?;
    let spec = config
        .agent(agent)
        .with_context(|| format!("agent {} is not declared in {}", agent, workflow.display()))?;
    let kind = spec
        .agent_kind()
        .with_context(|| format!("agent {} has no worker kind", agent))?;

    let guardrails = Guardrails::standard();
    if guardrails.evaluator(kind).is_none() {
        bail!("{} agents have no guardrail", kind);
    }
    match guardrails.check(kind, &proposed, &spec.policy.guardrails) {
        None => {
            println!("allowed: {}", proposed.summary());
            Ok(())
        }
        Some(violation) => {
            println!("blocked: {}", violation);
            std::process::exit(1);
        }
    }
}
