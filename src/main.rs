use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowrun_core::config::{AppConfig, ModelConfig};
use flowrun_core::event::RunStatus;
use flowrun_core::schema::Workflow;
use flowrun_engine::{NodeExecutorRegistry, WorkflowEngine};
use flowrun_tools::{ProcessRunner, ReqwestHttpClient, ToolRegistry};

#[derive(Parser)]
#[command(name = "flowrun", version, about = "Run workflow graphs with streaming events")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowrun.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow and print its events as JSON lines
    Run {
        /// Workflow JSON file
        workflow: PathBuf,
        /// Run input as a JSON object
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        /// Read the run input from a JSON file
        #[arg(long)]
        input_file: Option<PathBuf>,
    },
    /// Check a workflow and print its execution order
    Validate {
        /// Workflow JSON file
        workflow: PathBuf,
    },
    /// Start the HTTP gateway
    Serve,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Events go to stdout, logs to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowrun=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowrun", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        env_config()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { workflow } => {
            let workflow = load_workflow(&workflow)?;
            match flowrun_engine::compile(&workflow) {
                Ok(graph) => {
                    println!("valid: {} nodes", graph.node_count());
                    println!("order: {}", graph.topo_order().join(" -> "));
                    if !graph.standalone().is_empty() {
                        println!("standalone: {}", graph.standalone().join(", "));
                    }
                }
                Err(e) => {
                    eprintln!("invalid workflow [{}]: {}", e.code(), e);
                    std::process::exit(2);
                }
            }
        }
        Commands::Run {
            workflow,
            input,
            input_file,
        } => {
            let workflow = load_workflow(&workflow)?;
            let input = load_input(input.as_deref(), input_file.as_deref())?;
            let engine = build_engine(&config)?;

            let graph = match engine.compile(&workflow) {
                Ok(graph) => graph,
                Err(e) => {
                    eprintln!("invalid workflow [{}]: {}", e.code(), e);
                    std::process::exit(2);
                }
            };

            let handle = engine.start(graph, input);
            let cancel = handle.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Cancelling run...");
                    cancel.cancel();
                }
            });

            let mut events = handle.events();
            while let Some(event) = events.recv().await {
                println!("{}", serde_json::to_string(&event)?);
            }

            let outcome = handle.wait().await;
            match outcome.status {
                RunStatus::Completed => info!(run_id = %outcome.run_id, "Run completed"),
                status => {
                    let reason = outcome.error.map(|e| e.to_string()).unwrap_or_default();
                    warn!(run_id = %outcome.run_id, status = ?status, "{}", reason);
                    std::process::exit(1);
                }
            }
        }
        Commands::Serve => {
            let gateway_config = config.gateway.clone().unwrap_or_default();
            let engine = build_engine(&config)?;
            let server = flowrun_gateway::GatewayServer::new(gateway_config, engine);
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Wire the default capabilities into an engine.
fn build_engine(config: &AppConfig) -> anyhow::Result<WorkflowEngine> {
    let mut executors = NodeExecutorRegistry::new()
        .with_tools(Arc::new(ToolRegistry::with_builtins(&config.http)))
        .with_code_runner(Arc::new(ProcessRunner::new(config.code.clone())))
        .with_http(Arc::new(ReqwestHttpClient::new(&config.http)?));

    match flowrun_llm::client_from_config(config) {
        Some((client, model)) => {
            info!(provider = %model.provider, model = %model.model_id, "LLM client ready");
            executors = executors.with_llm(client, model);
        }
        None => warn!("No [model] configured; llm nodes will fail"),
    }

    let mut engine = WorkflowEngine::new(executors).with_config(config.engine.clone());
    if let (Some(dir), Some(log)) = (config.log_dir(), config.log.as_ref()) {
        info!(dir = %dir.display(), level = log.level, "Run logging enabled");
        engine = engine.with_run_log(dir, log.level);
    }
    Ok(engine)
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    Workflow::from_json(&text).with_context(|| format!("failed to parse workflow {}", path.display()))
}

fn load_input(inline: Option<&str>, file: Option<&Path>) -> anyhow::Result<HashMap<String, Value>> {
    let text = match (inline, file) {
        (Some(json), _) => json.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read input {}", path.display()))?,
        (None, None) => return Ok(HashMap::new()),
    };
    serde_json::from_str(&text).context("run input must be a JSON object")
}

/// Minimal config from the environment when no file exists.
fn env_config() -> AppConfig {
    let mut config = AppConfig::default();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        let model_id = std::env::var("FLOWRUN_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let mut model = ModelConfig::new(model_id);
        model.api_key = Some(api_key);
        config.model = Some(model);
    }
    config
}
