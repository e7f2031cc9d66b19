use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera_client::{run_to_completion, Client, InputCollector, ProjectorOptions};
use tessera_core::config::AppConfig;
use tessera_core::error::TesseraError;
use tessera_core::graph::Graph;
use tessera_core::state::{NeededInput, ProvidedInput, RunRecord, RunRecordStatus, RunState};
use tessera_core::types::RunId;
use tessera_engine::{init_run_state, Engine, ReplayClient, RunRequest};

#[derive(Parser)]
#[command(name = "tessera", version, about = "Run graphs of model-driven steps")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tessera.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the initial run state for a graph
    Plan {
        /// Graph definition (JSON)
        graph: PathBuf,
        /// Run prompt
        #[arg(long)]
        prompt: Option<String>,
        /// Rerun from this node, reusing --prior
        #[arg(long, requires = "prior")]
        from: Option<String>,
        /// Earlier run record or run state (JSON)
        #[arg(long)]
        prior: Option<PathBuf>,
    },
    /// Run a graph to completion
    Run {
        /// Graph definition (JSON)
        graph: PathBuf,
        /// Scripted model turns per node (JSON)
        #[arg(long)]
        replay: PathBuf,
        /// Run prompt
        #[arg(long)]
        prompt: Option<String>,
        /// Rerun from this node, reusing --prior
        #[arg(long, requires = "prior")]
        from: Option<String>,
        /// Earlier run record or run state (JSON)
        #[arg(long)]
        prior: Option<PathBuf>,
        /// Write the final run record here
        #[arg(long)]
        out: Option<PathBuf>,
        /// Print the projected event stream (SSE framing)
        #[arg(long)]
        events: bool,
    },
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
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tessera=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "tessera", &mut std::io::stdout());
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Plan {
            graph,
            prompt,
            from,
            prior,
        } => {
            let graph = load_graph(&graph)?;
            let prior = prior.as_deref().map(load_prior).transpose()?;
            let state = init_run_state(RunId::new(), &graph, prompt, from.as_deref(), prior.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Run {
            graph: graph_path,
            replay,
            prompt,
            from,
            prior,
            out,
            events,
        } => {
            let config = load_config(&cli.config)?;
            let graph = load_graph(&graph_path)?;
            let llm = Arc::new(
                ReplayClient::from_path(&replay)
                    .with_context(|| format!("loading replay script {}", replay.display()))?,
            );
            let options = ProjectorOptions::from(&config.client);
            let engine = Arc::new(Engine::local(config, llm));
            let client = Client::new(engine);

            let mut request = RunRequest::new(graph.clone());
            request.prompt = prompt;
            if let Some(from) = from {
                let prior_path = prior.context("--from requires --prior")?;
                request = request.resume_from(from, load_prior(&prior_path)?);
            }

            let handle = client.start(request)?;
            let mut record = RunRecord::started(graph_id(&graph_path), graph, &handle.state().await?);
            info!(run_id = %handle.run_id(), "Run started");

            let printer = async {
                if events {
                    let mut stream = client.events(handle.run_id());
                    while let Some(event) = stream.next().await {
                        print!("{}", event.to_sse());
                    }
                }
            };
            let (state, ()) = tokio::join!(
                run_to_completion(&handle, &PromptCollector, options.poll_interval),
                printer
            );
            let state = state?;
            record.finish(&state);

            if let Some(out) = out {
                std::fs::write(&out, serde_json::to_string_pretty(&record)?)
                    .with_context(|| format!("writing {}", out.display()))?;
                info!(path = %out.display(), "Run record written");
            }

            print_summary(&state);
            if record.status == RunRecordStatus::Failed {
                anyhow::bail!(
                    "run failed: {}",
                    state.error.as_deref().unwrap_or("a node failed")
                );
            }
        }
    }

    Ok(())
}

/// Asks for needed input on the terminal.
struct PromptCollector;

impl InputCollector for PromptCollector {
    fn collect(&self, needed: Vec<NeededInput>) -> BoxFuture<'_, tessera_core::Result<Vec<ProvidedInput>>> {
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                needed
                    .iter()
                    .map(|request| {
                        let mut input = dialoguer::Input::<String>::new()
                            .with_prompt(format!("[{}] {}", request.node_id, request.prompt));
                        if let Some(default) = &request.default {
                            input = input.default(match default {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            });
                        }
                        let answer = input.interact_text().map_err(|e| {
                            TesseraError::InvalidInput(format!("reading {}: {}", request.name, e))
                        })?;
                        Ok(ProvidedInput::answer(request, serde_json::Value::String(answer)))
                    })
                    .collect::<tessera_core::Result<Vec<ProvidedInput>>>()
            })
            .await
            .map_err(|e| TesseraError::InvalidInput(format!("input prompt failed: {}", e)))?
        })
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".tessera").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!("No config file found, using defaults");
    Ok(AppConfig::default())
}

fn load_graph(path: &Path) -> anyhow::Result<Graph> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading graph {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing graph {}", path.display()))
}

/// Accepts either a run record written by `run --out` or a bare run state.
fn load_prior(path: &Path) -> anyhow::Result<RunState> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    if value.get("statuses").is_some() {
        let record: RunRecord = serde_json::from_value(value)?;
        Ok(record.to_state())
    } else {
        Ok(serde_json::from_value(value)?)
    }
}

fn graph_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "graph".to_string())
}

fn print_summary(state: &RunState) {
    println!("\nrun {}", state.run_id);
    for (id, status) in &state.status {
        println!("  {:<24} {}", id, status);
    }
    if let Some(error) = &state.error {
        println!("error: {}", error);
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
