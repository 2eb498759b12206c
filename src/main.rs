use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trellis_agent::{
    Agent, AgentInput, GenerateOptions, LlmRouter, MetricScore, RunOptions, Workflow,
};
use trellis_core::config::AppConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::traits::{LlmClient, MemoryStore};
use trellis_core::types::SessionId;
use trellis_flows::{
    activity_planning_builder, planning_agent, research_network, research_workflow,
    researcher_agent, summarize_agent, synthesizer_agent, WeatherClient,
};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Typed workflows, agents and routing networks")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    /// Conversation thread for memory (a fresh one per invocation if omitted)
    #[arg(short, long, global = true)]
    thread: Option<String>,

    /// Print workflow and routing events as they happen
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan activities for a city based on its weather forecast
    Plan {
        #[arg(long)]
        city: String,
    },
    /// Research a city and write a report
    Research {
        #[arg(long)]
        city: String,
    },
    /// Let the research network pick an agent or workflow for a task
    Route {
        /// The task, in plain words
        #[arg(required = true)]
        task: Vec<String>,
    },
    /// Summarize text and print evaluation scores
    Summarize {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Print the stored messages of a thread
    History,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Everything a command needs, built once from config.
struct Runtime {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    memory: Arc<dyn MemoryStore>,
    events: Arc<EventBus>,
    thread: SessionId,
    cancel: CancellationToken,
}

impl Runtime {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            thread_id: Some(self.thread.clone()),
            cancel: Some(self.cancel.clone()),
        }
    }

    /// Race `fut` against Ctrl-C.
    async fn cancellable<T>(
        &self,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TrellisError::Cancelled),
            result = fut => result,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Completions need neither config nor logging
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "trellis", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load(&cli.config)?;

    // RUST_LOG wins over the configured filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let llm = trellis_llm::create_client(&config.model, &config.fallback_models);
    let memory = trellis_memory::open_store(&config.memory)?;
    let events = Arc::new(EventBus::default());
    if cli.verbose {
        spawn_event_printer(&events);
    }

    let thread = cli
        .thread
        .as_deref()
        .map(SessionId::from_str)
        .unwrap_or_default();
    info!(thread_id = %thread, "Using thread");

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling...");
        cancel_clone.cancel();
    });

    let rt = Runtime {
        config,
        llm,
        memory,
        events,
        thread,
        cancel,
    };

    let result = match cli.command {
        Commands::Plan { city } => plan(&rt, city).await,
        Commands::Research { city } => research(&rt, city).await,
        Commands::Route { task } => route(&rt, task.join(" ")).await,
        Commands::Summarize { text } => summarize(&rt, text.join(" ")).await,
        Commands::History => history(&rt).await,
        Commands::Config | Commands::Completions { .. } => Ok(()),
    };

    match result {
        Err(TrellisError::Cancelled) => {
            eprintln!("Cancelled");
            std::process::exit(130);
        }
        other => Ok(other?),
    }
}

fn spawn_event_printer(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                WorkflowEvent::RunStarted { workflow_id, run_id } => {
                    eprintln!("[run {}] started {}", run_id, workflow_id)
                }
                WorkflowEvent::StepStarted { run_id, step_id } => {
                    eprintln!("[run {}] step {} ...", run_id, step_id)
                }
                WorkflowEvent::StepCompleted {
                    run_id,
                    step_id,
                    elapsed_ms,
                } => eprintln!("[run {}] step {} done in {}ms", run_id, step_id, elapsed_ms),
                WorkflowEvent::BranchEvaluated {
                    run_id,
                    stage,
                    matched,
                } => eprintln!("[run {}] branch at stage {} matched {:?}", run_id, stage, matched),
                WorkflowEvent::RunCompleted {
                    workflow_id,
                    run_id,
                    elapsed_ms,
                } => eprintln!("[run {}] {} completed in {}ms", run_id, workflow_id, elapsed_ms),
                WorkflowEvent::RunFailed {
                    workflow_id,
                    run_id,
                    error,
                } => eprintln!("[run {}] {} failed: {}", run_id, workflow_id, error),
                WorkflowEvent::RouteSelected { network_id, target } => {
                    eprintln!("[{}] routed to {}", network_id, target)
                }
            }
        }
    });
}

/// Research agents stay memoryless: their prompts are pipeline internals, and
/// the network records the user's exchange on the thread.
fn research_setup(rt: &Runtime) -> (Arc<dyn Agent>, Arc<dyn Agent>) {
    let researcher = researcher_agent(rt.llm.clone(), rt.config.model.clone());
    let synthesizer = synthesizer_agent(
        rt.llm.clone(),
        rt.config.model.clone(),
        rt.config.model.clone(),
    );
    (Arc::new(researcher), Arc::new(synthesizer))
}

fn research_flow(
    rt: &Runtime,
    researcher: Arc<dyn Agent>,
    synthesizer: Arc<dyn Agent>,
) -> Result<Workflow> {
    research_workflow(researcher, synthesizer)
        .with_memory(rt.memory.clone())
        .with_events(rt.events.clone())
        .commit()
}

async fn plan(rt: &Runtime, city: String) -> Result<()> {
    let source = Arc::new(WeatherClient::new(&rt.config.weather)?);
    let planner = planning_agent(rt.llm.clone(), rt.config.model.clone())
        .with_memory(rt.memory.clone())
        .with_history_limit(rt.config.memory.history_limit);
    let workflow = activity_planning_builder(source, Arc::new(planner))
        .with_memory(rt.memory.clone())
        .with_events(rt.events.clone())
        .commit()?;

    let result = workflow
        .execute(serde_json::json!({ "city": city }), rt.run_options())
        .await?;
    let steps: Vec<_> = result.steps.iter().map(|s| s.step_id.as_str()).collect();
    info!(run_id = %result.run_id, steps = ?steps, elapsed_ms = result.total_elapsed_ms, "Plan ready");

    match result.output.get("activities").and_then(|v| v.as_str()) {
        Some(activities) => println!("{}", activities),
        None => println!("{}", serde_json::to_string_pretty(&result.output)?),
    }
    Ok(())
}

async fn research(rt: &Runtime, city: String) -> Result<()> {
    let (researcher, synthesizer) = research_setup(rt);
    let workflow = research_flow(rt, researcher, synthesizer)?;
    let output = workflow
        .run_with(serde_json::json!({ "city": city }), rt.run_options())
        .await?;
    match output.get("text").and_then(|v| v.as_str()) {
        Some(text) => println!("{}", text),
        None => println!("{}", serde_json::to_string_pretty(&output)?),
    }
    Ok(())
}

async fn route(rt: &Runtime, task: String) -> Result<()> {
    let (researcher, synthesizer) = research_setup(rt);
    let workflow = Arc::new(research_flow(rt, researcher.clone(), synthesizer.clone())?);
    let router = LlmRouter::new(rt.llm.clone(), rt.config.routing_model().clone());
    let network = research_network(
        Arc::new(router),
        researcher,
        synthesizer,
        workflow,
        Some(rt.memory.clone()),
    )
    .with_history_limit(rt.config.memory.history_limit)
    .with_events(rt.events.clone());

    let answer = network.route_in_thread(&rt.thread, &task, &rt.cancel).await?;
    println!("{}", answer);
    Ok(())
}

async fn summarize(rt: &Runtime, text: String) -> Result<()> {
    let agent = summarize_agent(
        rt.llm.clone(),
        rt.config.model.clone(),
        rt.config.model.clone(),
        Some(rt.memory.clone()),
    )
    .with_history_limit(rt.config.memory.history_limit);

    let options = GenerateOptions::default().in_thread(rt.thread.clone());
    let generation = rt
        .cancellable(agent.generate(AgentInput::Text(text), options))
        .await?;

    println!("{}", generation.text);
    if !generation.scores.is_empty() {
        println!();
        for score in &generation.scores {
            println!("{}", score_line(score));
        }
    }
    Ok(())
}

fn score_line(score: &MetricScore) -> String {
    format!(
        "{:<14} {:.2}  {}",
        score.metric,
        score.score,
        score.reason.as_deref().unwrap_or("")
    )
    .trim_end()
    .to_string()
}

async fn history(rt: &Runtime) -> Result<()> {
    let messages = rt
        .memory
        .load_history(&rt.thread, rt.config.memory.history_limit)
        .await?;
    if messages.is_empty() {
        println!("No messages in thread {}", rt.thread);
        return Ok(());
    }
    for msg in messages {
        let when = msg
            .timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("[{}] {}: {}", when, msg.role.as_str(), msg.text());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_line_with_and_without_reason() {
        let with_reason = MetricScore {
            metric: "relevance".into(),
            score: 0.654,
            reason: Some("one statement off topic".into()),
        };
        assert_eq!(
            score_line(&with_reason),
            "relevance      0.65  one statement off topic"
        );

        let bare = MetricScore {
            metric: "tone".into(),
            score: 1.0,
            reason: None,
        };
        assert_eq!(score_line(&bare), "tone           1.00");
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["trellis", "summarize", "some", "text", "--thread", "t1", "-v"])
            .unwrap();
        assert_eq!(cli.thread.as_deref(), Some("t1"));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Summarize { text } if text == vec!["some", "text"]));
    }
}
