// Lifecycle Kernel - engine CLI
// Run with: cargo run --bin engine -- <command>

//! # Engine CLI
//!
//! Small operator tool around the library:
//!
//! - `check` loads the configuration and the packaged state machines
//! - `validate <file>` checks a state machine definition document
//! - `demo` runs a sample workflow against in-memory collaborators and prints
//!   the resulting audit trail
//!
//! Configuration comes from `lifecycle.toml` (or `--config`), then
//! `LIFECYCLE__*` environment variables; a `.env` file is honoured.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use lifecycle_kernel::engine::RecordingNotifier;
use lifecycle_kernel::models::{COMPOSITE_MACHINE, DEFAULT_MACHINE};
use lifecycle_kernel::{
    logging, AgentRef, DefinitionLoader, EngineConfig, ExecutionContext, History, InMemoryClusterStorage,
    InMemoryDefinitions, InMemoryDirectory, ItemId, JobDispatcher, SplitKind, JoinKind, StateMachine,
    TransactionManager, TransitionId, Workflow,
};

#[derive(Parser)]
#[command(name = "lifecycle-engine")]
#[command(about = "Lifecycle Kernel - workflow engine tooling")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, env = "LIFECYCLE_CONFIG", default_value = "lifecycle.toml")]
    config: PathBuf,

    /// Log level, overrides the configured one (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration and the packaged state machines
    Check,

    /// Validate a state machine definition document
    Validate {
        /// Path to the JSON definition
        file: PathBuf,
    },

    /// Run a sample workflow in memory
    Demo {
        /// Agent performing the transitions
        #[arg(long, default_value = "operator")]
        agent: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = EngineConfig::load_from(&cli.config, false)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    logging::init_tracing(cli.log_level.as_deref().unwrap_or(&config.log_level));

    match cli.command {
        Commands::Check => check(&config),
        Commands::Validate { file } => validate(&file),
        Commands::Demo { agent } => demo(&config, AgentRef::new(agent)).await,
    }
}

fn check(config: &EngineConfig) -> Result<()> {
    info!(
        workers = config.dispatch.workers,
        queue = config.dispatch.queue_capacity,
        policy = ?config.transaction.commit_failure_policy,
        "configuration loaded"
    );

    let definitions = InMemoryDefinitions::from_config(&config.definitions);
    for name in [DEFAULT_MACHINE, COMPOSITE_MACHINE] {
        match definitions.load_state_machine(name, 0) {
            Ok(machine) => info!(
                name,
                states = machine.states.len(),
                transitions = machine.transitions.len(),
                "state machine available"
            ),
            Err(e) => warn!(name, "state machine unavailable: {}", e),
        }
    }
    Ok(())
}

fn validate(file: &Path) -> Result<()> {
    let document = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let mut machine = StateMachine::from_json(&document)?;
    if !machine.validate() {
        anyhow::bail!("{} v{} is not coherent", machine.name, machine.version);
    }

    println!("{} v{}", machine.name, machine.version);
    for state in &machine.states {
        let outgoing: Vec<String> = state
            .possible_transitions()
            .iter()
            .filter_map(|id| machine.transition(*id))
            .map(|t| format!("{} -> {}", t.name, t.target))
            .collect();
        println!(
            "  {}{}: {}",
            state,
            if state.is_finished() { " (finished)" } else { "" },
            outgoing.join(", ")
        );
    }
    Ok(())
}

async fn demo(config: &EngineConfig, agent: AgentRef) -> Result<()> {
    let storage = Arc::new(TransactionManager::with_policy(
        Arc::new(InMemoryClusterStorage::new()),
        config.transaction.commit_failure_policy,
    ));
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_role("Operator", true);
    directory.add_agent(&agent.name, &["Operator"]);

    let notifier = Arc::new(RecordingNotifier::new());
    let dispatcher = Arc::new(JobDispatcher::start(notifier.clone(), &config.dispatch));
    let ctx = ExecutionContext::new(
        storage.clone(),
        directory,
        Arc::new(InMemoryDefinitions::from_config(&config.definitions)),
    )
    .with_dispatcher(dispatcher.clone());

    // Prepare -> (Check | Sign) -> Archive, inside one composite stage
    let mut workflow = Workflow::new(ItemId::new());
    let root = workflow.root();
    let stage = workflow.add_composite(root, "Handling", true)?;
    let prepare = workflow.add_atomic(stage, "Prepare", true)?;
    let fork = workflow.add_split(stage, "Fork", SplitKind::And, false)?;
    let check = workflow.add_atomic(stage, "Check", false)?;
    let sign = workflow.add_atomic(stage, "Sign", false)?;
    let merge = workflow.add_join(stage, "Merge", JoinKind::Join, false)?;
    let archive = workflow.add_atomic(stage, "Archive", false)?;
    workflow.add_next(prepare, fork)?;
    workflow.add_next(fork, check)?;
    workflow.add_next(fork, sign)?;
    workflow.add_next(check, merge)?;
    workflow.add_next(sign, merge)?;
    workflow.add_next(merge, archive)?;
    for id in [prepare, check, sign, archive] {
        workflow.set_property(id, "Agent Role", "Operator")?;
    }
    workflow.set_property(sign, "SchemaType", "Signature")?;
    workflow.set_property(sign, "SchemaVersion", 0)?;
    workflow
        .verify_all()
        .map_err(|e| anyhow::anyhow!("demo workflow is malformed: {}", e))?;

    let start = TransitionId(0);
    let done = TransitionId(1);
    workflow.start(&ctx, &agent).await?;
    workflow.request(&ctx, &agent, prepare, done, "").await?;
    workflow.request(&ctx, &agent, check, start, "").await?;
    workflow.request(&ctx, &agent, check, TransitionId(2), "").await?;
    workflow
        .request(&ctx, &agent, sign, done, r#"{"signedBy":"operator"}"#)
        .await?;
    workflow.request(&ctx, &agent, archive, done, "").await?;

    dispatcher.shutdown().await;
    info!(
        finished = workflow.is_finished(&ctx, stage)?,
        notifications = notifier.delivered().len(),
        "demo workflow done"
    );

    for event in History::new(storage, workflow.item_id()).events(None).await? {
        println!(
            "#{:<3} {:<28} {:<10} {} -> {}",
            event.id, event.activity_path, event.transition_name, event.origin_state, event.target_state
        );
    }
    Ok(())
}
