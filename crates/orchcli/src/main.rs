// crates/orchcli/src/main.rs

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use orchcore::{ExecutionEvent, Task, TaskEvent, TaskId, TaskType, WorkflowDraft, WorkflowStatus};
use orchhandlers::LlmConfig;
use orchruntime::{
    DependencyFailurePolicy, ExecutorConfig, HandlerRegistry, OrchestrationService, RuntimeConfig,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orch")]
#[command(about = "Workflow orchestration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Owner recorded on the workflow and its tasks
        #[arg(long, default_value = "cli")]
        owner: String,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,

        #[command(flatten)]
        executor: ExecutorArgs,

        #[command(flatten)]
        llm: LlmArgs,
    },

    /// Validate a workflow file and print its execution levels
    Validate {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List available task handlers
    Handlers,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct ExecutorArgs {
    /// Attempts per task, including the first
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Seconds to wait between attempts
    #[arg(long, default_value_t = 5)]
    retry_delay: u64,

    /// Maximum number of tasks running at once
    #[arg(long, default_value_t = 10)]
    max_parallel: usize,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    task_timeout: Option<u64>,

    /// Fail tasks whose dependencies failed instead of running them
    #[arg(long)]
    skip_dependents: bool,
}

impl ExecutorArgs {
    fn to_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay),
            max_parallel_tasks: self.max_parallel,
            task_timeout: self.task_timeout.map(Duration::from_secs),
            on_dependency_failure: if self.skip_dependents {
                DependencyFailurePolicy::SkipDependents
            } else {
                DependencyFailurePolicy::RunRegardless
            },
        }
    }
}

#[derive(Args)]
struct LlmArgs {
    /// Chat-completion endpoint used by ia_module tasks
    #[arg(long, env = "MODEL_URL")]
    model_url: Option<String>,

    /// Key sent in the `api-key` header
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, default_value = "gpt4o")]
    model: String,
}

impl LlmArgs {
    fn to_config(&self) -> LlmConfig {
        LlmConfig {
            model_url: self.model_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            ..LlmConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            owner,
            verbose,
            executor,
            llm,
        } => {
            init_logging(verbose);
            run_workflow(file, owner, executor.to_config(), llm.to_config()).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file)?;
        }

        Commands::Handlers => {
            list_handlers();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

async fn run_workflow(
    file: PathBuf,
    owner: String,
    executor: ExecutorConfig,
    llm: LlmConfig,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let draft = orchruntime::load_workflow_file(&file)?;
    let names: HashMap<TaskId, String> = draft.tasks.iter().map(|t| (t.id, t.name.clone())).collect();

    println!("📋 Workflow: {}", draft.name);
    println!("   Tasks: {}", draft.tasks.len());
    println!();

    let mut registry = HandlerRegistry::new();
    orchhandlers::register_all(&mut registry, llm);

    let service = OrchestrationService::with_registry(
        Arc::new(registry),
        RuntimeConfig {
            executor,
            ..RuntimeConfig::default()
        },
    );

    // Subscribe to events for real-time output
    let mut events = service.subscribe_events();
    let event_names = names.clone();
    let event_task = tokio::spawn(async move {
        let name = |id: &TaskId| event_names.get(id).cloned().unwrap_or_else(|| id.to_string());
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::WorkflowStarted { task_count, .. } => {
                    println!("▶️  Workflow started ({} tasks)", task_count);
                }
                ExecutionEvent::LevelStarted { level, task_count, .. } => {
                    println!("  ⏩ Level {} ({} tasks)", level, task_count);
                }
                ExecutionEvent::TaskStarted {
                    task_id,
                    task_type,
                    attempt,
                    ..
                } => {
                    println!("  ⚡ Starting task: {} ({}), attempt {}", name(&task_id), task_type, attempt);
                }
                ExecutionEvent::TaskCompleted { task_id, duration_ms, .. } => {
                    println!("  ✅ Task {} completed in {}ms", name(&task_id), duration_ms);
                }
                ExecutionEvent::TaskFailed { task_id, error, .. } => {
                    println!("  ❌ Task {} failed: {}", name(&task_id), error);
                }
                ExecutionEvent::TaskRetrying {
                    task_id,
                    attempt,
                    max_attempts,
                    ..
                } => {
                    println!("  🔁 Retrying {} ({}/{})", name(&task_id), attempt, max_attempts);
                }
                ExecutionEvent::TaskCancelled { task_id, .. } => {
                    println!("  🛑 Task {} cancelled", name(&task_id));
                }
                ExecutionEvent::TaskSkipped {
                    task_id,
                    failed_dependency,
                    ..
                } => {
                    println!("  ⏭️  Task {} skipped, {} failed", name(&task_id), name(&failed_dependency));
                }
                ExecutionEvent::TaskEvent { task_id, event, .. } => match event {
                    TaskEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", name(&task_id), message);
                    }
                    TaskEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", name(&task_id), message);
                    }
                    TaskEvent::Progress { percent, message } => {
                        if let Some(msg) = message {
                            println!("     📊 [{}] {:.0}% - {}", name(&task_id), percent, msg);
                        } else {
                            println!("     📊 [{}] {:.0}%", name(&task_id), percent);
                        }
                    }
                },
                ExecutionEvent::WorkflowFinished { status, duration_ms, .. } => {
                    if status == WorkflowStatus::Completed {
                        println!("✨ Workflow completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Workflow failed after {}ms", duration_ms);
                    }
                }
            }
        }
    });

    let workflow_id = service.create_workflow(draft, owner).await?;
    let results = service.execute_workflow(workflow_id).await?;

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    let workflow = service.get_workflow(workflow_id).await?;
    let counts = workflow.status_counts();

    println!();
    println!("📊 Execution Summary:");
    println!("   Workflow ID: {}", workflow_id);
    println!("   Completed: {}/{} tasks", counts.completed, workflow.tasks.len());

    if !results.is_empty() {
        println!();
        println!("📤 Results:");
        for task in &workflow.tasks {
            let Some(result) = results.get(&task.id) else {
                continue;
            };
            match (&result.output, &result.error) {
                (Some(output), _) => {
                    println!("   {}: {} (attempts: {})", task.name, output.to_text(), result.attempts)
                }
                (None, Some(error)) => {
                    println!("   {}: error: {} (attempts: {})", task.name, error, result.attempts)
                }
                (None, None) => println!("   {}: no output", task.name),
            }
        }
    }

    if workflow.status != WorkflowStatus::Completed {
        anyhow::bail!(
            "workflow failed: {}",
            workflow.error_message.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    Ok(())
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let draft = orchruntime::load_workflow_file(&file)?;
    let levels = orchruntime::execution_levels(&draft.tasks)?;
    let names: HashMap<TaskId, &str> = draft.tasks.iter().map(|t| (t.id, t.name.as_str())).collect();

    println!("✅ Workflow is valid:");
    println!("   Name: {}", draft.name);
    println!("   Tasks: {}", draft.tasks.len());
    println!("   Levels: {}", levels.len());
    for (index, level) in levels.iter().enumerate() {
        let members: Vec<&str> = level
            .iter()
            .map(|id| names.get(id).copied().unwrap_or("?"))
            .collect();
        println!("     {}: {}", index, members.join(", "));
    }

    Ok(())
}

fn list_handlers() {
    println!("📦 Available Task Handlers:");
    println!();

    let mut registry = HandlerRegistry::new();
    orchhandlers::register_all(&mut registry, LlmConfig::default());

    for task_type in registry.list_task_types() {
        println!("  • {}", task_type);
        if let Some(description) = registry.description(task_type) {
            println!("    {}", description);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut draft = WorkflowDraft::new("Example ESG Workflow")
        .with_description("Builds a question, runs a two-step analysis and announces the result");

    let question = draft.add_task(
        Task::new("Build Question", TaskType::DataProcessing)
            .with_parameter("operation", "template")
            .with_parameter("template", "What is the ESG impact on {{company}}?")
            .with_parameter("values", serde_json::json!({"company": "Brazilian companies"})),
    );

    let steps = serde_json::json!([
        {"system_prompt": "You are a market analyst. Answer in detail.", "step_name": "market_analysis", "step_order": 1},
        {"system_prompt": "You are an ESG specialist. Review the previous answer and add ESG insights.", "step_name": "esg_review", "step_order": 2}
    ]);
    let analysis = draft.add_task(
        Task::new("Analyse", TaskType::IaModule)
            .with_parameter("message", "What is the ESG impact on Brazilian companies?")
            .with_parameter("flow_name", "ESG analysis")
            .with_parameter("steps", steps)
            .depends_on(question),
    );

    draft.add_task(
        Task::new("Announce", TaskType::Notification)
            .with_parameter("message", "ESG analysis finished")
            .depends_on(analysis),
    );

    orchruntime::save_workflow_file(&output, &draft)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  MODEL_URL=https://example.invalid/chat API_KEY=... orch run --file {}",
        output.display()
    );

    Ok(())
}
