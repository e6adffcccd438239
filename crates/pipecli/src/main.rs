// crates/pipecli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipecore::{Pipeline, SchedulerEvent, Tool, ToolId, ToolStatus, Value};
use piperuntime::{PipeRuntime, RuntimeConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipe")]
#[command(about = "Pipeline kernel scheduler CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline file on local kernels
    Run {
        /// Path to pipeline JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Name of the tool to recompute (default: every source tool)
        #[arg(short, long)]
        start: Option<String>,

        /// Number of kernels in the pool
        #[arg(short, long, default_value_t = 2)]
        kernels: usize,

        /// Global variables as a JSON object
        #[arg(short, long)]
        globals: Option<String>,

        /// Dispatch tick in milliseconds
        #[arg(long, default_value_t = 100)]
        tick_ms: u64,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a pipeline file
    Validate {
        /// Path to pipeline JSON file
        file: PathBuf,
    },

    /// Create an example diamond pipeline
    Init {
        /// Output file path
        #[arg(short, long, default_value = "pipeline.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            start,
            kernels,
            globals,
            tick_ms,
            verbose,
        } => {
            let default_level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(default_level)),
                )
                .init();

            let config = RuntimeConfig {
                kernels,
                dispatch_interval: Duration::from_millis(tick_ms.max(1)),
                status_interval: Duration::from_millis(tick_ms.max(1)),
                ..RuntimeConfig::default()
            };
            run_pipeline(file, start, globals, config).await?;
        }

        Commands::Validate { file } => {
            validate_pipeline(file)?;
        }

        Commands::Init { output } => {
            create_example_pipeline(output)?;
        }
    }

    Ok(())
}

fn load_pipeline(file: &PathBuf) -> Result<Pipeline> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let pipeline: Pipeline = serde_json::from_str(&json)
        .with_context(|| format!("parsing {}", file.display()))?;
    Ok(pipeline)
}

async fn run_pipeline(
    file: PathBuf,
    start: Option<String>,
    globals: Option<String>,
    config: RuntimeConfig,
) -> Result<()> {
    println!("🚀 Loading pipeline from: {}", file.display());

    let pipeline = load_pipeline(&file)?;
    pipeline.validate()?;

    println!("📋 Pipeline: {}", pipeline.name);
    println!("   Tools: {}", pipeline.tools.len());
    println!("   Connections: {}", pipeline.connections.len());
    println!("   Kernels: {}", config.kernels);
    println!();

    let starts: Vec<ToolId> = match start {
        Some(name) => vec![pipeline
            .tool_by_name(&name)
            .with_context(|| format!("no tool named '{}'", name))?
            .id],
        None => pipeline.sources(),
    };
    let names: HashMap<ToolId, String> = pipeline
        .tools
        .iter()
        .map(|t| (t.id, t.name.clone()))
        .collect();

    let mut runtime = PipeRuntime::new(pipeline, config);

    if let Some(globals) = globals {
        let json: serde_json::Value = serde_json::from_str(&globals)?;
        let serde_json::Value::Object(map) = json else {
            anyhow::bail!("Globals must be a JSON object");
        };
        for (name, value) in map {
            runtime.set_global(name, Value::from(value));
        }
    }

    let mut events = runtime.subscribe_events();
    let labels = names.clone();
    let event_task = tokio::spawn(async move {
        let name = |id: &ToolId| labels.get(id).cloned().unwrap_or_else(|| id.to_string());
        while let Ok(event) = events.recv().await {
            match event {
                SchedulerEvent::JobQueued { job_id, tasks, .. } => {
                    println!("▶️  Job {} queued with {} task(s)", job_id, tasks);
                }
                SchedulerEvent::JobSuperseded { job_id, .. } => {
                    println!("  ↩️  Job {} superseded", job_id);
                }
                SchedulerEvent::TaskDispatched { task, runner, .. } => {
                    println!("  ⚡ Task {} → runner {}", task, runner);
                }
                SchedulerEvent::TaskSkipped { task, .. } => {
                    println!("  ⏭️  Task {} skipped after upstream failure", task);
                }
                SchedulerEvent::ToolProgress { tool_id, fraction, .. } => {
                    println!("     📊 [{}] {:.0}%", name(&tool_id), fraction * 100.0);
                }
                SchedulerEvent::ToolOutput { tool_id, stdout, .. } => {
                    println!("  ✅ {} complete", name(&tool_id));
                    for line in stdout.lines().filter(|l| !l.contains("__pipe_progress__")) {
                        println!("     │ {}", line);
                    }
                }
                SchedulerEvent::ToolFailed { tool_id, traceback, .. } => {
                    println!("  ❌ {} failed", name(&tool_id));
                    for line in traceback.lines() {
                        println!("     │ {}", line);
                    }
                }
                SchedulerEvent::JobFinished { job_id, completed, errored, .. } => {
                    println!(
                        "✨ Job {} finished: {} task(s) complete, {} errored",
                        job_id, completed, errored
                    );
                }
                _ => {}
            }
        }
    });

    tracing::debug!(starts = starts.len(), "submitting jobs");
    for tool in starts {
        runtime.submit(tool)?;
    }
    runtime.run_until_idle().await;

    // Let the listener print what is already buffered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    let workspace = runtime.queue().workspace();
    println!();
    println!("📊 Summary:");
    let mut ordered: Vec<_> = names.iter().collect();
    ordered.sort_by(|a, b| a.1.cmp(b.1));
    for (id, name) in ordered {
        let status = workspace
            .status(*id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "untouched".to_string());
        println!("   {} [{}]", name, status);
        if workspace.status(*id) == Some(ToolStatus::Complete) {
            if let Some(outputs) = workspace.outputs(*id) {
                for (port, value) in outputs {
                    println!("     {}: {}", port, value);
                }
            }
        }
    }

    Ok(())
}

fn validate_pipeline(file: PathBuf) -> Result<()> {
    println!("🔍 Validating pipeline: {}", file.display());

    let pipeline = load_pipeline(&file)?;
    pipeline.validate()?;

    println!("✅ Pipeline is valid:");
    println!("   Name: {}", pipeline.name);
    println!("   Tools: {}", pipeline.tools.len());
    println!("   Connections: {}", pipeline.connections.len());
    println!("   Sources: {}", pipeline.sources().len());

    Ok(())
}

fn create_example_pipeline(output: PathBuf) -> Result<()> {
    let mut pipeline = Pipeline::new("Example diamond pipeline");
    pipeline.description = Some("Load a value, process two branches, merge them".to_string());

    let load = pipeline.add_tool(
        Tool::new("load")
            .with_config("value", 10.0)
            .with_code("data = config.value\nprint \"loaded \" + data")
            .with_output("data"),
    );
    let double = pipeline.add_tool(
        Tool::new("double")
            .with_input("input")
            .with_code("progress 0.5\nresult = input * 2")
            .with_output("result"),
    );
    let square = pipeline.add_tool(
        Tool::new("square")
            .with_input("input")
            .with_code("result = input * input")
            .with_output("result"),
    );
    let merge = pipeline.add_tool(
        Tool::new("merge")
            .with_input("left")
            .with_input("right")
            .with_code("total = left + right\nprint \"total \" + total")
            .with_output("total"),
    );

    pipeline.connect(load, "data", double, "input")?;
    pipeline.connect(load, "data", square, "input")?;
    pipeline.connect(double, "result", merge, "left")?;
    pipeline.connect(square, "result", merge, "right")?;

    let json = serde_json::to_string_pretty(&pipeline)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example pipeline: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  pipe run --file {}", output.display());

    Ok(())
}
