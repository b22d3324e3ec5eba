// crates/marblecli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use marblecore::{ConnectLine, Element, GraphDocument, SimulationEvent, StageType};
use marbleops::standard_registry;
use marbleruntime::{Simulation, SimulationModel, SimulationStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "marble")]
#[command(about = "Marble diagram simulator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph document and print its events
    Run {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Print events and the outcome as JSON lines
        #[arg(long)]
        json: bool,

        /// Stop the run after this many milliseconds
        #[arg(long)]
        max_duration_ms: Option<u64>,
    },

    /// Validate and compile a graph file without running it
    Validate {
        /// Path to graph JSON file
        file: PathBuf,
    },

    /// List available stage types
    Stages,

    /// Create an example graph document
    Init {
        /// Output file path
        #[arg(short, long, default_value = "graph.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            verbose,
            json,
            max_duration_ms,
        } => {
            let level = if verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::INFO
            };
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .init();

            run_graph(&file, json, max_duration_ms).await?;
        }

        Commands::Validate { file } => {
            validate_graph(&file)?;
        }

        Commands::Stages => {
            list_stages();
        }

        Commands::Init { output } => {
            create_example_graph(&output)?;
        }
    }

    Ok(())
}

fn load(file: &Path) -> Result<GraphDocument> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&json).with_context(|| format!("parsing {}", file.display()))
}

async fn run_graph(file: &Path, json: bool, max_duration_ms: Option<u64>) -> Result<()> {
    let mut document = load(file)?;
    if max_duration_ms.is_some() {
        document.settings.max_duration_ms = max_duration_ms;
    }

    if !json {
        println!("🚀 Graph: {}", document.name);
        println!("   Stages: {}", document.elements.len());
        println!("   Connect lines: {}", document.connect_lines.len());
        println!();
    }

    let simulation = Simulation::new(Arc::new(standard_registry()));
    let mut handle = simulation.start(&document)?;
    let cancellation = handle.cancellation_token();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(event) if json => println!("{}", serde_json::to_string(&event)?),
                Some(event) => print_event(&event),
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                cancellation.cancel();
            }
        }
    }

    let outcome = handle.wait().await?;
    if json {
        println!("{}", serde_json::to_string(&outcome)?);
    } else {
        println!();
        println!("📊 Simulation Summary:");
        println!("   Status: {:?}", outcome.status);
        println!("   Delivered: {}", outcome.delivered);
        println!("   Duration: {}ms", outcome.duration_ms);
        if outcome.open_paths > 0 {
            println!("   ⚠️  Open paths: {}", outcome.open_paths);
        }
    }

    if outcome.status == SimulationStatus::Failed {
        bail!("simulation ended with an unhandled error");
    }
    Ok(())
}

fn print_event(event: &SimulationEvent) {
    let path = event.connect_lines_id().join(" → ");
    match event {
        SimulationEvent::Value { index, value, .. } => {
            println!(
                "  #{index:<4} ● {} → {}  {value}  [{path}]",
                event.source_element_id(),
                event.target_element_id()
            );
        }
        SimulationEvent::Error { index, error, .. } => {
            println!(
                "  #{index:<4} ✖ {} → {}  {error}  [{path}]",
                event.source_element_id(),
                event.target_element_id()
            );
        }
        SimulationEvent::Fatal {
            index,
            error,
            connect_line_id,
            ..
        } => {
            println!(
                "  #{index:<4} 💥 {} → {}  {error}  (unhandled on {connect_line_id})",
                event.source_element_id(),
                event.target_element_id()
            );
        }
    }
}

fn validate_graph(file: &Path) -> Result<()> {
    println!("🔍 Validating graph: {}", file.display());

    let document = load(file)?;
    let model = SimulationModel::from_document(&document)?;
    let simulation = Simulation::new(Arc::new(standard_registry()));
    simulation.compile(&document)?;

    println!("✅ Graph is valid:");
    println!("   Name: {}", document.name);
    println!("   Root: {}", model.root());
    println!("   Branches: {}", model.branches().len());
    for (entry, branch) in model.branches() {
        let stages: Vec<&str> = branch.element_ids().map(String::as_str).collect();
        println!("     {entry}: {}", stages.join(" → "));
    }

    Ok(())
}

fn list_stages() {
    println!("📦 Available Stage Types:");
    println!();

    let registry = standard_registry();
    for (category, stage_type) in registry.list_stage_types() {
        println!("  • {} ({:?})", stage_type, category);
    }
}

fn create_example_graph(output: &Path) -> Result<()> {
    let mut document = GraphDocument::new("Example recovery graph");

    document.add_element(
        Element::new("source", StageType::Of)
            .with_property("values", vec![1, 2, 3, 4])
            .with_position(100.0, 100.0),
    );
    document.add_element(
        Element::new("check", StageType::Map)
            .with_property("expression", r#"if value == 3 { throw "three" } value * 10"#)
            .with_position(250.0, 100.0),
    );
    document.add_element(Element::new("recover", StageType::CatchError).with_position(400.0, 100.0));
    document.add_element(
        Element::new("fallback", StageType::Of)
            .with_property("values", vec![0])
            .with_position(400.0, 250.0),
    );
    document.add_element(Element::new("subscriber", StageType::Subscriber).with_position(550.0, 100.0));

    document.connect("source-check", "source", "check");
    document.connect("check-recover", "check", "recover");
    document.connect("recover-subscriber", "recover", "subscriber");
    document.add_connect_line(ConnectLine::new("recover-fallback", "recover", "fallback"));

    let json = serde_json::to_string_pretty(&document)?;
    std::fs::write(output, json)?;

    println!("✨ Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  marble run --file {}", output.display());

    Ok(())
}
