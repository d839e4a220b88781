//! CLI binary for running and validating pipemark pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pipemark_llm::{EchoTools, OpenAiTools};
use pipemark_pipeline::{
    EventEmitter, ExecutionTools, Pipeline, PipelineExecutor, PipelineLibrary, ProgressEvent,
    Severity,
};
use pipemark_syntax::StepKind;
use pipemark_tools::{ConsoleDialog, DefaultValueDialog, LocalScriptTool};
use pipemark_types::Parameters;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipemark", version, about = "Markdown-defined pipelines for LLM workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline from a Markdown file
    Run {
        /// Path to the pipeline .md file
        pipeline: PathBuf,

        /// Input parameter as name=value (repeatable)
        #[arg(short, long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,

        /// Answer with echo tools and dialog defaults instead of real backends
        #[arg(long)]
        dry_run: bool,

        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a pipeline and print its diagnostics
    Validate {
        /// Path to the pipeline .md file
        pipeline: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline .md file
        pipeline: PathBuf,
    },

    /// Print the compiled pipeline document as JSON
    Compile {
        /// Path to the pipeline .md file
        pipeline: PathBuf,
    },

    /// List the pipelines found in a directory
    Library {
        /// Directory searched recursively for .md files
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let fallback = if cli.verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            pipeline,
            inputs,
            dry_run,
            json,
        } => {
            cmd_run(&pipeline, &inputs, dry_run, json).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Info { pipeline } => {
            cmd_info(&pipeline)?;
        }
        Commands::Compile { pipeline } => {
            cmd_compile(&pipeline)?;
        }
        Commands::Library { dir } => {
            cmd_library(&dir).await?;
        }
    }

    Ok(())
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))
}

fn load_pipeline(path: &Path) -> anyhow::Result<Pipeline> {
    let source = read_source(path)?;
    Ok(Pipeline::from_source(&source)?)
}

/// Split `name=value`; the value may itself contain `=`.
fn parse_input(raw: &str) -> anyhow::Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => anyhow::bail!("Invalid input `{raw}`, expected NAME=VALUE"),
    }
}

fn parse_inputs(raw: &[String]) -> anyhow::Result<Parameters> {
    raw.iter().map(|r| parse_input(r)).collect()
}

fn build_tools(dry_run: bool) -> anyhow::Result<ExecutionTools> {
    if dry_run {
        return Ok(ExecutionTools::new()
            .with_natural_language(EchoTools::new())
            .with_script_tool(LocalScriptTool::new())
            .with_user_interface(DefaultValueDialog));
    }
    let mut tools = ExecutionTools::new()
        .with_script_tool(LocalScriptTool::new())
        .with_user_interface(ConsoleDialog);
    match OpenAiTools::from_env() {
        Ok(openai) => tools = tools.with_natural_language(openai),
        // steps needing a model fail with a configuration error when reached
        Err(e) => tracing::warn!(error = %e, "Natural-language tools are not configured"),
    }
    Ok(tools)
}

async fn cmd_run(path: &Path, raw_inputs: &[String], dry_run: bool, json: bool) -> anyhow::Result<()> {
    let pipeline = Arc::new(load_pipeline(path)?);
    let inputs = parse_inputs(raw_inputs)?;
    let tools = build_tools(dry_run)?;

    if !json {
        println!("Running pipeline: {}", pipeline.title());
        if dry_run {
            println!("(dry run mode -- echo tools, dialog defaults)");
        }
    }

    let emitter = EventEmitter::default();
    let mut rx = emitter.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                ProgressEvent::StepStarted { title, .. } => {
                    tracing::info!(step = %title, "Waiting for model");
                }
                ProgressEvent::PipelineCompleted { .. } | ProgressEvent::PipelineFailed { .. } => {
                    break
                }
                _ => {}
            }
        }
    });

    let executor = PipelineExecutor::new(pipeline, tools);
    let result = executor.execute_with_progress(inputs, &emitter).await;
    drop(emitter);
    let _ = progress.await;
    let result = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("\nPipeline completed");
    for record in &result.steps {
        let via = match (&record.joker, &record.backend) {
            (Some(joker), _) => format!(" (joker {{{joker}}})"),
            (None, Some(backend)) => format!(" ({backend})"),
            (None, None) => String::new(),
        };
        println!("  {} -> {{{}}}{via}", record.step, record.resulting_parameter);
    }
    println!("\nParameters:");
    for (name, value) in &result.parameters {
        println!("{{{name}}}:\n{value}\n");
    }
    if result.usage.total_tokens() > 0 {
        println!(
            "Tokens: {} in, {} out",
            result.usage.input_tokens, result.usage.output_tokens
        );
    }

    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let source = read_source(path)?;
    let document = pipemark_syntax::compile(&source)?;
    let diagnostics = pipemark_pipeline::validate(&document);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    let document = pipeline.document();

    println!("Pipeline: {}", document.title);
    if let Some(url) = &document.source_url {
        println!("URL: {url}");
    }
    println!("Version: {}", document.format_version);
    if let Some(description) = &document.description {
        println!("\n{description}");
    }

    println!("\nParameters:");
    for parameter in &document.parameters {
        let role = if parameter.is_input { "input" } else { "intermediate" };
        match &parameter.description {
            Some(description) => println!("  {{{}}} [{role}] {description}", parameter.name),
            None => println!("  {{{}}} [{role}]", parameter.name),
        }
    }

    println!("\nSteps:");
    for step in &document.steps {
        let detail = match &step.kind {
            StepKind::NaturalLanguage { model_requirements } => {
                format!(" variant={}", model_requirements.model_variant)
            }
            StepKind::Script { script_language } => format!(" language={script_language}"),
            StepKind::Template | StepKind::Dialog => String::new(),
        };
        println!(
            "  {} [{}]{detail} -> {{{}}}",
            step.name,
            step.execution_type(),
            step.resulting_parameter_name
        );
    }

    for warning in pipeline.warnings() {
        println!("[WARN] {}: {}", warning.rule, warning.message);
    }

    Ok(())
}

fn cmd_compile(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    println!("{}", pipeline.document().to_json()?);
    Ok(())
}

async fn cmd_library(dir: &Path) -> anyhow::Result<()> {
    let mut library = PipelineLibrary::new();
    library.load_directory(dir).await?;

    if library.is_empty() {
        println!("No pipelines found in {}", dir.display());
        return Ok(());
    }
    println!("{} pipeline(s) in {}:", library.len(), dir.display());
    for name in library.names() {
        let pipeline = library.get(name)?;
        println!("  {} ({} steps)", name, pipeline.steps().len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_splits_on_first_equals() {
        assert_eq!(
            parse_input("query=a=b").unwrap(),
            ("query".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_input("empty=").unwrap().1, "");
    }

    #[test]
    fn input_without_name_is_rejected() {
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=value").is_err());
    }

    #[test]
    fn later_input_wins() {
        let inputs = parse_inputs(&["a=1".to_string(), "a=2".to_string()]).unwrap();
        assert_eq!(inputs["a"], "2");
    }

    #[test]
    fn dry_run_tools_are_deterministic() {
        let tools = build_tools(true).unwrap();
        assert_eq!(tools.natural_language.as_ref().unwrap().name(), "echo");
        assert_eq!(tools.script.len(), 1);
    }

    #[test]
    fn cli_parses_repeated_inputs() {
        let cli = Cli::parse_from([
            "pipemark", "run", "p.md", "-i", "a=1", "--input", "b=2", "--dry-run",
        ]);
        match cli.command {
            Commands::Run { inputs, dry_run, json, .. } => {
                assert_eq!(inputs, vec!["a=1", "b=2"]);
                assert!(dry_run);
                assert!(!json);
            }
            _ => panic!("Expected Run command"),
        }
    }
}
