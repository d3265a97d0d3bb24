use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gantry_core::{Context, EngineConfig};
use gantry_engine::{Engine, RunStatus};
use gantry_graph::{validate, Severity, Workflow};

#[derive(Parser)]
#[command(name = "gantry", version, about = "Node-graph workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "gantry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow and print its result
    Run {
        /// Path to the workflow JSON file
        file: PathBuf,
        /// Extra seed variables as KEY=VALUE (values parsed as JSON
        /// when possible, kept as strings otherwise)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Statically validate a workflow without executing it
    Validate {
        /// Path to the workflow JSON file
        file: PathBuf,
    },
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    match cli.command {
        Commands::Run { file, set } => {
            let workflow = Workflow::load(&file)?;
            let mut engine = Engine::new(workflow, config);
            engine.seed(&parse_overrides(&set)?);

            let result = engine.execute().await;

            println!("status: {}", result.status);
            if let Some(error) = &result.error {
                println!("error: {}", error);
            }
            println!(
                "context: {}",
                serde_json::to_string_pretty(result.context.data())?
            );

            if result.status == RunStatus::Error {
                std::process::exit(1);
            }
        }
        Commands::Validate { file } => {
            let workflow = Workflow::load(&file)?;
            let findings = validate(&workflow);

            if findings.is_empty() {
                println!("{}: no findings", file.display());
                return Ok(());
            }

            let mut has_errors = false;
            for finding in &findings {
                let severity = match finding.severity {
                    Severity::Error => {
                        has_errors = true;
                        "error"
                    }
                    Severity::Warning => "warning",
                };
                match &finding.node_id {
                    Some(id) => println!("{severity}: [{id}] {}", finding.message),
                    None => println!("{severity}: {}", finding.message),
                }
            }
            if has_errors {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn parse_overrides(pairs: &[String]) -> anyhow::Result<Context> {
    let mut ctx = Context::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got '{}'", pair))?;
        let parsed = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        ctx.set(key, parsed);
    }
    Ok(ctx)
}
