use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ecu_synth_ingestion::{PipelineConfig, PipelineServices, RunRegistry, RunTarget};
use ecu_synth_schemas::{InferenceType, SystemConfig, SYSTEM_CONFIGS};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ecu-synth")]
#[command(about = "Extract ECU documents into a component store and synthesize configuration artifacts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a run for an ECU and execute it
    Run {
        #[arg(long)]
        ecu: String,
        #[arg(long)]
        family: Option<String>,
        /// Execution code, for example TPM2
        #[arg(long)]
        execution: String,
        #[arg(long = "type", value_enum, default_value = "io")]
        inference_type: RunType,
        /// Server CAN address when no base configuration names one
        #[arg(long)]
        server: Option<String>,
    },
    /// List the runs of an ECU
    Runs {
        #[arg(long)]
        ecu: String,
    },
    /// Print the ECU system table
    Systems,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RunType {
    Io,
    Fp,
}

impl From<RunType> for InferenceType {
    fn from(value: RunType) -> Self {
        match value {
            RunType::Io => InferenceType::IoMapping,
            RunType::Fp => InferenceType::FunctionParameter,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Command::Systems = cli.command {
        println!("{:<8} {:<8} SERVER", "SYSTEM", "FAMILY");
        for system in SYSTEM_CONFIGS {
            println!(
                "{:<8} {:<8} {}",
                system.execution,
                system.family,
                system.server_can.unwrap_or("-")
            );
        }
        return Ok(());
    }

    let config = PipelineConfig::from_env();
    info!("ECU synthesis pipeline v{}", env!("CARGO_PKG_VERSION"));
    info!("Store: {}", config.store_path.display());

    let services = Arc::new(PipelineServices::start(config)?);
    let registry = RunRegistry::new(services.clone());

    match cli.command {
        Command::Run {
            ecu,
            family,
            execution,
            inference_type,
            server,
        } => {
            let family = match family {
                Some(family) => family,
                None => SystemConfig::by_execution(&execution)
                    .map(|system| system.family.to_string())
                    .with_context(|| format!("Unknown ECU system {}, pass --family", execution))?,
            };

            let run = registry.create_run(&ecu, inference_type.into()).await?;
            println!("Run {} (version {}) for {}", run.id, run.version, ecu);

            let finished = registry
                .execute_run(
                    &run.id,
                    RunTarget {
                        family,
                        execution,
                        server_can: server,
                    },
                )
                .await?;
            for message in &finished.messages {
                println!("  {}", message);
            }
            println!("Status: {}", finished.status.as_str());
        }
        Command::Runs { ecu } => {
            for run in registry.runs_for_ecu(&ecu).await? {
                println!(
                    "{}  v{}  {}  {}  {}",
                    run.id,
                    run.version,
                    run.inference_type.as_str(),
                    run.status.as_str(),
                    run.updated_at
                );
            }
        }
        Command::Systems => {}
    }

    drop(registry);
    if let Ok(services) = Arc::try_unwrap(services) {
        services.shutdown();
    }
    Ok(())
}
