use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fdwh_generator::{ExtractGenerator, GeneratorConfig, MockIncidentSource};
use fdwh_storage::StoreSettings;
use fdwh_sync::PipelineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fdwh-cli")]
#[command(about = "Fire department incident warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load the latest extract through raw, staging and gold.
    Run {
        /// Use an in-memory warehouse instead of Postgres.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Append synthetic incidents to the latest extract.
    Generate {
        #[arg(long)]
        rows: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run the pipeline on the configured cron expressions until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        dry_run: false,
        json: false,
    });

    match command {
        Commands::Run { dry_run, json } => {
            let summary = fdwh_sync::run_pipeline_from_env(dry_run).await?;
            if json {
                println!("{}", summary.to_json().context("serializing run summary")?);
            } else {
                println!(
                    "run complete: run_id={} status={:?} extract={} failed_units={}",
                    summary.run_id,
                    summary.status,
                    summary.extract_key.as_deref().unwrap_or("-"),
                    summary.failed_units()
                );
            }
        }
        Commands::Generate { rows, seed } => {
            let settings = StoreSettings::from_env();
            let mut config = GeneratorConfig::from_env(settings.bucket.clone());
            if let Some(rows) = rows {
                config.num_new_rows = rows;
            }
            let store = settings.connect().await;
            let summary = ExtractGenerator::new(config, MockIncidentSource::new(seed))
                .run_once(store.as_ref())
                .await
                .context("generating extract")?;
            println!(
                "generated {}: total_rows={} new_rows={}",
                summary.new_key, summary.total_rows, summary.new_rows
            );
        }
        Commands::Schedule => {
            let config = PipelineConfig::from_env();
            let mut sched = fdwh_sync::build_scheduler(&config).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
