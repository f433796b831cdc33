//! Operator surface for the rollout controller. Exit code 0 on success,
//! non-zero on argument validation or store failure.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use capstan_config::Config;
use capstan_core::rollout::RolloutController;
use capstan_core::store::{self, PostgresRolloutStore, ensure_schema, ports::RolloutStore};
use capstan_model::{DEFAULT_FEATURE, RolloutConfig};

#[derive(Parser)]
#[command(name = "capstanctl", about = "Capstan rollout operator surface", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read a feature's rollout configuration
    Query {
        /// Feature name
        feature: Option<String>,
    },
    /// Set the rollout percentage and print the resulting configuration
    Update {
        /// New percentage in [0, 100]
        percentage: i64,
        /// Feature name
        feature: Option<String>,
        /// Reason recorded in the audit history
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Engage the emergency stop
    Stop {
        /// Feature name
        feature: Option<String>,
        /// Reason recorded in the audit history
        #[arg(long, default_value = "manual emergency stop")]
        reason: String,
    },
    /// Lift the emergency stop and print the resulting configuration
    Resume {
        /// Feature name
        feature: Option<String>,
        /// Reason recorded in the audit history
        #[arg(long, default_value = "manual resume")]
        reason: String,
    },
    /// Show the most recent audit entries
    History {
        /// Feature name
        feature: Option<String>,
        /// Entries to show
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    let pool = store::connect(&config.store.database_url)
        .await
        .context("store connection failed")?;
    ensure_schema(&pool).await?;
    let controller = RolloutController::new(
        Arc::new(PostgresRolloutStore::new(pool)) as Arc<dyn RolloutStore>
    );

    match cli.command {
        Command::Query { feature } => {
            let config = controller.query(&feature_or_default(feature)).await?;
            print_config(&config);
        }
        Command::Update {
            percentage,
            feature,
            reason,
        } => {
            let feature = feature_or_default(feature);
            controller.update(&feature, percentage, &reason).await?;
            let config = controller.query(&feature).await?;
            print_config(&config);
        }
        Command::Stop { feature, reason } => {
            let config = controller
                .stop(&feature_or_default(feature), &reason)
                .await?;
            println!("emergency stop engaged for {}", config.feature);
        }
        Command::Resume { feature, reason } => {
            let feature = feature_or_default(feature);
            controller.resume(&feature, &reason).await?;
            let config = controller.query(&feature).await?;
            print_config(&config);
        }
        Command::History { feature, limit } => {
            let feature = feature_or_default(feature);
            let entries = controller.history(&feature, limit).await?;
            if entries.is_empty() {
                println!("no history for {feature}");
            }
            for entry in entries {
                println!(
                    "{}  {:<8}  {:>3}% -> {:>3}%  [{}] {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.action.as_str(),
                    entry.previous_percentage,
                    entry.new_percentage,
                    entry.triggered_by,
                    entry.reason,
                );
            }
        }
    }

    Ok(())
}

fn feature_or_default(feature: Option<String>) -> String {
    feature.unwrap_or_else(|| DEFAULT_FEATURE.to_string())
}

fn print_config(config: &RolloutConfig) {
    println!("feature:         {}", config.feature);
    println!(
        "percentage:      {}% (effective {}%)",
        config.percentage,
        config.effective_percentage()
    );
    println!("strategy:        {}", config.strategy);
    println!("emergency stop:  {}", config.emergency_stop);
    println!("active:          {}", config.is_active);
    println!("updated at:      {}", config.updated_at.format("%Y-%m-%d %H:%M:%S"));
}
