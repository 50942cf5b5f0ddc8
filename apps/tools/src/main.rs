use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{domain::UserId, stats::HistoryStats};
use storage::Storage;
use tracing::info;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/trainer.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Users with at least one stored session.
    Users,
    List {
        user_id: String,
    },
    Stats {
        user_id: String,
    },
    /// Writes the full history, artifacts included, as pretty JSON.
    Export {
        user_id: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Users => {
            for user_id in storage.list_user_ids().await? {
                let count = storage.count_session_records(&user_id).await?;
                println!("{user_id}\t{count}");
            }
        }
        Command::List { user_id } => {
            let records = storage.list_session_records(&UserId::new(user_id)).await?;
            for record in &records {
                println!(
                    "{}\t{}\t{}\t{}s\t{}",
                    record.timestamp.to_rfc3339(),
                    record.coordinate,
                    record.score,
                    record.duration_seconds,
                    record.feedback
                );
            }
        }
        Command::Stats { user_id } => {
            let records = storage.list_session_records(&UserId::new(user_id)).await?;
            let stats = HistoryStats::from_records(&records);
            println!("sessions\t{}", stats.total_sessions);
            println!("average\t{}", stats.average_score);
            println!("best\t{}", stats.best_score);
            println!("practice\t{}", stats.formatted_total_time());
        }
        Command::Export { user_id, output } => {
            let user_id = UserId::new(user_id);
            let records = storage.list_session_records(&user_id).await?;
            let json = serde_json::to_string_pretty(&records)?;
            match output {
                Some(path) => {
                    fs::write(&path, json)
                        .with_context(|| format!("failed to write '{}'", path.display()))?;
                    info!(%user_id, records = records.len(), path = %path.display(), "history exported");
                }
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}
