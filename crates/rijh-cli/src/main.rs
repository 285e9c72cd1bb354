use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rijh-cli")]
#[command(about = "Recent IT jobs harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one harvest and print the summary
    Harvest,
    /// Run one harvest wrapped in the timer-event handler envelope
    Handle,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Harvest => {
            let summary = rijh_pipeline::run_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Handle => {
            let response = rijh_pipeline::handle_timer_event(serde_json::Value::Null).await;
            println!("{}", response.body);
            if response.status_code != 200 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
