use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = cli::Cli::parse();

    // Dispatch to appropriate command handler
    match args.get_command() {
        cli::Commands::Start => {
            // Tracing is installed by the command once the pipeline exists
            commands::start::execute(&args.config).await?;
        }
        cli::Commands::Config { action } => {
            http_telemetry::init_tracing("warn");
            match action {
                cli::ConfigCommands::Show => commands::config::show(&args.config)?,
                cli::ConfigCommands::Validate => commands::config::validate(&args.config)?,
            }
        }
        cli::Commands::Version => {
            println!("HTTP Telemetry v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
