mod api;
mod cli;
mod config;
mod db;
mod error;
mod logging;
mod models;
mod pipeline;

use anyhow::Context;
use clap::Parser;
use cli::{App, BackfillArgs, Cli, Commands, DailyArgs, IngestArgs, SnapshotsArgs};
use colored::*;
use dialoguer::{theme::ColorfulTheme, Confirm, Password, Select};
use error::Result;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = logging::init();

    let cli = Cli::parse();
    let app = App::new(cli.config.as_deref()).context("failed to initialize application")?;
    info!(
        "aq-rollup ready with {} cities",
        app.settings().cities.len()
    );

    match cli.command {
        Some(command) => app.run_command(command).await.context("command failed")?,
        None => interactive(&app).await.context("interactive session failed")?,
    }

    Ok(())
}

/// Builds the command for a menu entry, prompting for its arguments.
fn prompt_command(app: &App, selection: usize) -> Result<Commands> {
    let command = match selection {
        0 => Commands::InitDb,
        1 => Commands::Ingest(IngestArgs {
            manual: true,
            token: Some(
                Password::with_theme(&ColorfulTheme::default())
                    .with_prompt("Ingest token (empty if none)")
                    .allow_empty_password(true)
                    .interact()?,
            )
            .filter(|t| !t.is_empty()),
            dry_run: Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("Dry run (in-memory store only)?")
                .default(false)
                .interact()?,
        }),
        2 => Commands::Backfill(BackfillArgs {
            from: cli::prompt_date("From date (YYYY-MM-DD)")?,
            to: cli::prompt_date("To date (YYYY-MM-DD)")?,
            city: None,
        }),
        3 => Commands::National {
            date: Some(cli::prompt_date("Date (YYYY-MM-DD)")?),
        },
        4 => Commands::Status,
        5 => Commands::Snapshots(SnapshotsArgs {
            city: cli::prompt_city(app.settings())?,
            hours: cli::prompt_count("Hours to look back", 24)?,
        }),
        6 => Commands::Daily(DailyArgs {
            city: cli::prompt_city(app.settings())?,
            days: cli::prompt_count("Days to show", 7)?,
        }),
        _ => Commands::NationalHistory {
            days: cli::prompt_count("Days to show", 7)?,
        },
    };
    Ok(command)
}

async fn interactive(app: &App) -> Result<()> {
    println!("{}", "Welcome to the air quality rollup CLI!".cyan().bold());

    let options = &[
        "Initialize database schema",
        "Run ingestion now (all cities)",
        "Backfill a date range",
        "Compute national rollup for a date",
        "Show status",
        "Show hourly snapshots for a city",
        "Show daily aggregates for a city",
        "Show national history",
        "Exit",
    ];
    let exit = options.len() - 1;

    loop {
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("What would you like to do?")
            .items(options)
            .default(0)
            .interact_opt()?
            .unwrap_or(exit);

        if selection == exit {
            println!("{}", "Goodbye!".green());
            break;
        }
        println!("\n---\n");

        let command = match prompt_command(app, selection) {
            Ok(command) => command,
            Err(e) => {
                println!("{} {}", "Failed to get input:".red(), e);
                continue;
            },
        };

        if let Err(e) = app.run_command(command).await {
            error!("Command execution failed: {:?}", e);
            println!(
                "{} {}",
                "Error executing command:".red(),
                e.to_string().red()
            );
        }

        println!("\n---\n");
    }

    Ok(())
}
