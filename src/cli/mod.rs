//! Handles Command Line Interface (CLI) related functionalities.
//!
//! Includes the clap command definitions, the `App` that executes them, and the prompts
//! used by the interactive menu when no subcommand is given.

mod commands;

pub use commands::*;
use crate::config::Settings;
use crate::error::{AppError, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, FuzzySelect, Input};
use std::path::PathBuf;

/// Hourly air quality ingestion with city, daily and national rollups
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Network settings file (defaults to NETWORK_CONFIG, then the embedded network)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Runs the interactive menu when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Create tables and indexes (idempotent)
    InitDb,

    /// Run one ingestion pass for the current hour
    Ingest(IngestArgs),

    /// Recompute daily and national rollups for a date range from stored snapshots
    Backfill(BackfillArgs),

    /// Compute the national rollup for one date
    National {
        /// Date as YYYY-MM-DD (default: today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Show row counts, per-city freshness and recent runs
    Status,

    /// Show a city's hourly snapshots
    Snapshots(SnapshotsArgs),

    /// Show a city's daily aggregates
    Daily(DailyArgs),

    /// Show national daily aggregates
    NationalHistory {
        /// Number of days to show, today included
        #[arg(short, long, default_value = "7")]
        days: i64,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct IngestArgs {
    /// Process every city instead of this hour's shard
    #[arg(long)]
    pub manual: bool,

    /// Credential for manual runs when INGEST_TOKEN is configured
    #[arg(long, requires = "manual")]
    pub token: Option<String>,

    /// Write to an in-memory store and print the report; Postgres is not touched
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct BackfillArgs {
    /// First date (YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub from: NaiveDate,

    /// Last date (YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub to: NaiveDate,

    /// Limit city-day recomputation to one city id
    #[arg(long)]
    pub city: Option<String>,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct SnapshotsArgs {
    /// City id
    #[arg(short, long)]
    pub city: String,

    /// Number of hours to look back
    #[arg(long, default_value = "24")]
    pub hours: i64,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct DailyArgs {
    /// City id
    #[arg(short, long)]
    pub city: String,

    /// Number of days to show, today included
    #[arg(short, long, default_value = "7")]
    pub days: i64,
}

/// Asks the user to pick one of the configured cities.
pub fn prompt_city(settings: &Settings) -> Result<String> {
    let labels: Vec<String> = settings
        .cities
        .iter()
        .map(|c| format!("{} ({})", c.name, c.id))
        .collect();
    let selection = FuzzySelect::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a city")
        .items(&labels)
        .default(0)
        .interact()?;
    settings
        .cities
        .get(selection)
        .map(|c| c.id.clone())
        .ok_or_else(|| AppError::Cli("no city selected".into()))
}

/// Asks for a positive count, e.g. a number of days or hours.
pub fn prompt_count(prompt: &str, default: i64) -> Result<i64> {
    let value: i64 = Input::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(default)
        .validate_with(|v: &i64| {
            if *v > 0 {
                Ok(())
            } else {
                Err("must be a positive number")
            }
        })
        .interact_text()?;
    Ok(value)
}

/// Asks for a `YYYY-MM-DD` date, defaulting to today (UTC).
pub fn prompt_date(prompt: &str) -> Result<NaiveDate> {
    let raw: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(Utc::now().date_naive().to_string())
        .validate_with(|v: &String| {
            parse_date(v).map(|_| ()).map_err(|e| e.to_string())
        })
        .interact_text()?;
    parse_date(&raw)
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    raw.trim()
        .parse::<NaiveDate>()
        .map_err(|e| AppError::Cli(format!("invalid date '{}': {}", raw.trim(), e)))
}
