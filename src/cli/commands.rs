use super::{BackfillArgs, Commands, DailyArgs, IngestArgs, SnapshotsArgs};
use crate::api::WaqiClient;
use crate::config::{CityConfig, Environment, Settings};
use crate::db::{Database, MemoryStore, Store};
use crate::error::{AppError, Result};
use crate::models::{
    CityFreshness, CitySnapshot, DailyAggregate, Freshness, IngestionRun,
    NationalDailyAggregate, RunStatus, StoreStats, Trigger,
};
use crate::pipeline::rollup::refresh_national;
use crate::pipeline::status::{self, since_days, since_hours};
use crate::pipeline::{authorize, Backfill, CityOutcome, DateOutcome, Ingestor, RunReport};
use chrono::{DateTime, NaiveDate, Utc};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Number of runs listed by `status`.
const STATUS_RUN_LIMIT: i64 = 10;

/// CLI application
pub struct App {
    env: Environment,
    settings: Settings,
    /// Connected on first use so that dry runs never need Postgres.
    db: OnceCell<Database>,
}

impl App {
    /// Reads the environment and loads the network settings.
    ///
    /// `config` takes precedence over `NETWORK_CONFIG`; with neither, the embedded network
    /// is used.
    pub fn new(config: Option<&Path>) -> Result<Self> {
        let env = Environment::from_env();
        let path = config
            .map(Path::to_path_buf)
            .or_else(|| env.network_config.as_ref().map(PathBuf::from));
        let settings = Settings::load(path.as_deref())?;

        Ok(Self {
            env,
            settings,
            db: OnceCell::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn db(&self) -> Result<&Database> {
        self.db
            .get_or_try_init(|| Database::new(&self.env.database_url))
            .await
    }

    /// Executes one command.
    pub async fn run_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::InitDb => {
                self.db().await?.init_schema().await?;
                println!("{}", "Database schema is ready.".green());
            },
            Commands::Ingest(args) => self.ingest(args).await?,
            Commands::Backfill(args) => self.backfill(args).await?,
            Commands::National { date } => {
                self.national(date.unwrap_or_else(|| Utc::now().date_naive()))
                    .await?
            },
            Commands::Status => self.status().await?,
            Commands::Snapshots(args) => self.snapshots(args).await?,
            Commands::Daily(args) => self.daily(args).await?,
            Commands::NationalHistory { days } => self.national_history(days).await?,
        }

        Ok(())
    }

    /// Runs one ingestion pass and prints its report.
    ///
    /// # Errors
    ///
    /// Fails before any fetch when a manual credential is rejected or `WAQI_TOKEN` is
    /// missing, and after the pass when no selected city completed.
    async fn ingest(&self, args: IngestArgs) -> Result<()> {
        let trigger = if args.manual {
            Trigger::Manual
        } else {
            Trigger::Scheduled
        };
        authorize(
            trigger,
            self.env.ingest_token.as_deref(),
            args.token.as_deref(),
        )?;

        let report = if args.dry_run {
            info!("Dry run: writing to an in-memory store");
            self.execute_ingest(trigger, &MemoryStore::new()).await?
        } else {
            let db = self.db().await?;
            self.execute_ingest(trigger, db).await?
        };

        print_run_report(&report);

        if report.status == RunStatus::Failed && !report.cities.is_empty() {
            return Err(AppError::Cli(format!(
                "ingestion failed for every selected city: {}",
                report.error_summary().unwrap_or_default()
            )));
        }
        Ok(())
    }

    async fn execute_ingest<S: Store>(&self, trigger: Trigger, store: &S) -> Result<RunReport> {
        let token = self
            .env
            .waqi_token
            .clone()
            .ok_or_else(|| AppError::Config("WAQI_TOKEN is not set".into()))?;
        let client = WaqiClient::new(token, &self.env.waqi_base_url, &self.settings.fetch)?;

        Ok(Ingestor::new(&self.settings, &client, store)
            .run(trigger, Utc::now())
            .await)
    }

    /// Recomputes rollups over a date range with a progress bar per date.
    async fn backfill(&self, args: BackfillArgs) -> Result<()> {
        let db = self.db().await?;
        let days = ((args.to - args.from).num_days() + 1).max(0) as u64;

        let pb = ProgressBar::new(days);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )?
            .progress_chars("=>-"),
        );

        let report = Backfill::new(&self.settings, db)
            .run(args.from, args.to, args.city.as_deref(), |date, outcome| {
                pb.set_message(format!("{} {}", date, date_outcome_label(outcome)));
                pb.inc(1);
            })
            .await;
        pb.finish_and_clear();
        let report = report?;

        println!(
            "Backfill {} to {}: {} processed, {} skipped, {} errored",
            args.from,
            args.to,
            report.processed.to_string().green(),
            report.skipped.to_string().yellow(),
            report.errored.to_string().red()
        );
        println!(
            "City days: {} written, {} without data, {} errored",
            report.city_days_written, report.city_days_skipped, report.city_days_errored
        );
        Ok(())
    }

    async fn national(&self, date: NaiveDate) -> Result<()> {
        let db = self.db().await?;
        match refresh_national(db, &self.settings, date).await? {
            Some(national) => println!("{}", national_table(&[national])),
            None => println!(
                "{}",
                format!("No city has a daily aggregate for {}; nothing written.", date).yellow()
            ),
        }
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let db = self.db().await?;
        if !db.is_schema_initialized().await? {
            println!(
                "{}",
                "Database schema is not initialized. Run `init-db` first.".yellow()
            );
            return Ok(());
        }

        let report = status::collect(db, &self.settings, Utc::now(), STATUS_RUN_LIMIT).await?;
        println!("{}", stats_table(&report.stats));
        println!("{}", freshness_table(&report.cities));
        if report.runs.is_empty() {
            println!("No ingestion runs recorded yet.");
        } else {
            println!("{}", runs_table(&report.runs));
        }
        Ok(())
    }

    async fn snapshots(&self, args: SnapshotsArgs) -> Result<()> {
        let city = known_city(&self.settings, &args.city)?;
        let hours = positive(args.hours, "hours")?;
        let rows = self
            .db()
            .await?
            .snapshots_since(&city.id, since_hours(Utc::now(), hours))
            .await?;

        println!("Hourly snapshots for {} (last {} hours)", city.name, hours);
        if rows.is_empty() {
            println!("{}", "No snapshots in this window.".yellow());
        } else {
            println!("{}", snapshots_table(&rows));
        }
        Ok(())
    }

    async fn daily(&self, args: DailyArgs) -> Result<()> {
        let city = known_city(&self.settings, &args.city)?;
        let days = positive(args.days, "days")?;
        let rows = self
            .db()
            .await?
            .daily_since(&city.id, since_days(Utc::now(), days))
            .await?;

        println!("Daily aggregates for {} (last {} days)", city.name, days);
        if rows.is_empty() {
            println!("{}", "No daily aggregates in this window.".yellow());
        } else {
            println!("{}", daily_table(&rows));
        }
        Ok(())
    }

    async fn national_history(&self, days: i64) -> Result<()> {
        let days = positive(days, "days")?;
        let rows = self
            .db()
            .await?
            .national_since(since_days(Utc::now(), days))
            .await?;

        println!("National aggregates (last {} days)", days);
        if rows.is_empty() {
            println!("{}", "No national aggregates in this window.".yellow());
        } else {
            println!("{}", national_table(&rows));
        }
        Ok(())
    }
}

fn known_city<'s>(settings: &'s Settings, id: &str) -> Result<&'s CityConfig> {
    settings.city(id).ok_or_else(|| {
        let known: Vec<&str> = settings.cities.iter().map(|c| c.id.as_str()).collect();
        AppError::Cli(format!(
            "Unknown city '{}'. Must be one of: {}",
            id,
            known.join(", ")
        ))
    })
}

fn positive(value: i64, what: &str) -> Result<i64> {
    if value > 0 {
        Ok(value)
    } else {
        Err(AppError::Cli(format!("{} must be positive, got {}", what, value)))
    }
}

// --- Rendering ---

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.1}", v))
}

fn fmt_hour(hour: DateTime<Utc>) -> String {
    hour.format("%Y-%m-%d %H:00").to_string()
}

fn run_status_label(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Success => status.as_str().green(),
        RunStatus::Partial => status.as_str().yellow(),
        RunStatus::Failed => status.as_str().red(),
        RunStatus::Running => status.as_str().cyan(),
    }
}

fn run_status_color(status: &str) -> Color {
    match status {
        "success" => Color::Green,
        "partial" => Color::Yellow,
        "failed" => Color::Red,
        _ => Color::Cyan,
    }
}

fn date_outcome_label(outcome: &DateOutcome) -> String {
    match outcome {
        DateOutcome::Processed(n) => format!(
            "{} cities, weighted PM2.5 {:.1}",
            n.cities_reporting, n.weighted_avg_pm25
        ),
        DateOutcome::Skipped => "no data".to_string(),
        DateOutcome::Errored(e) => format!("error: {}", e),
    }
}

fn print_run_report(report: &RunReport) {
    println!(
        "Run {} ({}) for hour {}: {}",
        report
            .run_id
            .map_or_else(|| "-".to_string(), |id| id.to_string()),
        report.trigger.as_str(),
        fmt_hour(report.hour),
        run_status_label(report.status)
    );
    println!(
        "{} of {} cities completed, {} readings written",
        report.cities_processed,
        report.cities.len(),
        report.records_processed
    );
    if report.cities.is_empty() {
        warn!("No cities selected for this run");
        return;
    }
    println!("{}", run_report_table(report));

    for (city_id, outcome) in &report.cities {
        if let Some(city) = outcome.report() {
            for anomaly in &city.quality.anomalies {
                println!("{} {}: {}", "anomaly".yellow(), city_id, anomaly);
            }
        }
    }
}

fn run_report_table(report: &RunReport) -> Table {
    let mut table = new_table(vec![
        "City", "Outcome", "Valid", "Fetch failed", "Rejected", "Warnings", "Errors",
        "Anomalies", "Written", "Avg PM2.5", "Quality",
    ]);
    for (city_id, outcome) in &report.cities {
        let color = match outcome {
            CityOutcome::Completed(_) => Color::Green,
            CityOutcome::NoData(_) => Color::Yellow,
            CityOutcome::Failed(_) => Color::Red,
        };
        let mut row = vec![
            Cell::new(city_id),
            Cell::new(outcome.label()).fg(color),
        ];
        match outcome {
            CityOutcome::Failed(e) => {
                row.push(Cell::new(e));
            },
            CityOutcome::Completed(city) | CityOutcome::NoData(city) => {
                let q = &city.quality;
                row.extend([
                    Cell::new(format!("{}/{}", q.valid_stations, q.total_stations)),
                    Cell::new(q.fetch_failures),
                    Cell::new(q.rejected),
                    Cell::new(q.warnings),
                    Cell::new(q.errors),
                    Cell::new(q.anomalies.len()),
                    Cell::new(format!("{} ({} failed)", city.readings_written, city.write_failures)),
                    Cell::new(fmt_opt(city.snapshot.as_ref().map(|s| s.avg_pm25))),
                    Cell::new(city.snapshot.as_ref().map_or("-", |s| s.quality.as_str())),
                ]);
            },
        }
        table.add_row(row);
    }
    table
}

fn stats_table(stats: &StoreStats) -> Table {
    let mut table = new_table(vec!["Table", "Rows"]);
    table
        .add_row(vec![Cell::new("stations"), Cell::new(stats.stations)])
        .add_row(vec![Cell::new("readings"), Cell::new(stats.readings)])
        .add_row(vec![Cell::new("city snapshots"), Cell::new(stats.snapshots)])
        .add_row(vec![Cell::new("daily aggregates"), Cell::new(stats.daily_aggregates)])
        .add_row(vec![
            Cell::new("national aggregates"),
            Cell::new(stats.national_aggregates),
        ])
        .add_row(vec![Cell::new("ingestion runs"), Cell::new(stats.runs)]);
    table
}

fn freshness_table(cities: &[CityFreshness]) -> Table {
    let mut table = new_table(vec!["City", "Name", "Last snapshot", "Freshness"]);
    for city in cities {
        let color = match city.freshness {
            Freshness::Fresh => Color::Green,
            Freshness::Stale => Color::Yellow,
            Freshness::Offline => Color::Red,
        };
        table.add_row(vec![
            Cell::new(&city.city_id),
            Cell::new(&city.city_name),
            Cell::new(city.last_hour.map_or_else(|| "never".to_string(), fmt_hour)),
            Cell::new(city.freshness.as_str()).fg(color),
        ]);
    }
    table
}

fn runs_table(runs: &[IngestionRun]) -> Table {
    let mut table = new_table(vec![
        "Run", "Started", "Completed", "Trigger", "Cities", "Records", "Status", "Error",
    ]);
    for run in runs {
        table.add_row(vec![
            Cell::new(run.id),
            Cell::new(run.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(run.completed_at.map_or_else(
                || "-".to_string(),
                |t| t.format("%Y-%m-%d %H:%M:%S").to_string(),
            )),
            Cell::new(&run.trigger),
            Cell::new(run.cities_processed),
            Cell::new(run.records_processed),
            Cell::new(&run.status).fg(run_status_color(&run.status)),
            Cell::new(run.error.as_deref().unwrap_or("")),
        ]);
    }
    table
}

fn snapshots_table(rows: &[CitySnapshot]) -> Table {
    let mut table = new_table(vec![
        "Hour", "Avg PM2.5", "Min", "Max", "Median", "PM10", "O3", "NO2", "Stations",
        "Dominant", "Quality",
    ]);
    for s in rows {
        table.add_row(vec![
            Cell::new(fmt_hour(s.hour)),
            Cell::new(format!("{:.1}", s.avg_pm25)),
            Cell::new(format!("{:.1}", s.min_pm25)),
            Cell::new(format!("{:.1}", s.max_pm25)),
            Cell::new(format!("{:.1}", s.median_pm25)),
            Cell::new(fmt_opt(s.avg_pm10)),
            Cell::new(fmt_opt(s.avg_o3)),
            Cell::new(fmt_opt(s.avg_no2)),
            Cell::new(format!("{}/{}", s.valid_stations, s.total_stations)),
            Cell::new(s.dominant_pollutant.as_deref().unwrap_or("-")),
            Cell::new(&s.quality),
        ]);
    }
    table
}

fn daily_table(rows: &[DailyAggregate]) -> Table {
    let mut table = new_table(vec![
        "Date", "Avg PM2.5", "Min", "Max", "Peak", "Hours", "Cigarettes", "Years lost",
        "WHO x",
    ]);
    for d in rows {
        table.add_row(vec![
            Cell::new(d.date),
            Cell::new(format!("{:.1}", d.avg_pm25)),
            Cell::new(format!("{:.1}", d.min_pm25)),
            Cell::new(format!("{:.1}", d.max_pm25)),
            Cell::new(format!("{:.1} @ {:02}:00", d.peak_pm25, d.peak_hour)),
            Cell::new(d.hours_with_data),
            Cell::new(format!("{:.2}", d.cigarette_equivalent)),
            Cell::new(format!("{:.3}", d.years_lost_per_year)),
            Cell::new(format!("{:.1}", d.who_violation_factor)),
        ]);
    }
    table
}

fn national_table(rows: &[NationalDailyAggregate]) -> Table {
    let mut table = new_table(vec![
        "Date", "Avg PM2.5", "Weighted", "Min", "Max", "Best", "Worst", "Cities",
        "Population", "Cigarettes", "WHO x",
    ]);
    for n in rows {
        table.add_row(vec![
            Cell::new(n.date),
            Cell::new(format!("{:.1}", n.avg_pm25)),
            Cell::new(format!("{:.1}", n.weighted_avg_pm25)),
            Cell::new(format!("{:.1}", n.min_pm25)),
            Cell::new(format!("{:.1}", n.max_pm25)),
            Cell::new(&n.best_city_id).fg(Color::Green),
            Cell::new(&n.worst_city_id).fg(Color::Red),
            Cell::new(n.cities_reporting),
            Cell::new(n.population_covered),
            Cell::new(format!("{:.2}", n.cigarette_equivalent)),
            Cell::new(format!("{:.1}", n.who_violation_factor)),
        ]);
    }
    table
}
