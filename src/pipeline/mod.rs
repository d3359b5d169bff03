//! The ingestion and rollup pipeline.
//!
//! Leaves first: `aqi` and `validation` turn feed payloads into readings, `anomaly`
//! cross-checks a city's readings, `aggregate` and `health` compute the rollups, `rollup`
//! applies them to a store, and `ingest`/`backfill` drive whole passes.

pub mod aggregate;
pub mod anomaly;
pub mod aqi;
pub mod backfill;
pub mod health;
pub mod ingest;
pub mod rollup;
pub mod shard;
pub mod status;
pub mod validation;

pub use backfill::{Backfill, BackfillReport, DateOutcome};
pub use ingest::{authorize, CityOutcome, CityReport, Ingestor, QualityReport, RunReport};
pub use status::StatusReport;
