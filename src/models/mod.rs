//! Defines the data structures and models used throughout the application.
//!
//! `waqi` holds the upstream feed shapes; `records` holds the rows the pipeline
//! persists and the projections read back for status and history views.

mod records;
mod waqi;

pub use records::*;
pub use waqi::*;
