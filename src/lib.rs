/////////////////////////////////////////////////////////////////////////////////////
//
// SARI model
//
// Simulates the spread of a respiratory infection through a closed population
// with two engine variants sharing one per-day snapshot shape:
//   - an agent-based engine (world module) tracking every individual
//   - a compartmental SEIRS engine (compartmental module) tracking aggregates
//
////////////////////////////////////////////////////////////////////////////////////

use thiserror::Error;

pub mod compartmental;
pub mod data_management;
pub mod stats;
pub mod virus;
pub mod world;

/// Errors surfaced at configuration and I/O boundaries.
///
/// Numeric clamping and empty-contact-pool conditions are recovered locally
/// inside the engines and never reach this type.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("parameter file: {0}")]
    ParameterFile(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv output: {0}")]
    Csv(#[from] csv::Error),

    #[error("run record output: {0}")]
    Json(#[from] serde_json::Error),
}
