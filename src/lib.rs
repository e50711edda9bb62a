// Public API - the runner plus the pipeline components it is assembled from
pub mod runner;

pub mod coordination;
pub mod db;
pub mod entity;
pub mod error;
pub mod formats;
pub mod io;
pub mod telemetry;

// Internal modules
mod config;
