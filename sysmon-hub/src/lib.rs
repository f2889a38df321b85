//! Library side of the hub. The binary in `main.rs` wires these pieces
//! together; exporters and dashboards can also use them directly, e.g. to
//! read [`analyzer::AnomalyAnalyzer::history`].

pub mod analyzer;
pub mod broadcast;
pub mod config;
pub mod gpu;
pub mod health;
pub mod http;
pub mod ingest;
pub mod models;
pub mod state;
