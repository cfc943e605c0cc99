// Public API - analysis entry points, data types and export functions
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod mtu;
pub mod probe;

pub use error::{Error, Result};
pub use mtu::{MtuReport, analyze, run_analysis};
