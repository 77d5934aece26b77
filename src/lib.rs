pub mod config;
pub mod correlate;
pub mod datatype;
pub mod error;
pub mod interpolation;
pub mod logging;
pub mod monitor;
pub mod signal;
pub mod trace_data;
mod utils;
