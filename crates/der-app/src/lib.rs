pub mod commands;
pub mod monitor;
mod config;

pub use config::DerConfig;
