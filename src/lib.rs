pub mod analysis;
pub mod cli;
pub mod config;
pub mod escalate;
pub mod matcher;
pub mod metrics;
pub mod model;
pub mod server;
pub mod storage;
pub mod utils;

pub use config::Opts;
