pub mod config;
pub mod error;

pub use config::{AwsConfig, BatchSettings, WorkerConfig};
pub use error::*;
