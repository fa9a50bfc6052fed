pub mod cli;
pub mod error;
pub mod extract;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod sources;
pub mod utils;

pub use cli::{Cli, Commands};
pub use error::AppError;
pub use models::{Config, OutputFormat};
pub use pipeline::{Pipeline, PipelineStatistics};
