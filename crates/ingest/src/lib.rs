pub mod ingestor;
pub mod otlp;
pub mod pipeline;
pub mod server;

pub use ingestor::Ingestor;
pub use pipeline::{Pipeline, PipelineConfig};
