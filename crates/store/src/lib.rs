pub mod db;
pub mod index;
pub mod log;
pub mod query;
pub mod schema;
pub mod summaries;

pub use db::Store;
pub use index::TraceIndex;
pub use log::SpanLog;
pub use query::QueryService;
pub use summaries::SummaryStore;
