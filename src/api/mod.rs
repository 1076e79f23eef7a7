pub mod handler;
pub mod ingest;
pub mod models;

pub use ingest::ResultIngestor;
