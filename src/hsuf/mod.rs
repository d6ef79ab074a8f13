//! schema.org `Product` as produced by listing analysis.

pub mod ingest;
pub mod models;

pub use models::Product;
