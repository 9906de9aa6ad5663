pub mod buckets;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod query;
pub mod record;
pub mod store;

#[cfg(test)]
mod test_db;
