pub mod config;
pub mod enrichment;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod storage;
pub mod test_utils;
pub mod transport;
pub mod types;
pub mod validation;
