//! Flowscope: TCP stream reassembly and audit-record decoding for packet
//! captures.

pub mod capture;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod reassembly;
pub mod writer;

pub use config::Config;
pub use decoder::DecoderRegistry;
pub use pipeline::{Pipeline, RunSummary};
