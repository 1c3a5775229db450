//! TRADEGATE: Adaptive binary-options trading agent
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod broker;
pub mod config;
pub mod data;
pub mod engine;
pub mod notify;
pub mod predictor;
pub mod status;
pub mod storage;
pub mod strategy;
pub mod types;
