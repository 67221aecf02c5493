pub mod cache;
pub mod chainsource;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod models;
pub mod queries;
pub mod report;
pub mod scheduler;
pub mod telemetry;
pub mod types;
pub mod web;
