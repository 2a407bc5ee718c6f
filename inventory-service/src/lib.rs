pub mod api;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod schema;
pub mod store;
pub mod validation;
