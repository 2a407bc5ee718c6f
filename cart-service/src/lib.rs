pub mod api;
pub mod cart;
pub mod config;
pub mod error;
pub mod inventory_client;
pub mod models;
pub mod outbox;
pub mod publisher;
pub mod schema;
pub mod store;
