pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod export;
pub mod filter_store;
pub mod markers;
pub mod polygon;
pub mod session;
pub mod viewport;
