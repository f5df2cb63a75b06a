pub mod api;
pub mod app;
pub mod auth;
pub mod channels;
pub mod config;
pub mod error;
pub mod identity;
pub mod membership;
pub mod orchestrator;
pub mod queue;
pub mod realtime;
pub mod store;
pub mod types;
