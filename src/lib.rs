pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod push;
pub mod redis_client;
pub mod state;
pub mod transport;
