//! Real-time delivery core: websocket connection registries, chat message
//! routing, notification dispatch and the follow/join/invite request
//! lifecycle.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;
pub mod store;
pub mod websocket;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use state::AppState;
