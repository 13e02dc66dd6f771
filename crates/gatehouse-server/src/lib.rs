//! Gatehouse HTTP server: configuration, tracing, router assembly and pages.

pub mod config;
pub mod observability;
pub mod server;
pub mod views;

pub use config::AppConfig;
pub use server::{AppState, GatehouseServer, build_app, build_router};
