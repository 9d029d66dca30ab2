mod model_fetch;
mod model_service;
mod ort_service;
mod routes;
mod server;
mod state;
mod telemetry;
mod uploads;
mod views;

pub mod app;
pub mod config;

pub use app::start_app;
