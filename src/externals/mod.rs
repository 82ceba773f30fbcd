pub mod commands;
pub mod config_store;
pub mod event_logging;
pub mod polling;
pub mod serial;
pub mod telemetry;
