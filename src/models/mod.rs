pub mod audit_event;
pub mod command;
pub mod connection_state;
pub mod raw_line;
pub mod sensor_key;
pub mod user_config;
