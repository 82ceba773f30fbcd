pub mod config;
pub mod externals;
pub mod models;
pub mod system;
