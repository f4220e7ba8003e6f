pub mod config;
pub mod daemon;
pub mod exec;
pub mod monitoring;
pub mod runtime;
pub mod status;
pub mod store;
