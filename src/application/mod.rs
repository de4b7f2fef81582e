pub mod config;
pub mod switchboard;
