// src/lib.rs

pub mod cli;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod plugin_discovery;
pub mod ports;
pub mod process;
pub mod repository;
pub mod sanitize;
pub mod session_manager;
pub mod ssh_manager;
pub mod state_store;
pub mod tunnel_engine;
pub mod vault;
