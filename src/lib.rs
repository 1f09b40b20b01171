pub mod backend;
pub mod config;
pub mod history;
pub mod humanize;
pub mod observability;
pub mod orchestrator;
pub mod retry;
pub mod run_state;
pub mod transfer;
