//! Core types, config, prompts, and errors for deerflow.

pub mod config;
pub mod error;
pub mod prompts;
pub mod types;
