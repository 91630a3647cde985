pub mod api;
pub mod config;
pub mod inference;
pub mod prompts;
