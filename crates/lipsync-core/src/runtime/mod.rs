pub mod config;
pub mod gate;
pub mod orchestrator;
pub mod pipeline;
pub mod stage;
pub mod types;
