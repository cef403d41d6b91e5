//! AlephTX Orchestrator - Core Library
//! Distributes strategy workers across processes and remote nodes

// Public modules
pub mod catalog;
pub mod components;
pub mod core;
pub mod dispatcher;
pub mod engine;
pub mod gateway;
pub mod ipc;
pub mod slots;
pub mod strategies;

// Re-exports
pub use catalog::Catalog;
pub use core::{EngineConfig, Error, Result};
pub use engine::{Engine, EngineState, EngineStatus};
