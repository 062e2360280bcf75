//! Vigil Core Library
//!
//! Configuration, external-interface adapters, the per-camera detection
//! pipeline and the orchestrator that runs every camera in one process.

pub mod camera;
pub mod colored_logger;
pub mod config;
pub mod load;
pub mod orchestrator;
pub mod provider;
pub mod sinks;
pub mod status;
