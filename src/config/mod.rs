//! Configuration module

pub mod settings;

pub use settings::{EngineSettings, FormerConfig, JoinerConfig};
