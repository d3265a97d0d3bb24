pub mod config;
pub mod context;
pub mod error;

pub use config::EngineConfig;
pub use context::Context;
pub use error::{GantryError, Result};
