//! Engine configuration
//!
//! - Generic YAML config loading/saving
//! - [`EngineConfig`]: stream layout, history reservoir, worker pool and
//!   the output bus effect presets
//!
//! # Usage
//!
//! ```ignore
//! use aural_core::config::{load_config, save_config, EngineConfig};
//!
//! let config: EngineConfig = load_config(&config_path);
//! save_config(&config, &config_path)?;
//! ```

mod engine;
mod io;

pub use engine::EngineConfig;
pub use io::{load_config, save_config};
