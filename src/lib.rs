pub mod browser;
pub mod core;
pub mod driver;
pub mod export;
pub mod intake;
pub mod registry;
pub mod relay;
pub mod service;

// --- Primary exports ---
pub use crate::core::config::{load_config, ColloquyConfig, PageProfile};
pub use crate::core::types;
pub use crate::core::types::*;
pub use crate::core::AppState;
pub use crate::driver::{BatchDriver, Timings};
pub use crate::relay::{Command, Event, Relay, Reply};
pub use crate::service::BatchService;
