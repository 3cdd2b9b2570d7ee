pub mod api;
pub mod config;
pub mod relay;
pub mod types;

pub use config::*;
pub use types::*;
