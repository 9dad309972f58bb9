pub mod config;
pub mod context;
pub mod error;
pub mod ids;

pub use config::GreenConfig;
pub use context::{Counter, RunContext};
pub use error::*;
pub use ids::*;
