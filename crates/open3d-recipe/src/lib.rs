pub mod config;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod options;
pub mod patcher;
pub mod phases;
pub mod planner;
pub mod publisher;
pub mod recipe;
pub mod resolver;
pub mod workspace;

pub use error::{Error, Result};
