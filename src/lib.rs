#[macro_use]
extern crate tracing;

pub mod config;
mod coordinator;
mod error;
pub mod parser;
pub mod sink;
pub mod state;
pub mod trace;

// re-export
pub use coordinator::{Coordinator, FileStatus, SourceStatus};
pub use error::{Error, Result};
