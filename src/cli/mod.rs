//! Command-line interface for docsift.

mod commands;
mod progress;

pub use commands::{is_verbose, run};
