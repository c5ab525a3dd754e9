//! Command-line interface for the itc binary

pub mod args;

pub use args::{Args, Backend, OutputFormat};
