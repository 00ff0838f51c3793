//! Command-line front end for surveycoach.
//!
//! `main.rs` is the composition root; handlers here wire the llama-server
//! engine, session manager, streaming bridge and answer evaluator together.
#![deny(unused_crate_dependencies)]

pub mod commands;
pub mod handlers;
pub mod logging;
pub mod parser;

pub use commands::Commands;
pub use parser::Cli;
