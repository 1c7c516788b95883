//! CLI module for the Stackyard deployment tool.
//!
//! This module provides the command-line interface for diffing, deploying
//! and destroying stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
