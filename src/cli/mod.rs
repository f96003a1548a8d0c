//! Command-line interface for legacy-forge.
//!
//! Provides commands for running a modernization job and for inspecting how
//! a source file would be fed to the model.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, ContextArgs, RunArgs};
