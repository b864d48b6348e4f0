//! CLI subcommands.

pub mod common;
pub mod config_path;
pub mod run;
pub mod status;
pub mod sync;
