//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, ListCommand, ResolveCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Verify that downstream projects still pass against a candidate core library
#[derive(Debug, Parser, Clone)]
#[command(name = "downstream")]
#[command(version)]
#[command(about = "Downstream compatibility verification for a core library", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the pipeline manifest
    #[arg(
        short,
        long,
        global = true,
        env = "DOWNSTREAM_MANIFEST",
        default_value = "downstream.yml"
    )]
    pub config: PathBuf,

    /// Working checkout of the core library (overrides the manifest)
    #[arg(long, global = true, env = "DOWNSTREAM_CHECKOUT")]
    pub checkout: Option<PathBuf>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Resolve an event and run the selected pipelines
    Run(RunCommand),

    /// Show which pipelines an event selects
    Resolve(ResolveCommand),

    /// Validate the manifest
    Validate(ValidateCommand),

    /// List the manifest's pipelines
    List(ListCommand),

    /// Show recorded runs
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
