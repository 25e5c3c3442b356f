//! CLI argument definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tosalower")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Don't load configuration file
    #[arg(long, global = true)]
    pub no_config: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Lower an exported program (JSON) to a TOSA program (JSON)
    Compile {
        /// Exported program file, or `-` for stdin
        #[arg(value_name = "PROGRAM")]
        program: String,

        /// Target specification, e.g. TOSA-1.0+INT
        #[arg(short, long)]
        spec: Option<String>,

        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Validate the graph after every pass
        #[arg(long)]
        validate_each_pass: bool,

        /// Log the graph after this pass (can be specified multiple times)
        #[arg(long, value_name = "PASS")]
        dump_after: Vec<String>,

        /// Quiet mode (only the program is printed)
        #[arg(short, long)]
        quiet: bool,
    },

    /// List the passes of the pipeline selected for a target
    Pipeline {
        /// Target specification
        spec: String,

        /// Show the annotation pipeline instead of the backend pipeline
        #[arg(long)]
        annotation: bool,
    },

    /// List the operators that have a visitor for a target
    Visitors {
        /// Target specification
        spec: String,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
    /// Initialize default configuration file
    Init,
}
