use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "file-kind")]
#[command(about = "Classify files by name and content, with a persistent detection cache")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// JSON engine configuration.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    Classify {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,

        /// Descend into directories instead of listing their direct children.
        #[arg(short = 'r', long)]
        recursive: bool,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    Stats,
    /// Marks every cached detection stale.
    Invalidate,
    Clear,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

pub const SUBCOMMANDS: [&str; 5] = ["classify", "stats", "invalidate", "clear", "help"];

/// Inserts `classify` when the first positional argument is not a known
/// subcommand, so `file-kind foo.rs` works.
pub fn rewrite_args_for_implicit_classify(mut args: Vec<String>) -> Vec<String> {
    if args.len() <= 1 {
        return args;
    }

    let mut idx = 1usize;
    while idx < args.len() {
        let a = args[idx].as_str();
        if a == "--" {
            idx += 1;
            break;
        }

        if a == "--db" || a == "--config" {
            idx += 2;
            continue;
        }

        if a.starts_with('-') {
            idx += 1;
            continue;
        }

        break;
    }

    if idx < args.len() {
        let token = args[idx].as_str();
        if !SUBCOMMANDS.contains(&token) {
            args.insert(idx, "classify".to_string());
        }
    }

    args
}
