use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// How results are written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One line per diagnostic plus a summary
    #[default]
    Human,
    /// Machine-readable report
    Json,
    /// Totals only
    Summary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

/// Validate XML documents against ISO Schematron schemas
#[derive(Parser, Debug, Clone)]
#[command(name = "schematron-validate")]
#[command(about = "Validate XML documents against ISO Schematron schemas")]
#[command(version)]
pub struct Cli {
    /// Directory or file to validate
    pub path: PathBuf,

    /// Schema to apply to every instance, as a path or URL. Without it each
    /// instance names its schema in an xml-model processing instruction.
    #[arg(short = 's', long = "schema")]
    pub schema: Option<String>,

    /// Phase to run instead of the schema's default phase
    #[arg(long = "phase")]
    pub phase: Option<String>,

    /// Treat query evaluation errors as passing checks
    #[arg(long = "lenient")]
    pub lenient: bool,

    /// File extensions to process (comma-separated)
    #[arg(short = 'e', long = "extensions")]
    pub extensions: Option<String>,

    /// Number of files validated concurrently
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,

    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Only report failures
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    pub quiet: bool,

    #[arg(long = "format", value_enum)]
    pub format: Option<OutputFormat>,

    /// Configuration file (TOML or JSON)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Include file patterns (glob syntax)
    #[arg(long = "include", action = clap::ArgAction::Append)]
    pub include_patterns: Vec<String>,

    /// Exclude file patterns (glob syntax)
    #[arg(long = "exclude", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Stop after the first file that is invalid or fails
    #[arg(long = "fail-fast")]
    pub fail_fast: bool,

    /// HTTP timeout in seconds for remote schemas
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    #[arg(long = "retry-attempts")]
    pub retry_attempts: Option<u32>,

    /// Maximum number of compiled schemas kept in memory
    #[arg(long = "cache-size")]
    pub cache_size: Option<u64>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn extensions(&self) -> Option<Vec<String>> {
        self.extensions.as_ref().map(|list| split_list(list))
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.path.exists() {
            return Err(format!("Path does not exist: {}", self.path.display()));
        }
        if self.threads == Some(0) {
            return Err("Number of threads must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Split a comma-separated list, dropping empty items.
pub fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
