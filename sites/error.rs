// ========================================================================================
//                                    Error handling
// ========================================================================================

use crate::types::chrom_order_display;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Every failure the site pipeline can report. Variants carry the file, line and
/// values needed to print a precise diagnostic at the command-line boundary.
#[derive(Error, Debug)]
pub enum SiteError {
    #[error("I/O error for file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "Invalid header in '{}'.\n  Expected the first columns to be: chrom\tpos\tref\talt\n  Found: {found:?}",
        .path.display()
    )]
    Header { path: PathBuf, found: String },

    #[error(
        "Failed to parse line {line_number} of '{}'.\n  Line content: {line_content:?}\n  Reason: {details}",
        .path.display()
    )]
    Parse {
        path: PathBuf,
        line_number: u64,
        line_content: String,
        details: String,
    },

    #[error(
        "Line {line_number} of '{}' has the chromosome {chrom:?}, which is not handled.\n  Supported chromosomes are: {}",
        .path.display(),
        chrom_order_display()
    )]
    UnknownChromosome {
        path: PathBuf,
        line_number: u64,
        chrom: String,
    },

    #[error(
        "The chromosomes in '{}' appear to be in the wrong order.\n  The required order is: {}\n  But on line {line_number}, the chromosome {chrom:?} came after the chromosome {previous:?}.",
        .path.display(),
        chrom_order_display()
    )]
    ChromosomeOrder {
        path: PathBuf,
        line_number: u64,
        chrom: String,
        previous: String,
    },

    #[error(
        "The positions in '{}' appear to be in the wrong order.\n  On line {line_number}, the position {pos} came after the position {previous} on chromosome {chrom:?}.",
        .path.display()
    )]
    PositionOrder {
        path: PathBuf,
        line_number: u64,
        chrom: String,
        pos: u32,
        previous: u32,
    },

    #[error("File '{}' is empty; expected at least a header line.", .path.display())]
    EmptyFile { path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration file '{}': {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("No input files were found to merge.")]
    NoInputs,

    #[error("A merge worker failed: {0}")]
    Worker(String),

    #[error("{} of the merge tasks failed:\n{}", .failures.len(), .failures.join("\n"))]
    WorkersFailed { failures: Vec<String> },

    #[error("{} of {total} source file(s) failed to extract: {}", .failed.len(), .failed.join(", "))]
    ExtractionFailed { failed: Vec<String>, total: usize },
}

impl SiteError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SiteError::Io {
            path: path.into(),
            source,
        }
    }

    /// Data-integrity and schema faults. These abort the whole pipeline rather than
    /// being treated as a single failed task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SiteError::Header { .. }
                | SiteError::Parse { .. }
                | SiteError::UnknownChromosome { .. }
                | SiteError::ChromosomeOrder { .. }
                | SiteError::PositionOrder { .. }
                | SiteError::EmptyFile { .. }
        )
    }
}
