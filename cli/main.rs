// ========================================================================================
//
//                        The command-line orchestrator: sitemerge
//
// ========================================================================================
//
// Parses arguments, layers them over the data directory's configuration file and
// drives the three stages: extracting leaf files from association sources, merging
// the leaves into one sorted site catalog, and annotating that catalog with genes.
// Every failure surfaces here as a `SiteError`, is printed once, and ends the
// process with status 1.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use env_logger::Env;
use log::debug;
use sitemerge::config::SiteConfig;
use sitemerge::coordinator::MergeCoordinator;
use sitemerge::error::SiteError;
use sitemerge::extract::{discover_sources, extract_all};
use sitemerge::genes::annotate::annotate_catalog;
use sitemerge::shared::files::list_files_naturally;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Args, Clone, Debug)]
struct CommonArgs {
    /// Directory holding cpra/, tmp/, sites/ and an optional sitemerge.toml
    #[arg(long, value_name = "DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Number of worker threads (default: derived from the CPU count)
    #[arg(long, value_name = "N")]
    num_procs: Option<usize>,

    /// Maximum number of files merged by one task
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Smallest pool that still starts a merge while other merges are running
    #[arg(long, value_name = "N")]
    min_batch: Option<usize>,

    /// Rebuild outputs even when they are newer than their inputs
    #[arg(long)]
    force: bool,
}

#[derive(Parser)]
#[command(
    name = "sitemerge",
    about = "Build a sorted, gene-annotated catalog of variant sites",
    long_about = "Merges many per-source variant lists, each sorted by chromosome and position, \
                  into one genome-wide catalog of sites and annotates every site with its \
                  overlapping or nearest gene."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reduce association files to chrom/pos/ref/alt leaf files under cpra/
    Extract {
        /// Source files, or directories whose files are all sources
        #[arg(value_name = "SOURCES", required = true)]
        sources: Vec<PathBuf>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Merge leaf files into sites/sites-unannotated.tsv
    Merge {
        /// Leaf files to merge (default: every file in cpra/)
        #[arg(value_name = "LEAVES")]
        leaves: Vec<PathBuf>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Annotate the merged catalog with nearest genes into sites/sites.tsv
    Annotate {
        /// Gene interval file: chrom, start, end, gene name (no header)
        #[arg(long, value_name = "BED")]
        genes: Option<PathBuf>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Extract, merge and annotate in one go
    Run {
        /// Source files, or directories whose files are all sources
        #[arg(value_name = "SOURCES", required = true)]
        sources: Vec<PathBuf>,

        /// Gene interval file: chrom, start, end, gene name (no header)
        #[arg(long, value_name = "BED")]
        genes: Option<PathBuf>,

        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Extract { sources, common }) => {
            load_config(&common).and_then(|config| run_extract(&config, &sources).map(drop))
        }
        Some(Commands::Merge { leaves, common }) => {
            load_config(&common).and_then(|config| run_merge(&config, leaves))
        }
        Some(Commands::Annotate { genes, common }) => {
            load_config(&common).and_then(|config| run_annotate(&config, genes))
        }
        Some(Commands::Run {
            sources,
            genes,
            common,
        }) => load_config(&common).and_then(|config| run_all(&config, &sources, genes)),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Reads `<data_dir>/sitemerge.toml` and applies the command-line overrides.
fn load_config(common: &CommonArgs) -> Result<SiteConfig, SiteError> {
    let mut config = SiteConfig::load(&common.data_dir)?;
    if let Some(n) = common.num_procs {
        config.num_procs = Some(n);
    }
    if let Some(n) = common.batch_size {
        config.batch_size = n;
    }
    if let Some(n) = common.min_batch {
        config.min_batch = n;
    }
    config.force |= common.force;
    config.validate()?;
    debug!("Effective configuration: {config:?}");
    Ok(config)
}

fn run_extract(config: &SiteConfig, sources: &[PathBuf]) -> Result<Vec<PathBuf>, SiteError> {
    let start = Instant::now();
    let sources = discover_sources(sources)?;
    let report = extract_all(&sources, config)?;
    eprintln!(
        "> Extraction finished in {:.2?}: {} extracted, {} up-to-date.",
        start.elapsed(),
        report.extracted,
        report.skipped
    );
    Ok(report.leaves)
}

fn run_merge(config: &SiteConfig, leaves: Vec<PathBuf>) -> Result<(), SiteError> {
    let start = Instant::now();
    let leaves = if leaves.is_empty() {
        let cpra_dir = config.layout().cpra_dir;
        match list_files_naturally(&cpra_dir) {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(SiteError::NoInputs),
            Err(e) => return Err(SiteError::io(cpra_dir, e)),
        }
    } else {
        leaves
    };

    let report = MergeCoordinator::new(config)?.run(&leaves)?;
    if report.up_to_date {
        eprintln!("> Sites are up-to-date: {}", report.catalog.display());
    } else {
        eprintln!(
            "> Merged {} file(s) into {} in {:.2?} ({} merge task(s), {} reused).",
            leaves.len(),
            report.catalog.display(),
            start.elapsed(),
            report.merges,
            report.reused
        );
    }
    Ok(())
}

/// The `--genes` flag, else the configured gene file.
fn resolve_genes(config: &SiteConfig, genes: Option<PathBuf>) -> Result<PathBuf, SiteError> {
    genes
        .or_else(|| config.resolved_genes_path())
        .ok_or_else(|| {
            SiteError::Config(
                "no gene interval file: pass --genes or set genes_path in sitemerge.toml"
                    .to_string(),
            )
        })
}

fn run_annotate(config: &SiteConfig, genes: Option<PathBuf>) -> Result<(), SiteError> {
    let genes = resolve_genes(config, genes)?;
    let start = Instant::now();
    let report = annotate_catalog(config, &genes)?;
    if report.up_to_date {
        eprintln!("> Gene annotations are up-to-date: {}", report.catalog.display());
    } else {
        eprintln!(
            "> Annotated {} variant(s) into {} in {:.2?}.",
            report.annotated,
            report.catalog.display(),
            start.elapsed()
        );
    }
    Ok(())
}

fn run_all(
    config: &SiteConfig,
    sources: &[PathBuf],
    genes: Option<PathBuf>,
) -> Result<(), SiteError> {
    let genes = resolve_genes(config, genes)?;
    let leaves = run_extract(config, sources)?;
    run_merge(config, leaves)?;
    run_annotate(config, Some(genes))
}
