// ========================================================================================
//
//                     Extraction of leaf variant files from raw sources
//
// ========================================================================================
//
// Each source is an association-results table whose first four columns are
// `chrom pos ref alt`. Extraction keeps only those four columns, normalizes chromosome
// aliases, validates the ordering and writes the result as a leaf file under `cpra/`.
// The leaf files are the inputs of the merge.

use crate::config::SiteConfig;
use crate::error::SiteError;
use crate::progress::create_progress_bar;
use crate::shared::files::{
    AtomicFile, file_name_of, is_up_to_date, list_files_naturally, part_path_for,
};
use crate::stream::ValidatedKeyStream;
use crate::types::VARIANT_HEADER;
use ahash::AHashMap;
use log::{debug, error, info};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Outcome of extracting a set of sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    /// Every leaf file, in the order of the sources they came from.
    pub leaves: Vec<PathBuf>,
    pub extracted: usize,
    pub skipped: usize,
}

/// Expands directories into their files (natural filename order) and keeps explicit
/// file paths as given.
pub fn discover_sources(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, SiteError> {
    let mut sources = Vec::new();
    for input in inputs {
        if input.is_dir() {
            sources.extend(list_files_naturally(input).map_err(|e| SiteError::io(input, e))?);
        } else {
            sources.push(input.clone());
        }
    }
    Ok(sources)
}

/// The leaf file name for a source: its file name without a trailing `.gz`.
pub fn leaf_name_for(source: &Path) -> String {
    let name = file_name_of(source);
    match name.strip_suffix(".gz") {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}

/// Writes the validated `chrom pos ref alt` columns of `source` to `leaf`.
/// Returns the number of variants written.
pub fn extract_source(source: &Path, leaf: &Path, tmp_dir: &Path) -> Result<u64, SiteError> {
    let stream = ValidatedKeyStream::open(source)?;
    let mut out = AtomicFile::create(leaf, part_path_for(leaf, tmp_dir))
        .map_err(|e| SiteError::io(leaf, e))?;
    writeln!(out, "{VARIANT_HEADER}").map_err(|e| SiteError::io(leaf, e))?;

    let mut written: u64 = 0;
    for key in stream {
        key?.write_row(&mut out)
            .map_err(|e| SiteError::io(leaf, e))?;
        written += 1;
    }
    out.commit().map_err(|e| SiteError::io(leaf, e))?;
    debug!("{written} variants in {} <- {}", leaf.display(), source.display());
    Ok(written)
}

enum SourceOutcome {
    Extracted,
    Skipped,
}

/// Extracts every source into the layout's `cpra/` directory in parallel.
///
/// All sources are attempted even when some fail; the failures are logged one by one
/// and then reported together.
pub fn extract_all(sources: &[PathBuf], config: &SiteConfig) -> Result<ExtractReport, SiteError> {
    if sources.is_empty() {
        return Err(SiteError::NoInputs);
    }
    let layout = config.layout();
    layout.create_dirs()?;

    let mut names: AHashMap<String, &Path> = AHashMap::new();
    let mut jobs: Vec<(&Path, PathBuf)> = Vec::with_capacity(sources.len());
    for source in sources {
        let name = leaf_name_for(source);
        if let Some(previous) = names.insert(name.clone(), source.as_path()) {
            return Err(SiteError::Config(format!(
                "sources {} and {} would both be extracted to cpra/{name}",
                previous.display(),
                source.display()
            )));
        }
        jobs.push((source.as_path(), layout.cpra_dir.join(name)));
    }

    let workers = config.worker_count();
    eprintln!(
        "> Extracting variants from {} source file(s) with {workers} worker(s).",
        jobs.len()
    );
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| SiteError::Worker(format!("could not start extraction threads: {e}")))?;

    let pb = create_progress_bar(jobs.len() as u64, "Extracting variant files...");
    let force = config.force;
    let outcomes: Vec<Result<SourceOutcome, SiteError>> = pool.install(|| {
        jobs.par_iter()
            .map(|(source, leaf)| {
                let outcome = if !force && is_up_to_date(leaf, &[source.to_path_buf()]) {
                    debug!("{} is up-to-date", leaf.display());
                    Ok(SourceOutcome::Skipped)
                } else {
                    extract_source(source, leaf, &layout.tmp_dir).map(|_| SourceOutcome::Extracted)
                };
                pb.inc(1);
                outcome
            })
            .collect()
    });
    pb.finish_and_clear();

    let mut failed = Vec::new();
    let mut extracted = 0;
    let mut skipped = 0;
    for ((source, _), outcome) in jobs.iter().zip(outcomes) {
        match outcome {
            Ok(SourceOutcome::Extracted) => extracted += 1,
            Ok(SourceOutcome::Skipped) => skipped += 1,
            Err(e) => {
                error!("Failed to extract {}: {e}", source.display());
                failed.push(file_name_of(source));
            }
        }
    }
    if !failed.is_empty() {
        return Err(SiteError::ExtractionFailed {
            failed,
            total: jobs.len(),
        });
    }

    info!("Extracted {extracted} source file(s), {skipped} already up-to-date");
    Ok(ExtractReport {
        leaves: jobs.into_iter().map(|(_, leaf)| leaf).collect(),
        extracted,
        skipped,
    })
}
