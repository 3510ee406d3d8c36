// ========================================================================================
//
//                                 The k-way merge engine
//
// ========================================================================================
//
// Merges any number of individually sorted variant files into one sorted file. The
// heads of all streams live in an ordered map keyed by variant; each step pops the
// smallest key and writes one row for every stream positioned on it, so duplicates
// across files survive and the output is the multiset union of the inputs.

use crate::error::SiteError;
use crate::shared::files::{AtomicFile, part_path_for};
use crate::stream::ValidatedKeyStream;
use crate::types::{VARIANT_HEADER, VariantKey};
use itertools::Itertools;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current head of every live stream, grouped by key. Stream ids index `streams`.
struct MergeFrontier {
    streams: Vec<ValidatedKeyStream>,
    heads: BTreeMap<VariantKey, Vec<usize>>,
}

impl MergeFrontier {
    fn open(inputs: &[PathBuf]) -> Result<Self, SiteError> {
        let streams = inputs
            .iter()
            .map(|path| ValidatedKeyStream::open(path))
            .collect::<Result<Vec<_>, _>>()?;
        let mut frontier = Self {
            streams,
            heads: BTreeMap::new(),
        };
        for id in 0..frontier.streams.len() {
            if !frontier.advance(id)? {
                warn!(
                    "{} contains no variants",
                    frontier.streams[id].path().display()
                );
            }
        }
        Ok(frontier)
    }

    /// Pulls the next key from stream `id` into the frontier. Returns false once the
    /// stream is exhausted, at which point it is simply never re-inserted.
    fn advance(&mut self, id: usize) -> Result<bool, SiteError> {
        match self.streams[id].next() {
            Some(Ok(key)) => {
                self.heads.entry(key).or_default().push(id);
                Ok(true)
            }
            Some(Err(e)) => Err(e),
            None => Ok(false),
        }
    }

    /// Removes the smallest key and the ids of the streams positioned on it, in
    /// stream-id order.
    fn pop_min(&mut self) -> Option<(VariantKey, Vec<usize>)> {
        let (key, mut ids) = self.heads.pop_first()?;
        ids.sort_unstable();
        Some((key, ids))
    }
}

/// Merges `inputs` into `output`. The rows are written to a part file inside
/// `tmp_dir` which is fsynced and renamed over `output` only after the last row,
/// so an interrupted merge never leaves a truncated `output` behind.
///
/// Returns the number of variant rows written.
pub fn merge_files(inputs: &[PathBuf], output: &Path, tmp_dir: &Path) -> Result<u64, SiteError> {
    debug!(
        "Merging {} file(s) into {}",
        inputs.len(),
        output.display()
    );
    let mut frontier = MergeFrontier::open(inputs)?;

    let mut out = AtomicFile::create(output, part_path_for(output, tmp_dir))
        .map_err(|e| SiteError::io(output, e))?;
    writeln!(out, "{VARIANT_HEADER}").map_err(|e| SiteError::io(output, e))?;

    let mut written: u64 = 0;
    while let Some((key, ids)) = frontier.pop_min() {
        for _ in &ids {
            key.write_row(&mut out)
                .map_err(|e| SiteError::io(output, e))?;
        }
        written += ids.len() as u64;
        for id in ids {
            frontier.advance(id)?;
        }
    }

    out.commit().map_err(|e| SiteError::io(output, e))?;

    info!(
        "{written} variants in {} <- [{}]",
        output.display(),
        inputs.iter().map(|p| p.display()).join(", ")
    );
    Ok(written)
}
