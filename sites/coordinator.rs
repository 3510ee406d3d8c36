// ========================================================================================
//
//                      Merge task coordination across worker threads
//
// ========================================================================================
//
// Reduces a pool of sorted files to a single catalog by repeatedly merging batches of
// them. The pool lives on the coordinating thread; workers only ever see the batch
// they were handed and report back over a channel, so there is no shared lock.
//
// Every intermediate output carries a `.sources` manifest naming the leaf files it
// covers. A rerun after an interruption reuses those intermediates instead of
// starting from the leaves again.

use crate::config::SiteConfig;
use crate::error::SiteError;
use crate::merge::merge_files;
use crate::progress::create_progress_bar;
use crate::shared::files::{
    AtomicFile, PART_SUFFIX, file_name_of, is_up_to_date, part_path_for, random_scratch_path,
};
use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, error, info, warn};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::thread;

/// Prefix of intermediate merge outputs inside the temp directory.
pub const MERGING_PREFIX: &str = "merging";
/// Extension of intermediate merge outputs.
pub const MERGING_EXTENSION: &str = "tsv";
/// Suffix appended to an intermediate's path to name its manifest.
pub const MANIFEST_SUFFIX: &str = ".sources";

// ========================================================================================
//                                  Pool entries
// ========================================================================================

/// One file in the merge pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolFile {
    /// A caller-supplied input. Leaves are read but never moved or deleted.
    Leaf(PathBuf),
    /// An intermediate written by a previous merge, with the leaves it covers.
    Merged { path: PathBuf, leaves: Vec<PathBuf> },
}

impl PoolFile {
    pub fn path(&self) -> &Path {
        match self {
            PoolFile::Leaf(path) => path,
            PoolFile::Merged { path, .. } => path,
        }
    }

    /// The leaf files whose records this file contains.
    pub fn leaves(&self) -> Vec<PathBuf> {
        match self {
            PoolFile::Leaf(path) => vec![path.clone()],
            PoolFile::Merged { leaves, .. } => leaves.clone(),
        }
    }
}

pub fn manifest_path_for(intermediate: &Path) -> PathBuf {
    let mut name = intermediate.as_os_str().to_owned();
    name.push(MANIFEST_SUFFIX);
    PathBuf::from(name)
}

/// Writes the manifest of `intermediate` atomically, one leaf path per line.
fn write_manifest(intermediate: &Path, leaves: &[PathBuf], tmp_dir: &Path) -> Result<(), SiteError> {
    let manifest = manifest_path_for(intermediate);
    let mut out = AtomicFile::create(&manifest, part_path_for(&manifest, tmp_dir))
        .map_err(|e| SiteError::io(&manifest, e))?;
    for leaf in leaves {
        writeln!(out, "{}", leaf.display()).map_err(|e| SiteError::io(&manifest, e))?;
    }
    out.commit().map_err(|e| SiteError::io(&manifest, e))
}

fn read_manifest(manifest: &Path) -> io::Result<Vec<PathBuf>> {
    let reader = BufReader::new(fs::File::open(manifest)?);
    let mut leaves = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.is_empty() {
            leaves.push(PathBuf::from(line));
        }
    }
    Ok(leaves)
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {e}", path.display()),
    }
}

/// Deletes an intermediate and its manifest. Leaves are left alone.
fn discard(file: &PoolFile) {
    if let PoolFile::Merged { path, .. } = file {
        remove_if_present(path);
        remove_if_present(&manifest_path_for(path));
    }
}

// ========================================================================================
//                                 Resume planning
// ========================================================================================

/// The starting pool for a run over `leaves`, plus how many intermediates were reused.
#[derive(Debug)]
pub struct ResumePlan {
    pub pool: Vec<PoolFile>,
    pub reused: usize,
}

/// Scans `tmp_dir` and decides which earlier intermediates can seed the pool.
///
/// An intermediate is reusable when it has a manifest, every leaf it names is one of
/// `leaves`, and it is at least as new as all of them. Reusable intermediates are
/// chosen greedily by coverage so that no leaf is counted twice; the leaves left
/// uncovered join the pool as they are. Everything else the scan finds under the
/// merge prefix, plus any leftover part file, is deleted.
pub fn plan_resume(leaves: &[PathBuf], tmp_dir: &Path) -> Result<ResumePlan, SiteError> {
    fs::create_dir_all(tmp_dir).map_err(|e| SiteError::io(tmp_dir, e))?;

    let known: AHashSet<&PathBuf> = leaves.iter().collect();
    let mut candidates: Vec<(PathBuf, Vec<PathBuf>)> = Vec::new();
    let mut stale: Vec<PathBuf> = Vec::new();

    let entries = fs::read_dir(tmp_dir).map_err(|e| SiteError::io(tmp_dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| SiteError::io(tmp_dir, e))?.path();
        if !path.is_file() {
            continue;
        }
        let name = file_name_of(&path);
        if name.ends_with(PART_SUFFIX) {
            stale.push(path);
            continue;
        }
        if !name.starts_with(&format!("{MERGING_PREFIX}-")) {
            continue;
        }
        if name.ends_with(MANIFEST_SUFFIX) {
            let output = path.with_extension("");
            if !output.is_file() {
                stale.push(path);
            }
            continue;
        }

        let manifest = manifest_path_for(&path);
        let covered = match read_manifest(&manifest) {
            Ok(covered) => covered,
            Err(e) => {
                debug!("No usable manifest for {}: {e}", path.display());
                stale.push(path);
                continue;
            }
        };
        let unique: AHashSet<&PathBuf> = covered.iter().collect();
        let reusable = !covered.is_empty()
            && unique.len() == covered.len()
            && covered.iter().all(|leaf| known.contains(leaf))
            && is_up_to_date(&path, &covered);
        if reusable {
            candidates.push((path, covered));
        } else {
            debug!("Intermediate {} no longer matches its inputs", path.display());
            stale.push(manifest);
            stale.push(path);
        }
    }

    candidates.sort_by(|(a_path, a_leaves), (b_path, b_leaves)| {
        b_leaves
            .len()
            .cmp(&a_leaves.len())
            .then_with(|| a_path.cmp(b_path))
    });

    let mut covered: AHashSet<PathBuf> = AHashSet::new();
    let mut reused: Vec<PoolFile> = Vec::new();
    for (path, file_leaves) in candidates {
        if file_leaves.iter().any(|leaf| covered.contains(leaf)) {
            stale.push(manifest_path_for(&path));
            stale.push(path);
            continue;
        }
        covered.extend(file_leaves.iter().cloned());
        reused.push(PoolFile::Merged {
            path,
            leaves: file_leaves,
        });
    }

    for path in &stale {
        remove_if_present(path);
    }
    if !stale.is_empty() {
        info!("Removed {} stale temporary file(s) from {}", stale.len(), tmp_dir.display());
    }

    let reused_count = reused.len();
    let mut pool: Vec<PoolFile> = leaves
        .iter()
        .filter(|leaf| !covered.contains(*leaf))
        .cloned()
        .map(PoolFile::Leaf)
        .collect();
    pool.extend(reused);

    Ok(ResumePlan {
        pool,
        reused: reused_count,
    })
}

// ========================================================================================
//                            Coordinator <-> worker protocol
// ========================================================================================

enum WorkerMessage {
    Ready {
        worker: usize,
    },
    Finished {
        worker: usize,
        batch: u64,
        outcome: Result<PoolFile, SiteError>,
    },
}

enum Assignment {
    Merge {
        batch: u64,
        inputs: Vec<PoolFile>,
        output: PathBuf,
    },
    Stop,
}

/// Merges one claimed batch into `output`, records its manifest and only then deletes
/// the consumed intermediates.
fn run_batch(inputs: &[PoolFile], output: &Path, tmp_dir: &Path) -> Result<PoolFile, SiteError> {
    let paths: Vec<PathBuf> = inputs.iter().map(|f| f.path().to_path_buf()).collect();
    merge_files(&paths, output, tmp_dir)?;

    let mut leaves: Vec<PathBuf> = inputs.iter().flat_map(PoolFile::leaves).collect();
    leaves.sort();
    write_manifest(output, &leaves, tmp_dir)?;

    for input in inputs {
        discard(input);
    }
    Ok(PoolFile::Merged {
        path: output.to_path_buf(),
        leaves,
    })
}

fn worker_loop(
    worker: usize,
    tmp_dir: &Path,
    to_coordinator: Sender<WorkerMessage>,
    assignments: Receiver<Assignment>,
) {
    if to_coordinator.send(WorkerMessage::Ready { worker }).is_err() {
        return;
    }
    while let Ok(Assignment::Merge {
        batch,
        inputs,
        output,
    }) = assignments.recv()
    {
        let outcome = catch_unwind(AssertUnwindSafe(|| run_batch(&inputs, &output, tmp_dir)))
            .unwrap_or_else(|_| {
                Err(SiteError::Worker(format!(
                    "worker {worker} panicked while merging into {}",
                    output.display()
                )))
            });
        let message = WorkerMessage::Finished {
            worker,
            batch,
            outcome,
        };
        if to_coordinator.send(message).is_err() {
            return;
        }
    }
}

// ========================================================================================
//                                    The coordinator
// ========================================================================================

/// What a call to [`MergeCoordinator::run`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub catalog: PathBuf,
    /// Merge tasks executed in this run.
    pub merges: usize,
    /// Intermediates from an earlier run that seeded the pool.
    pub reused: usize,
    /// True when the catalog was already newer than every leaf and nothing ran.
    pub up_to_date: bool,
}

/// Pool bookkeeping owned by the coordinating thread.
struct PoolState {
    to_merge: Vec<PoolFile>,
    in_flight: AHashMap<u64, (Vec<PoolFile>, PathBuf)>,
    next_batch: u64,
    batch_size: usize,
    min_batch: usize,
    merges: usize,
    failures: Vec<String>,
    fatal: Option<SiteError>,
}

impl PoolState {
    /// Decides what an idle worker should do next, following the claim rule: take
    /// up to `batch_size` files from the end of the pool when the pool is large
    /// enough or nobody else is merging; otherwise retire the worker.
    fn next_assignment(&mut self, tmp_dir: &Path) -> Assignment {
        if self.fatal.is_some() || self.to_merge.len() <= 1 {
            return Assignment::Stop;
        }
        if self.to_merge.len() < self.min_batch && !self.in_flight.is_empty() {
            return Assignment::Stop;
        }

        let start = self.to_merge.len().saturating_sub(self.batch_size);
        let inputs = self.to_merge.split_off(start);
        let batch = self.next_batch;
        self.next_batch += 1;

        let mut output = random_scratch_path(tmp_dir, MERGING_PREFIX, MERGING_EXTENSION);
        while output.exists() || self.is_claimed(&output) {
            output = random_scratch_path(tmp_dir, MERGING_PREFIX, MERGING_EXTENSION);
        }

        self.in_flight
            .insert(batch, (inputs.clone(), output.clone()));
        Assignment::Merge {
            batch,
            inputs,
            output,
        }
    }

    fn is_claimed(&self, path: &Path) -> bool {
        self.to_merge.iter().any(|f| f.path() == path)
            || self.in_flight.values().any(|(_, output)| output == path)
    }

    /// Returns how far the pool shrank, for progress reporting.
    fn finish(&mut self, worker: usize, batch: u64, outcome: Result<PoolFile, SiteError>) -> u64 {
        let consumed = self
            .in_flight
            .remove(&batch)
            .map_or(0, |(inputs, _)| inputs.len());
        match outcome {
            Ok(output) => {
                self.merges += 1;
                self.to_merge.push(output);
                consumed.saturating_sub(1) as u64
            }
            Err(e) if e.is_fatal() => {
                error!("Worker {worker} hit a fatal error: {e}");
                if self.fatal.is_none() {
                    self.fatal = Some(e);
                }
                0
            }
            Err(e) => {
                error!("Worker {worker} failed: {e}");
                self.failures.push(e.to_string());
                0
            }
        }
    }
}

/// Reduces a set of leaf files to the published, unannotated catalog.
pub struct MergeCoordinator<'a> {
    config: &'a SiteConfig,
}

impl<'a> MergeCoordinator<'a> {
    pub fn new(config: &'a SiteConfig) -> Result<Self, SiteError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Merges `leaves` into the layout's unannotated catalog.
    pub fn run(&self, leaves: &[PathBuf]) -> Result<MergeReport, SiteError> {
        let layout = self.config.layout();
        self.run_into(leaves, &layout.unannotated_catalog(), &layout.tmp_dir)
    }

    /// Merges `leaves` into `catalog`, using `tmp_dir` for intermediates.
    pub fn run_into(
        &self,
        leaves: &[PathBuf],
        catalog: &Path,
        tmp_dir: &Path,
    ) -> Result<MergeReport, SiteError> {
        if leaves.is_empty() {
            return Err(SiteError::NoInputs);
        }
        let mut seen = AHashSet::new();
        if let Some(dup) = leaves.iter().find(|leaf| !seen.insert(*leaf)) {
            return Err(SiteError::Config(format!(
                "input {} was given more than once",
                dup.display()
            )));
        }

        if !self.config.force && is_up_to_date(catalog, leaves) {
            info!("Sites are up-to-date in {}", catalog.display());
            return Ok(MergeReport {
                catalog: catalog.to_path_buf(),
                merges: 0,
                reused: 0,
                up_to_date: true,
            });
        }

        let plan = plan_resume(leaves, tmp_dir)?;
        if plan.reused > 0 {
            eprintln!(
                "> Resuming: {} intermediate file(s) from an earlier run cover part of the input.",
                plan.reused
            );
        }

        let workers = self.config.worker_count();
        eprintln!(
            "> Merging {} file(s) with {workers} worker(s), batches of up to {}.",
            plan.pool.len(),
            self.config.batch_size
        );

        let mut state = PoolState {
            to_merge: plan.pool,
            in_flight: AHashMap::new(),
            next_batch: 0,
            batch_size: self.config.batch_size,
            min_batch: self.config.min_batch,
            merges: 0,
            failures: Vec::new(),
            fatal: None,
        };
        self.drive(&mut state, workers, tmp_dir)?;

        if let Some(fatal) = state.fatal {
            return Err(fatal);
        }
        if !state.failures.is_empty() {
            return Err(SiteError::WorkersFailed {
                failures: state.failures,
            });
        }

        let last = match state.to_merge.pop() {
            Some(file) if state.to_merge.is_empty() => file,
            _ => {
                return Err(SiteError::Worker(
                    "merge pool did not converge to a single file".to_string(),
                ));
            }
        };
        self.publish(last, catalog, tmp_dir)?;

        Ok(MergeReport {
            catalog: catalog.to_path_buf(),
            merges: state.merges,
            reused: plan.reused,
            up_to_date: false,
        })
    }

    /// Runs the worker threads and services their messages until every worker has
    /// been told to stop.
    fn drive(&self, state: &mut PoolState, workers: usize, tmp_dir: &Path) -> Result<(), SiteError> {
        let pb = create_progress_bar(
            state.to_merge.len().saturating_sub(1) as u64,
            "Merging variant files...",
        );
        let (to_coordinator, inbox) = unbounded::<WorkerMessage>();

        let joined = thread::scope(|scope| {
            let mut outboxes: Vec<Sender<Assignment>> = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (outbox, assignments) = bounded::<Assignment>(1);
                outboxes.push(outbox);
                let sender = to_coordinator.clone();
                handles.push(scope.spawn(move || worker_loop(worker, tmp_dir, sender, assignments)));
            }
            drop(to_coordinator);

            let mut active = workers;
            while active > 0 {
                let Ok(message) = inbox.recv() else {
                    break;
                };
                let worker = match message {
                    WorkerMessage::Ready { worker } => worker,
                    WorkerMessage::Finished {
                        worker,
                        batch,
                        outcome,
                    } => {
                        pb.inc(state.finish(worker, batch, outcome));
                        worker
                    }
                };
                let assignment = state.next_assignment(tmp_dir);
                if matches!(assignment, Assignment::Stop) {
                    debug!("Retiring worker {worker}");
                    active -= 1;
                }
                if outboxes[worker].send(assignment).is_err() {
                    warn!("Worker {worker} went away before receiving its assignment");
                }
            }
            drop(outboxes);

            handles
                .into_iter()
                .filter_map(|handle| handle.join().err())
                .count()
        });
        pb.finish_and_clear();

        if joined > 0 {
            return Err(SiteError::Worker(format!(
                "{joined} worker thread(s) terminated abnormally"
            )));
        }
        Ok(())
    }

    /// Moves the last pool file to `catalog`. A leaf is copied through the merge
    /// engine instead so that input files are never moved.
    fn publish(&self, last: PoolFile, catalog: &Path, tmp_dir: &Path) -> Result<(), SiteError> {
        match &last {
            PoolFile::Leaf(path) => {
                merge_files(std::slice::from_ref(path), catalog, tmp_dir)?;
            }
            PoolFile::Merged { path, .. } => {
                if let Some(parent) = catalog.parent() {
                    fs::create_dir_all(parent).map_err(|e| SiteError::io(parent, e))?;
                }
                fs::rename(path, catalog).map_err(|e| SiteError::io(catalog, e))?;
                remove_if_present(&manifest_path_for(path));
            }
        }
        info!("Published site catalog {}", catalog.display());
        Ok(())
    }
}
