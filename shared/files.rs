// ========================================================================================
//
//                     Local file plumbing shared by every pipeline stage
//
// ========================================================================================
//
// Line-oriented readers that see through gzip, atomic temp-then-rename writers, random
// scratch names and freshness checks. Nothing in here knows about variants.

use flate2::read::MultiGzDecoder;
use log::debug;
use natord::compare;
use rand::Rng;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Suffix of in-progress output files. Files with this suffix are never valid inputs.
pub const PART_SUFFIX: &str = ".part";

const READ_BUFFER_SIZE: usize = 256 * 1024;
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// A trait that abstracts sequential, line-oriented access to text data,
/// regardless of whether the bytes on disk are compressed.
pub trait TextSource: Send {
    /// Returns the next line without its terminator, or `None` at end of input.
    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>>;
}

struct LocalTextSource {
    reader: Box<dyn BufRead + Send>,
    line: Vec<u8>,
    line_active: bool,
}

impl TextSource for LocalTextSource {
    fn next_line<'a>(&'a mut self) -> io::Result<Option<&'a [u8]>> {
        if self.line_active {
            self.line.clear();
            self.line_active = false;
        }

        let bytes_read = self.reader.read_until(b'\n', &mut self.line)?;
        if bytes_read == 0 {
            return Ok(None);
        }

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }

        self.line_active = true;
        Ok(Some(&self.line))
    }
}

fn is_gzip_magic(magic: &[u8; 2]) -> bool {
    magic[0] == 0x1F && magic[1] == 0x8B
}

/// Opens a local text file for line-by-line reading. Gzip input is detected from its
/// magic bytes rather than its extension.
pub fn open_text_source(path: &Path) -> io::Result<Box<dyn TextSource>> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 2];
    let bytes_read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn BufRead + Send> = if bytes_read == 2 && is_gzip_magic(&magic) {
        debug!("Reading {} as gzip", path.display());
        Box::new(BufReader::with_capacity(
            READ_BUFFER_SIZE,
            MultiGzDecoder::new(file),
        ))
    } else {
        Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file))
    };

    Ok(Box::new(LocalTextSource {
        reader,
        line: Vec::with_capacity(1024),
        line_active: false,
    }))
}

/// A buffered writer whose output only becomes visible at `final_path` once
/// `commit` has flushed, synced and renamed it. Dropping it uncommitted removes
/// the part file.
pub struct AtomicFile {
    final_path: PathBuf,
    part_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    /// Creates the part file, truncating any leftover from an interrupted run.
    pub fn create(final_path: &Path, part_path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = part_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&part_path)?;
        Ok(Self {
            final_path: final_path.to_path_buf(),
            part_path,
            writer: Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
        })
    }

    fn writer_mut(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("write after commit"))
    }

    /// Flushes and fsyncs the part file, then renames it over the final path.
    pub fn commit(mut self) -> io::Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::other("atomic file committed twice"))?;
        let file = writer.into_inner().map_err(io::Error::other)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.part_path, &self.final_path).inspect_err(|_| {
            let _ = fs::remove_file(&self.part_path);
        })?;
        sync_parent_dir(&self.final_path);
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer_mut()?.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer_mut()?.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer_mut()?.flush()
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.part_path);
        }
    }
}

// Directory fsync makes the rename itself durable. Not every platform allows opening
// a directory for this, so failures are only logged.
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
        && let Err(e) = dir.sync_all()
    {
        debug!("Could not sync directory {}: {e}", parent.display());
    }
}

/// The part-file path used while writing `final_path`, placed in `tmp_dir`.
pub fn part_path_for(final_path: &Path, tmp_dir: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    tmp_dir.join(format!("{name}{PART_SUFFIX}"))
}

/// A scratch path like `<dir>/<prefix>-<random>.<extension>`.
pub fn random_scratch_path(dir: &Path, prefix: &str, extension: &str) -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen_range(0..10_000_000_000);
    dir.join(format!("{prefix}-{suffix}.{extension}"))
}

fn modified(path: &Path) -> io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

/// True when `output` exists and is at least as new as every one of `inputs`.
/// Any metadata failure counts as stale.
pub fn is_up_to_date(output: &Path, inputs: &[PathBuf]) -> bool {
    let output_time = match modified(output) {
        Ok(t) => t,
        Err(_) => return false,
    };
    inputs.iter().all(|input| {
        modified(input)
            .map(|input_time| input_time <= output_time)
            .unwrap_or(false)
    })
}

/// Lists the regular, non-hidden files of `dir` in natural filename order,
/// skipping in-progress part files.
pub fn list_files_naturally(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = file_name_of(&path);
        if name.starts_with('.') || name.ends_with(PART_SUFFIX) {
            continue;
        }
        files.push(path);
    }
    files.sort_by(|a, b| compare(&file_name_of(a), &file_name_of(b)));
    Ok(files)
}

/// The final path component as an owned string, or the whole path when it has none.
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
