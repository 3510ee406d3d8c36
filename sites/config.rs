// ========================================================================================
//                               Run configuration & layout
// ========================================================================================

use crate::error::SiteError;
use log::debug;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the optional configuration file looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "sitemerge.toml";

pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const DEFAULT_MIN_BATCH: usize = 4;

/// Everything a run needs to know. Values come from `<data_dir>/sitemerge.toml` when
/// that file exists, and command-line flags are layered on top by the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    /// Root of the `cpra/`, `tmp/` and `sites/` directories. Always the directory
    /// the configuration was loaded for, never read from the file.
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Worker thread count. `None` derives it from the number of CPUs.
    pub num_procs: Option<usize>,
    /// Maximum number of files one merge task consumes.
    pub batch_size: usize,
    /// Smallest pool that still justifies starting a merge while others are running.
    pub min_batch: usize,
    /// Gene interval file used by annotation. Relative paths resolve against `data_dir`.
    pub genes_path: Option<PathBuf>,
    /// Rebuild outputs even when they are newer than their inputs.
    pub force: bool,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            num_procs: None,
            batch_size: DEFAULT_BATCH_SIZE,
            min_batch: DEFAULT_MIN_BATCH,
            genes_path: None,
            force: false,
        }
    }
}

impl SiteConfig {
    /// Loads `<data_dir>/sitemerge.toml`, falling back to defaults when it is absent.
    pub fn load(data_dir: &Path) -> Result<Self, SiteError> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => {
                debug!("Loading configuration from {}", path.display());
                toml::from_str::<SiteConfig>(&contents)
                    .map_err(|source| SiteError::ConfigParse { path, source })?
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => SiteConfig::default(),
            Err(e) => return Err(SiteError::io(path, e)),
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    /// Rejects batch parameters that could stall the coordinator.
    pub fn validate(&self) -> Result<(), SiteError> {
        if self.batch_size < 2 {
            return Err(SiteError::Config(format!(
                "batch_size must be at least 2, got {}",
                self.batch_size
            )));
        }
        if self.min_batch < 2 {
            return Err(SiteError::Config(format!(
                "min_batch must be at least 2, got {}",
                self.min_batch
            )));
        }
        if self.min_batch > self.batch_size {
            return Err(SiteError::Config(format!(
                "min_batch ({}) cannot exceed batch_size ({})",
                self.min_batch, self.batch_size
            )));
        }
        if self.num_procs == Some(0) {
            return Err(SiteError::Config(
                "num_procs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.num_procs.unwrap_or_else(default_num_procs)
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }

    /// The gene interval file, resolved against the data directory.
    pub fn resolved_genes_path(&self) -> Option<PathBuf> {
        self.genes_path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.data_dir.join(p)
            }
        })
    }
}

/// Worker count derived from a CPU count: everything on one core, one core spare on
/// small machines, three quarters of the cores otherwise.
pub fn procs_for_cpus(cpus: usize) -> usize {
    match cpus {
        0 | 1 => 1,
        2 | 3 => cpus - 1,
        n => n * 3 / 4,
    }
}

pub fn default_num_procs() -> usize {
    procs_for_cpus(num_cpus::get())
}

/// The directory conventions under a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    pub cpra_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub sites_dir: PathBuf,
}

impl DataLayout {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            cpra_dir: data_dir.join("cpra"),
            tmp_dir: data_dir.join("tmp"),
            sites_dir: data_dir.join("sites"),
        }
    }

    /// Where the merged catalog is published.
    pub fn unannotated_catalog(&self) -> PathBuf {
        self.sites_dir.join("sites-unannotated.tsv")
    }

    /// Where the gene-annotated catalog is published.
    pub fn annotated_catalog(&self) -> PathBuf {
        self.sites_dir.join("sites.tsv")
    }

    pub fn create_dirs(&self) -> Result<(), SiteError> {
        for dir in [&self.cpra_dir, &self.tmp_dir, &self.sites_dir] {
            fs::create_dir_all(dir).map_err(|e| SiteError::io(dir, e))?;
        }
        Ok(())
    }
}
