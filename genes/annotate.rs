// ========================================================================================
//
//                         Overlapping and nearest gene annotation
//
// ========================================================================================

use crate::config::SiteConfig;
use crate::error::SiteError;
use crate::shared::files::{AtomicFile, is_up_to_date, open_text_source, part_path_for};
use crate::types::{CHROM_ORDER, Chromosome};
use super::bisect::BisectFinder;
use itertools::Itertools;
use log::{debug, info};
use rust_lapper::{Interval, Lapper};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the column appended to the catalog.
pub const GENE_COLUMN: &str = "nearest_genes";

/// Chromosome labels accepted in a gene interval file.
const GENE_CHROMS: [&str; 25] = [
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "M",
];

/// One gene interval, half-open: `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneInterval {
    pub chrom: Chromosome,
    pub start: u32,
    pub end: u32,
    pub name: String,
}

/// The per-chromosome indexes. Interval values and finder values are indices into
/// `GeneAnnotator::names`.
struct ChromGenes {
    tree: Lapper<u32, u32>,
    starts: BisectFinder<u32>,
    ends: BisectFinder<u32>,
}

/// Answers "which gene is this position in, or closest to" for every chromosome that
/// has at least one gene.
pub struct GeneAnnotator {
    names: Vec<String>,
    chroms: Vec<Option<ChromGenes>>,
}

impl GeneAnnotator {
    pub fn new(intervals: Vec<GeneInterval>) -> Self {
        let mut names = Vec::with_capacity(intervals.len());
        let mut grouped: Vec<Vec<(u32, u32, u32)>> = vec![Vec::new(); CHROM_ORDER.len()];
        for gene in intervals {
            let idx = names.len() as u32;
            grouped[gene.chrom.rank() as usize].push((gene.start, gene.end, idx));
            names.push(gene.name);
        }

        let chroms = grouped
            .into_iter()
            .map(|genes| {
                if genes.is_empty() {
                    return None;
                }
                let tree = Lapper::new(
                    genes
                        .iter()
                        .map(|&(start, stop, val)| Interval { start, stop, val })
                        .collect(),
                );
                let starts = BisectFinder::new(genes.iter().map(|&(s, _, i)| (s, i)).collect());
                let ends = BisectFinder::new(genes.iter().map(|&(_, e, i)| (e, i)).collect());
                Some(ChromGenes { tree, starts, ends })
            })
            .collect();

        Self { names, chroms }
    }

    /// Genes overlapping `pos`, comma-joined without repeats. When none overlap, the
    /// gene whose end (at or before `pos`) or start (at or after `pos`) is closest.
    /// Equal distances go to the gene starting after `pos`. Chromosomes without any
    /// gene yield an empty string.
    pub fn annotate(&self, chrom: Chromosome, pos: u32) -> String {
        let Some(genes) = self.chroms[chrom.rank() as usize].as_ref() else {
            return String::new();
        };

        let mut overlapping = genes
            .tree
            .find(pos, pos.saturating_add(1))
            .map(|iv| self.names[iv.val as usize].as_str())
            .unique()
            .peekable();
        if overlapping.peek().is_some() {
            return overlapping.join(",");
        }

        let before = genes.ends.item_before(pos);
        let after = genes.starts.item_after(pos);
        let nearest = match (before, after) {
            (Some(&(end, upstream)), Some(&(start, downstream))) => {
                if pos - end < start - pos {
                    upstream
                } else {
                    downstream
                }
            }
            (Some(&(_, upstream)), None) => upstream,
            (None, Some(&(_, downstream))) => downstream,
            (None, None) => return String::new(),
        };
        self.names[nearest as usize].clone()
    }
}

fn parse_gene_line(path: &Path, line_number: u64, line: &[u8]) -> Result<GeneInterval, SiteError> {
    let text = String::from_utf8_lossy(line);
    let parse_error = |details: String| SiteError::Parse {
        path: path.to_path_buf(),
        line_number,
        line_content: text.to_string(),
        details,
    };

    let fields: Vec<&str> = text.splitn(5, '\t').collect();
    if fields.len() < 4 {
        return Err(parse_error(
            "expected at least 4 tab-delimited columns (chrom, start, end, gene)".to_string(),
        ));
    }
    if !GENE_CHROMS.contains(&fields[0]) {
        return Err(parse_error(format!(
            "chromosome {:?} must be one of {}",
            fields[0],
            GENE_CHROMS.join(", ")
        )));
    }
    let chrom = Chromosome::parse(fields[0])
        .ok_or_else(|| parse_error(format!("chromosome {:?} is not handled", fields[0])))?;
    let start: u32 = fields[1]
        .parse()
        .map_err(|e| parse_error(format!("start {:?} is not an integer: {e}", fields[1])))?;
    let end: u32 = fields[2]
        .parse()
        .map_err(|e| parse_error(format!("end {:?} is not an integer: {e}", fields[2])))?;
    if end < start {
        return Err(parse_error(format!("end {end} is before start {start}")));
    }
    if fields[3].is_empty() {
        return Err(parse_error("gene name is empty".to_string()));
    }

    Ok(GeneInterval {
        chrom,
        start,
        end,
        name: fields[3].to_string(),
    })
}

/// Reads a headerless `chrom start end gene [...]` interval file.
pub fn load_gene_intervals(path: &Path) -> Result<Vec<GeneInterval>, SiteError> {
    let mut source = open_text_source(path).map_err(|e| SiteError::io(path, e))?;
    let mut intervals = Vec::new();
    let mut line_number: u64 = 0;
    while let Some(line) = source.next_line().map_err(|e| SiteError::io(path, e))? {
        line_number += 1;
        if line.is_empty() || line.starts_with(b"#") {
            continue;
        }
        intervals.push(parse_gene_line(path, line_number, line)?);
    }
    debug!("Loaded {} gene intervals from {}", intervals.len(), path.display());
    Ok(intervals)
}

/// Copies `input` to `output`, appending a `nearest_genes` column. Lines are streamed
/// one at a time; `output` only appears once it is complete.
///
/// Returns the number of data lines annotated.
pub fn annotate_file(
    input: &Path,
    output: &Path,
    tmp_dir: &Path,
    annotator: &GeneAnnotator,
) -> Result<u64, SiteError> {
    let mut source = open_text_source(input).map_err(|e| SiteError::io(input, e))?;
    let header = source
        .next_line()
        .map_err(|e| SiteError::io(input, e))?
        .ok_or_else(|| SiteError::EmptyFile {
            path: input.to_path_buf(),
        })?
        .to_vec();
    if !header.starts_with(b"chrom\tpos") {
        return Err(SiteError::Header {
            path: input.to_path_buf(),
            found: String::from_utf8_lossy(&header).into_owned(),
        });
    }

    let mut out = AtomicFile::create(output, part_path_for(output, tmp_dir))
        .map_err(|e| SiteError::io(output, e))?;
    let write_err = |e| SiteError::io(output, e);
    out.write_all(&header).map_err(write_err)?;
    writeln!(out, "\t{GENE_COLUMN}").map_err(write_err)?;

    let mut line_number: u64 = 1;
    let mut annotated: u64 = 0;
    while let Some(line) = source.next_line().map_err(|e| SiteError::io(input, e))? {
        line_number += 1;
        if line.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(line).map_err(|e| SiteError::Parse {
            path: input.to_path_buf(),
            line_number,
            line_content: String::from_utf8_lossy(line).into_owned(),
            details: format!("invalid UTF-8: {e}"),
        })?;
        let mut fields = text.splitn(3, '\t');
        let chrom_field = fields.next().unwrap_or_default();
        let pos_field = fields.next().unwrap_or_default();

        let chrom = Chromosome::parse(chrom_field).ok_or_else(|| SiteError::UnknownChromosome {
            path: input.to_path_buf(),
            line_number,
            chrom: chrom_field.to_string(),
        })?;
        let pos: u32 = pos_field.parse().map_err(|e| SiteError::Parse {
            path: input.to_path_buf(),
            line_number,
            line_content: text.to_string(),
            details: format!("position {pos_field:?} is not an integer: {e}"),
        })?;

        writeln!(out, "{text}\t{}", annotator.annotate(chrom, pos)).map_err(write_err)?;
        annotated += 1;
    }

    out.commit().map_err(write_err)?;
    info!("{annotated} variants annotated in {}", output.display());
    Ok(annotated)
}

/// What [`annotate_catalog`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotateReport {
    pub catalog: PathBuf,
    pub annotated: u64,
    pub up_to_date: bool,
}

/// Annotates the layout's unannotated catalog into the published `sites.tsv`, unless
/// that is already newer than both the catalog and the gene file.
pub fn annotate_catalog(config: &SiteConfig, genes_path: &Path) -> Result<AnnotateReport, SiteError> {
    let layout = config.layout();
    let input = layout.unannotated_catalog();
    let output = layout.annotated_catalog();

    if !config.force && is_up_to_date(&output, &[input.clone(), genes_path.to_path_buf()]) {
        info!("Gene annotations are up-to-date in {}", output.display());
        return Ok(AnnotateReport {
            catalog: output,
            annotated: 0,
            up_to_date: true,
        });
    }

    eprintln!("> Loading gene intervals from {}", genes_path.display());
    let annotator = GeneAnnotator::new(load_gene_intervals(genes_path)?);
    eprintln!("> Annotating {} with nearest genes.", input.display());
    let annotated = annotate_file(&input, &output, &layout.tmp_dir, &annotator)?;

    Ok(AnnotateReport {
        catalog: output,
        annotated,
        up_to_date: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn gene(chrom: &str, start: u32, end: u32, name: &str) -> GeneInterval {
        GeneInterval {
            chrom: Chromosome::parse(chrom).unwrap(),
            start,
            end,
            name: name.to_string(),
        }
    }

    fn chrom(label: &str) -> Chromosome {
        Chromosome::parse(label).unwrap()
    }

    #[test]
    fn positions_inside_a_gene_get_that_gene() {
        let annotator = GeneAnnotator::new(vec![gene("1", 100, 200, "G1")]);
        assert_eq!(annotator.annotate(chrom("1"), 150), "G1");
        assert_eq!(annotator.annotate(chrom("1"), 100), "G1");
    }

    #[test]
    fn overlapping_genes_are_joined_once_each() {
        let annotator = GeneAnnotator::new(vec![
            gene("2", 10, 50, "A"),
            gene("2", 20, 60, "B"),
            gene("2", 30, 40, "A"),
        ]);
        assert_eq!(annotator.annotate(chrom("2"), 35), "A,B");
    }

    #[test]
    fn between_genes_the_closer_one_wins() {
        let annotator = GeneAnnotator::new(vec![
            gene("1", 10, 40, "PRIOR"),
            gene("1", 70, 90, "NEXT"),
        ]);
        assert_eq!(annotator.annotate(chrom("1"), 50), "PRIOR");
        assert_eq!(annotator.annotate(chrom("1"), 65), "NEXT");
        assert_eq!(annotator.annotate(chrom("1"), 40), "PRIOR");
        assert_eq!(annotator.annotate(chrom("1"), 5), "PRIOR");
        assert_eq!(annotator.annotate(chrom("1"), 500), "NEXT");
    }

    #[test]
    fn equal_distances_go_to_the_downstream_gene() {
        let annotator = GeneAnnotator::new(vec![
            gene("3", 10, 40, "UP"),
            gene("3", 60, 90, "DOWN"),
        ]);
        assert_eq!(annotator.annotate(chrom("3"), 50), "DOWN");
    }

    #[test]
    fn mitochondrial_and_missing_chromosomes() {
        let annotator = GeneAnnotator::new(vec![gene("M", 1, 100, "MT-ND1")]);
        assert_eq!(annotator.annotate(chrom("MT"), 50), "MT-ND1");
        assert_eq!(annotator.annotate(chrom("7"), 50), "");
    }

    #[test]
    fn gene_files_reject_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("genes.bed");
        fs::write(&good, "1\t100\t200\tG1\textra\n\nX\t5\t9\tGX\n").unwrap();
        let genes = load_gene_intervals(&good).unwrap();
        assert_eq!(genes.len(), 2);
        assert_eq!(genes[1], gene("X", 5, 9, "GX"));

        for (name, row) in [
            ("mt", "MT\t1\t2\tG\n"),
            ("chr", "chr1\t1\t2\tG\n"),
            ("short", "1\t1\t2\n"),
            ("start", "1\tone\t2\tG\n"),
            ("order", "1\t9\t2\tG\n"),
        ] {
            let path = dir.path().join(name);
            fs::write(&path, row).unwrap();
            match load_gene_intervals(&path) {
                Err(SiteError::Parse { line_number, .. }) => assert_eq!(line_number, 1),
                other => panic!("{name}: unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn annotated_file_gains_one_column() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sites-unannotated.tsv");
        fs::write(
            &input,
            "chrom\tpos\tref\talt\n1\t150\tA\tG\n1\t150\tA\tG\n4\t7\tC\tT\n",
        )
        .unwrap();
        let output = dir.path().join("sites.tsv");
        let annotator = GeneAnnotator::new(vec![gene("1", 100, 200, "G1")]);

        let annotated = annotate_file(&input, &output, dir.path(), &annotator).unwrap();

        assert_eq!(annotated, 3);
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "chrom\tpos\tref\talt\tnearest_genes\n\
             1\t150\tA\tG\tG1\n\
             1\t150\tA\tG\tG1\n\
             4\t7\tC\tT\t\n"
        );
    }
}
