// ========================================================================================
//
//                         Key streams and the ordering validator
//
// ========================================================================================
//
// A `KeyStreamReader` turns one sorted variant file into a lazy sequence of keys. A
// `ValidatedKeyStream` wraps it, enforces the global chromosome/position order and
// re-emits each (chromosome, position) group sorted by (ref, alt). Every stream that
// feeds the merge engine goes through both.

use crate::error::SiteError;
use crate::shared::files::{TextSource, open_text_source};
use crate::types::{Chromosome, VARIANT_COLUMNS, VariantKey, is_valid_allele};
use memchr::memchr;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Splits the first four tab-delimited fields off a line. Returns `None` when the
/// line has fewer than four columns.
fn leading_fields(line: &[u8]) -> Option<[&[u8]; 4]> {
    let mut fields: [&[u8]; 4] = [&[]; 4];
    let mut rest = line;
    for slot in fields.iter_mut().take(3) {
        let idx = memchr(b'\t', rest)?;
        *slot = &rest[..idx];
        rest = &rest[idx + 1..];
    }
    fields[3] = match memchr(b'\t', rest) {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    Some(fields)
}

/// Reads variant keys from one tab-delimited file whose header starts with
/// `chrom pos ref alt`. Columns after the fourth are ignored.
pub struct KeyStreamReader {
    source: Box<dyn TextSource>,
    path: PathBuf,
    line_number: u64,
    blank_line: Option<u64>,
}

impl KeyStreamReader {
    /// Opens `path` and checks its header. The header line is consumed.
    pub fn open(path: &Path) -> Result<Self, SiteError> {
        let mut source = open_text_source(path).map_err(|e| SiteError::io(path, e))?;

        let header_line = source
            .next_line()
            .map_err(|e| SiteError::io(path, e))?
            .ok_or_else(|| SiteError::EmptyFile {
                path: path.to_path_buf(),
            })?;
        let header_str = String::from_utf8_lossy(header_line).into_owned();
        let columns: Vec<&str> = header_str.split('\t').collect();

        if columns.len() < VARIANT_COLUMNS.len()
            || columns[..VARIANT_COLUMNS.len()] != VARIANT_COLUMNS[..]
        {
            return Err(SiteError::Header {
                path: path.to_path_buf(),
                found: header_str,
            });
        }

        Ok(Self {
            source,
            path: path.to_path_buf(),
            line_number: 1,
            blank_line: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_error(&self, line: &[u8], details: String) -> SiteError {
        SiteError::Parse {
            path: self.path.clone(),
            line_number: self.line_number,
            line_content: String::from_utf8_lossy(line).into_owned(),
            details,
        }
    }

    /// Returns the next key and the 1-based line number it was read from.
    pub fn next_key(&mut self) -> Result<Option<(VariantKey, u64)>, SiteError> {
        loop {
            let line = match self
                .source
                .next_line()
                .map_err(|e| SiteError::io(&self.path, e))?
            {
                Some(line) => line,
                None => return Ok(None),
            };
            self.line_number += 1;

            if line.is_empty() {
                if self.blank_line.is_none() {
                    self.blank_line = Some(self.line_number);
                }
                continue;
            }

            let line = line.to_vec();
            if let Some(blank) = self.blank_line {
                return Err(self.parse_error(
                    &line,
                    format!("blank line {blank} is followed by more records"),
                ));
            }
            let [chrom, pos, ref_allele, alt_allele] = match leading_fields(&line) {
                Some(fields) => fields,
                None => {
                    return Err(self.parse_error(
                        &line,
                        "expected at least 4 tab-delimited columns (chrom, pos, ref, alt)"
                            .to_string(),
                    ));
                }
            };

            let text = |field: &[u8], name: &str| -> Result<String, SiteError> {
                std::str::from_utf8(field)
                    .map(str::to_string)
                    .map_err(|e| self.parse_error(&line, format!("invalid UTF-8 in {name}: {e}")))
            };
            let chrom_str = text(chrom, "chrom")?;
            let pos_str = text(pos, "pos")?;
            let ref_str = text(ref_allele, "ref")?;
            let alt_str = text(alt_allele, "alt")?;

            let chromosome =
                Chromosome::parse(&chrom_str).ok_or_else(|| SiteError::UnknownChromosome {
                    path: self.path.clone(),
                    line_number: self.line_number,
                    chrom: chrom_str.clone(),
                })?;

            let position: u32 = pos_str.parse().map_err(|e| {
                self.parse_error(&line, format!("position {pos_str:?} is not an integer: {e}"))
            })?;
            if position == 0 {
                return Err(self.parse_error(&line, "position must be at least 1".to_string()));
            }

            for (allele, name) in [(&ref_str, "ref"), (&alt_str, "alt")] {
                if !is_valid_allele(allele) {
                    return Err(self.parse_error(
                        &line,
                        format!("{name} allele {allele:?} must only contain A, C, G, T or -"),
                    ));
                }
            }

            return Ok(Some((
                VariantKey {
                    chrom: chromosome,
                    pos: position,
                    ref_allele: ref_str,
                    alt_allele: alt_str,
                },
                self.line_number,
            )));
        }
    }
}

/// Wraps a `KeyStreamReader`, checking that chromosome rank never decreases and that
/// position never decreases within a chromosome. Keys sharing a (chromosome, position)
/// are buffered and re-emitted sorted by (ref, alt).
///
/// The first violation is yielded as an error and ends the stream.
pub struct ValidatedKeyStream {
    reader: KeyStreamReader,
    group: VecDeque<VariantKey>,
    lookahead: Option<(VariantKey, u64)>,
    previous: Option<(Chromosome, u32)>,
    finished: bool,
}

impl ValidatedKeyStream {
    pub fn new(reader: KeyStreamReader) -> Self {
        Self {
            reader,
            group: VecDeque::new(),
            lookahead: None,
            previous: None,
            finished: false,
        }
    }

    /// Opens `path` and wraps it in a validator.
    pub fn open(path: &Path) -> Result<Self, SiteError> {
        KeyStreamReader::open(path).map(Self::new)
    }

    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    fn check_order(&self, key: &VariantKey, line_number: u64) -> Result<(), SiteError> {
        let Some((previous_chrom, previous_pos)) = self.previous else {
            return Ok(());
        };
        if key.chrom < previous_chrom {
            return Err(SiteError::ChromosomeOrder {
                path: self.reader.path().to_path_buf(),
                line_number,
                chrom: key.chrom.label().to_string(),
                previous: previous_chrom.label().to_string(),
            });
        }
        if key.chrom == previous_chrom && key.pos < previous_pos {
            return Err(SiteError::PositionOrder {
                path: self.reader.path().to_path_buf(),
                line_number,
                chrom: key.chrom.label().to_string(),
                pos: key.pos,
                previous: previous_pos,
            });
        }
        Ok(())
    }

    /// Loads the next (chromosome, position) group. Returns false at end of input.
    fn fill_group(&mut self) -> Result<bool, SiteError> {
        let (first, line_number) = match self.lookahead.take() {
            Some(pending) => pending,
            None => match self.reader.next_key()? {
                Some(read) => read,
                None => return Ok(false),
            },
        };
        self.check_order(&first, line_number)?;

        let locus = first.locus();
        self.group.push_back(first);
        while let Some((key, line_number)) = self.reader.next_key()? {
            if key.locus() == locus {
                self.group.push_back(key);
            } else {
                self.lookahead = Some((key, line_number));
                break;
            }
        }

        if self.group.len() > 1 {
            self.group.make_contiguous().sort_unstable();
        }
        self.previous = Some(locus);
        Ok(true)
    }
}

impl Iterator for ValidatedKeyStream {
    type Item = Result<VariantKey, SiteError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(key) = self.group.pop_front() {
            return Some(Ok(key));
        }
        match self.fill_group() {
            Ok(true) => self.group.pop_front().map(Ok),
            Ok(false) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn keys_of(path: &Path) -> Result<Vec<String>, SiteError> {
        ValidatedKeyStream::open(path)?
            .map(|k| k.map(|k| k.to_string()))
            .collect()
    }

    #[test]
    fn ties_are_sorted_locally_but_never_across_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "pheno",
            "chrom\tpos\tref\talt\tpval\n\
             1\t72897673\tG\tT\t0.1\n\
             1\t72897673\tG\tA\t0.2\n\
             1\t72897673\tA\tC\t0.3\n\
             1\t72897700\tC\tA\t0.3\n\
             1\t72897700\tA\tT\t0.3\n\
             2\t5\tT\tA\t0.5\n",
        );
        assert_eq!(
            keys_of(&path).unwrap(),
            vec![
                "1-72897673-A-C",
                "1-72897673-G-A",
                "1-72897673-G-T",
                "1-72897700-A-T",
                "1-72897700-C-A",
                "2-5-T-A"
            ]
        );
    }

    #[test]
    fn chromosome_regression_is_reported_with_the_offending_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "bad",
            "chrom\tpos\tref\talt\nX\t10\tA\tG\n3\t10\tA\tG\n",
        );
        let err = keys_of(&path).unwrap_err();
        match &err {
            SiteError::ChromosomeOrder {
                line_number,
                chrom,
                previous,
                ..
            } => {
                assert_eq!(*line_number, 3);
                assert_eq!(chrom, "3");
                assert_eq!(previous, "X");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_fatal());
    }

    #[test]
    fn position_regression_within_a_chromosome_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "bad",
            "chrom\tpos\tref\talt\n1\t200\tA\tG\n1\t200\tA\tC\n1\t150\tA\tG\n",
        );
        match keys_of(&path).unwrap_err() {
            SiteError::PositionOrder {
                line_number,
                pos,
                previous,
                ..
            } => {
                assert_eq!(line_number, 4);
                assert_eq!(pos, 150);
                assert_eq!(previous, 200);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn the_stream_ends_after_its_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "bad",
            "chrom\tpos\tref\talt\n2\t1\tA\tG\n1\t1\tA\tG\n1\t2\tA\tG\n",
        );
        let mut stream = ValidatedKeyStream::open(&path).unwrap();
        assert!(stream.next().unwrap().is_ok());
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
    }

    #[test]
    fn header_must_start_with_the_variant_columns() {
        let dir = tempfile::tempdir().unwrap();
        let wrong_case = write_file(dir.path(), "a", "CHROM\tpos\tref\talt\n1\t1\tA\tG\n");
        let too_short = write_file(dir.path(), "b", "chrom\tpos\tref\n");
        let empty = write_file(dir.path(), "c", "");

        assert!(matches!(
            KeyStreamReader::open(&wrong_case),
            Err(SiteError::Header { .. })
        ));
        assert!(matches!(
            KeyStreamReader::open(&too_short),
            Err(SiteError::Header { .. })
        ));
        assert!(matches!(
            KeyStreamReader::open(&empty),
            Err(SiteError::EmptyFile { .. })
        ));
    }

    #[test]
    fn malformed_records_name_the_file_and_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "pheno",
            "chrom\tpos\tref\talt\n1\t10\tA\tG\n1\tten\tA\tG\n",
        );
        match keys_of(&path).unwrap_err() {
            SiteError::Parse {
                path: reported,
                line_number,
                line_content,
                ..
            } => {
                assert_eq!(reported, path);
                assert_eq!(line_number, 3);
                assert_eq!(line_content, "1\tten\tA\tG");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let short = write_file(dir.path(), "short", "chrom\tpos\tref\talt\n1\t10\tA\n");
        assert!(matches!(keys_of(&short), Err(SiteError::Parse { .. })));

        let zero = write_file(dir.path(), "zero", "chrom\tpos\tref\talt\n1\t0\tA\tG\n");
        assert!(matches!(keys_of(&zero), Err(SiteError::Parse { .. })));

        let chrom = write_file(dir.path(), "chrom", "chrom\tpos\tref\talt\nchr1\t5\tA\tG\n");
        assert!(matches!(
            keys_of(&chrom),
            Err(SiteError::UnknownChromosome { .. })
        ));
    }

    #[test]
    fn a_blank_line_before_more_records_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "gap",
            "chrom\tpos\tref\talt\n1\t5\tA\tG\n\n\n1\t9\tC\tT\n",
        );
        match keys_of(&path).unwrap_err() {
            SiteError::Parse {
                line_number,
                details,
                ..
            } => {
                assert_eq!(line_number, 5);
                assert!(details.contains("blank line 3"), "details were: {details}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn aliases_blank_lines_and_empty_bodies_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "aliases",
            "chrom\tpos\tref\talt\n22\t1\tA\tG\n23\t5\tA\tG\nM\t9\tC\t-\n\n",
        );
        assert_eq!(
            keys_of(&path).unwrap(),
            vec!["22-1-A-G", "X-5-A-G", "MT-9-C--"]
        );

        let header_only = write_file(dir.path(), "header_only", "chrom\tpos\tref\talt\tbeta\n");
        assert!(keys_of(&header_only).unwrap().is_empty());
    }
}
