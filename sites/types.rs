// ========================================================================================
//                                 Shared variant types
// ========================================================================================
//
// Only types and constants used by more than one module belong here.

use std::fmt;
use std::io::{self, Write};

/// The reference chromosome ordering. A chromosome's rank is its index in this list.
pub const CHROM_ORDER: [&str; 25] = [
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "MT",
];

/// The four leading columns every variant file must start with.
pub const VARIANT_COLUMNS: [&str; 4] = ["chrom", "pos", "ref", "alt"];

/// The header line written at the top of every catalog file.
pub const VARIANT_HEADER: &str = "chrom\tpos\tref\talt";

/// A chromosome, stored as its rank in `CHROM_ORDER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chromosome(u8);

impl Chromosome {
    /// Resolves a chromosome label, accepting the numeric and `M` aliases.
    pub fn parse(label: &str) -> Option<Self> {
        let canonical = match label {
            "23" => "X",
            "24" => "Y",
            "25" | "M" => "MT",
            other => other,
        };
        CHROM_ORDER
            .iter()
            .position(|&name| name == canonical)
            .map(|rank| Chromosome(rank as u8))
    }

    #[inline]
    pub fn rank(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn label(self) -> &'static str {
        CHROM_ORDER[self.0 as usize]
    }
}

impl fmt::Display for Chromosome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The sort and merge unit of the whole system: chromosome, position, reference and
/// alternate allele. The derived ordering compares fields in declaration order, which
/// is exactly (chromosome rank, position, ref, alt).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariantKey {
    pub chrom: Chromosome,
    pub pos: u32,
    pub ref_allele: String,
    pub alt_allele: String,
}

impl VariantKey {
    pub fn new(chrom: Chromosome, pos: u32, ref_allele: &str, alt_allele: &str) -> Self {
        Self {
            chrom,
            pos,
            ref_allele: ref_allele.to_string(),
            alt_allele: alt_allele.to_string(),
        }
    }

    /// The (chromosome, position) pair that ordering is validated on.
    #[inline]
    pub fn locus(&self) -> (Chromosome, u32) {
        (self.chrom, self.pos)
    }

    /// Writes the key as one tab-delimited catalog row, including the newline.
    pub fn write_row<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            self.chrom, self.pos, self.ref_allele, self.alt_allele
        )
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.chrom, self.pos, self.ref_allele, self.alt_allele
        )
    }
}

/// True when `allele` is a non-empty string over the nucleotide alphabet plus `-`.
pub fn is_valid_allele(allele: &str) -> bool {
    !allele.is_empty()
        && allele
            .bytes()
            .all(|b| matches!(b, b'A' | b'C' | b'G' | b'T' | b'-'))
}

/// The expected chromosome order, formatted for diagnostics.
pub fn chrom_order_display() -> String {
    CHROM_ORDER.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromosome_aliases_resolve_to_reference_names() {
        assert_eq!(Chromosome::parse("23").unwrap().label(), "X");
        assert_eq!(Chromosome::parse("24").unwrap().label(), "Y");
        assert_eq!(Chromosome::parse("M").unwrap().label(), "MT");
        assert_eq!(Chromosome::parse("25").unwrap().label(), "MT");
        assert_eq!(Chromosome::parse("7").unwrap().rank(), 6);
        assert!(Chromosome::parse("chr1").is_none());
        assert!(Chromosome::parse("26").is_none());
    }

    #[test]
    fn variant_keys_order_by_rank_then_position_then_alleles() {
        let chr2 = Chromosome::parse("2").unwrap();
        let chr10 = Chromosome::parse("10").unwrap();
        let chr_x = Chromosome::parse("X").unwrap();

        let mut keys = vec![
            VariantKey::new(chr_x, 5, "A", "G"),
            VariantKey::new(chr10, 1, "A", "G"),
            VariantKey::new(chr2, 100, "C", "T"),
            VariantKey::new(chr2, 100, "A", "T"),
            VariantKey::new(chr2, 100, "A", "C"),
            VariantKey::new(chr2, 99, "T", "G"),
        ];
        keys.sort();

        let rendered: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "2-99-T-G",
                "2-100-A-C",
                "2-100-A-T",
                "2-100-C-T",
                "10-1-A-G",
                "X-5-A-G"
            ]
        );
    }

    #[test]
    fn allele_alphabet_is_enforced() {
        assert!(is_valid_allele("ACGT"));
        assert!(is_valid_allele("-"));
        assert!(!is_valid_allele(""));
        assert!(!is_valid_allele("acgt"));
        assert!(!is_valid_allele("N"));
    }

    #[test]
    fn rows_are_tab_delimited() {
        let key = VariantKey::new(Chromosome::parse("MT").unwrap(), 42, "A", "-");
        let mut out = Vec::new();
        key.write_row(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "MT\t42\tA\t-\n");
    }
}
