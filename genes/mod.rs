// ========================================================================================
//                                  Gene annotation
// ========================================================================================
//
// Maps every catalog position to the gene it falls in, or failing that, the closest
// gene on the same chromosome.

pub mod annotate;
pub mod bisect;
