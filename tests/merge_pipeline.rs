use std::fs;
use std::path::{Path, PathBuf};

use sitemerge::config::SiteConfig;
use sitemerge::coordinator::MergeCoordinator;
use sitemerge::error::SiteError;
use sitemerge::extract::{discover_sources, extract_all};
use sitemerge::genes::annotate::annotate_catalog;

use tempfile::tempdir;

fn config_for(data_dir: &Path, workers: usize) -> SiteConfig {
    SiteConfig {
        data_dir: data_dir.to_path_buf(),
        num_procs: Some(workers),
        batch_size: 3,
        min_batch: 2,
        ..SiteConfig::default()
    }
}

fn write_source(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("chrom\tpos\tref\talt\tpval\n{body}")).expect("write source");
    path
}

#[test]
fn three_sources_become_one_annotated_catalog() {
    let tmp = tempdir().expect("temporary directory");
    let sources = tmp.path().join("pheno");
    fs::create_dir_all(&sources).expect("create source dir");
    write_source(&sources, "a", "1\t100\tA\tG\t0.01\n");
    write_source(&sources, "b", "1\t100\tA\tG\t0.2\n1\t150\tC\tT\t0.3\n");
    write_source(&sources, "c", "2\t10\tG\tC\t0.04\n");
    let genes = tmp.path().join("genes.bed");
    fs::write(&genes, "1\t90\t120\tGENE1\n2\t50\t80\tGENE2\n").expect("write genes");

    let config = config_for(&tmp.path().join("data"), 2);
    let found = discover_sources(&[sources]).expect("discover");
    let extracted = extract_all(&found, &config).expect("extract");
    let merged = MergeCoordinator::new(&config)
        .expect("valid config")
        .run(&extracted.leaves)
        .expect("merge");
    assert_eq!(
        fs::read_to_string(&merged.catalog).expect("read catalog"),
        "chrom\tpos\tref\talt\n1\t100\tA\tG\n1\t100\tA\tG\n1\t150\tC\tT\n2\t10\tG\tC\n"
    );

    let annotated = annotate_catalog(&config, &genes).expect("annotate");
    assert_eq!(annotated.annotated, 4);
    assert_eq!(
        fs::read_to_string(&annotated.catalog).expect("read annotated"),
        "chrom\tpos\tref\talt\tnearest_genes\n\
         1\t100\tA\tG\tGENE1\n\
         1\t100\tA\tG\tGENE1\n\
         1\t150\tC\tT\tGENE1\n\
         2\t10\tG\tC\tGENE2\n"
    );

    let again = annotate_catalog(&config, &genes).expect("annotate again");
    assert!(again.up_to_date);
}

#[test]
fn many_leaves_merge_to_the_same_catalog_for_any_pool_shape() {
    let tmp = tempdir().expect("temporary directory");
    let sources = tmp.path().join("pheno");
    fs::create_dir_all(&sources).expect("create source dir");
    for i in 0..25u32 {
        let body: String = (0..4u32)
            .map(|j| format!("{}\t{}\tA\tC\t0.5\n", 1 + j, 1000 * (i % 5) + j + 1))
            .collect();
        write_source(&sources, &format!("pheno{i}"), &body);
    }
    let found = discover_sources(&[sources]).expect("discover");

    let mut catalogs = Vec::new();
    for (run, workers) in [1usize, 3, 6].into_iter().enumerate() {
        let mut config = config_for(&tmp.path().join(format!("data{run}")), workers);
        config.batch_size = 2 + run * 3;
        let leaves = extract_all(&found, &config).expect("extract").leaves;
        let report = MergeCoordinator::new(&config)
            .expect("valid config")
            .run(&leaves)
            .expect("merge");
        catalogs.push(fs::read_to_string(&report.catalog).expect("read catalog"));
    }

    assert_eq!(catalogs[0].lines().count(), 1 + 25 * 4);
    assert_eq!(catalogs[0], catalogs[1]);
    assert_eq!(catalogs[0], catalogs[2]);
}

#[test]
fn an_out_of_order_source_fails_extraction_by_name() {
    let tmp = tempdir().expect("temporary directory");
    let good = write_source(tmp.path(), "good", "1\t5\tA\tG\t0.1\n");
    let bad = write_source(tmp.path(), "bad", "1\t9\tA\tG\t0.1\n1\t3\tA\tG\t0.1\n");

    let config = config_for(&tmp.path().join("data"), 2);
    match extract_all(&[good, bad], &config) {
        Err(SiteError::ExtractionFailed { failed, total }) => {
            assert_eq!(failed, vec!["bad".to_string()]);
            assert_eq!(total, 2);
        }
        other => panic!("expected an extraction failure, got {other:?}"),
    }
}
