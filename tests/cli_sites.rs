use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

fn sitemerge(data_dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_sitemerge"))
        .arg(args[0])
        .args(&args[1..])
        .arg("--data-dir")
        .arg(data_dir)
        .output()
        .expect("run sitemerge cli")
}

#[test]
fn run_builds_both_published_catalogs() {
    let tmp = tempdir().expect("temporary directory");
    let sources = tmp.path().join("sources");
    fs::create_dir_all(&sources).expect("create sources");
    fs::write(
        sources.join("height"),
        "chrom\tpos\tref\talt\tbeta\n1\t100\tA\tG\t0.1\nX\t20\tT\tC\t0.2\n",
    )
    .expect("write height");
    fs::write(
        sources.join("bmi"),
        "chrom\tpos\tref\talt\tbeta\n1\t100\tA\tC\t0.3\n",
    )
    .expect("write bmi");
    let genes = tmp.path().join("genes.bed");
    fs::write(&genes, "1\t50\t150\tG1\nX\t1\t10\tGX\n").expect("write genes");
    let data_dir = tmp.path().join("data");

    let output = sitemerge(
        &data_dir,
        &[
            "run",
            sources.to_str().expect("path str"),
            "--genes",
            genes.to_str().expect("path str"),
            "--num-procs",
            "2",
        ],
    );
    assert!(
        output.status.success(),
        "CLI failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let unannotated = fs::read_to_string(data_dir.join("sites").join("sites-unannotated.tsv"))
        .expect("unannotated catalog");
    assert_eq!(
        unannotated,
        "chrom\tpos\tref\talt\n1\t100\tA\tC\n1\t100\tA\tG\nX\t20\tT\tC\n"
    );
    let annotated =
        fs::read_to_string(data_dir.join("sites").join("sites.tsv")).expect("annotated catalog");
    assert_eq!(
        annotated,
        "chrom\tpos\tref\talt\tnearest_genes\n1\t100\tA\tC\tG1\n1\t100\tA\tG\tG1\nX\t20\tT\tC\tGX\n"
    );
    assert!(data_dir.join("cpra").join("height").exists());
    assert!(data_dir.join("cpra").join("bmi").exists());
}

#[test]
fn ordering_violations_exit_with_status_one() {
    let tmp = tempdir().expect("temporary directory");
    let data_dir = tmp.path().join("data");
    let cpra = data_dir.join("cpra");
    fs::create_dir_all(&cpra).expect("create cpra");
    fs::write(cpra.join("ok"), "chrom\tpos\tref\talt\n1\t1\tA\tG\n").expect("write ok");
    fs::write(
        cpra.join("unsorted"),
        "chrom\tpos\tref\talt\nY\t1\tA\tG\n4\t1\tA\tG\n",
    )
    .expect("write unsorted");

    let output = sitemerge(&data_dir, &["merge"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr was: {stderr}");
    assert!(stderr.contains("wrong order"), "stderr was: {stderr}");
    assert!(!data_dir.join("sites").join("sites-unannotated.tsv").exists());
}

#[test]
fn bad_batch_settings_are_configuration_errors() {
    let tmp = tempdir().expect("temporary directory");
    let output = sitemerge(tmp.path(), &["merge", "--batch-size", "2", "--min-batch", "3"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Configuration error"));
}

#[test]
fn annotate_without_a_gene_file_fails() {
    let tmp = tempdir().expect("temporary directory");
    let output = sitemerge(tmp.path(), &["annotate"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--genes"));
}

#[test]
fn an_unreadable_leaf_fails_the_merge_but_keeps_finished_work() {
    let tmp = tempdir().expect("temporary directory");
    let data_dir = tmp.path().join("data");
    let cpra = data_dir.join("cpra");
    fs::create_dir_all(&cpra).expect("create cpra");
    let mut leaves = Vec::new();
    for i in 1..=4 {
        let leaf = cpra.join(format!("pheno{i}"));
        fs::write(&leaf, format!("chrom\tpos\tref\talt\n{i}\t{i}\tA\tG\n")).expect("write leaf");
        leaves.push(leaf);
    }
    let unreadable = tmp.path().join("unreadable");
    fs::create_dir_all(&unreadable).expect("create directory leaf");
    leaves.push(unreadable);

    let mut args = vec!["merge", "--num-procs", "2", "--batch-size", "2", "--min-batch", "2"];
    args.extend(leaves.iter().map(|p| p.to_str().expect("path str")));
    let output = sitemerge(&data_dir, &args);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("merge tasks failed"), "stderr was: {stderr}");
    assert!(stderr.contains("unreadable"), "stderr was: {stderr}");
    assert!(!data_dir.join("sites").join("sites-unannotated.tsv").exists());

    let kept = fs::read_dir(data_dir.join("tmp"))
        .expect("tmp directory")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("merging-") && name.ends_with(".tsv.sources"))
        .count();
    assert!(kept > 0);
}
