use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

const VCF: &str = "##fileformat=VCFv4.2\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tc1\tc2\tc3\tc4\tk1\tk2\tk3\tk4\n\
6\t30018537\tAA_A_9_30018537_FS\tA\tT\t.\tPASS\t.\tGT\t0/1\t0/1\t0/1\t0/0\t0/1\t0/0\t0/0\t0/0\n\
6\t30019000\trs2\tC\tG\t.\tPASS\t.\tGT:DP\t0|1:10\t1|1:12\t0|0:9\t0|1:11\t0|0:8\t0|0:7\t./.:0\t0|1:14\n";

const LABELS: &str = "c1\tcase\nc2\tcase\nc3\tcase\nc4\tcase\nk1\tctrl\nk2\tctrl\nk3\tctrl\nk4\tctrl\n";

fn write_inputs(dir: &Path) {
    fs::write(dir.join("cohort.vcf"), VCF).expect("write vcf");
    fs::write(dir.join("labels.tsv"), LABELS).expect("write labels");
}

fn segscore(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_segscore"))
        .current_dir(dir)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("run segscore cli")
}

#[test]
fn segregate_then_score_writes_both_outputs() {
    let tmp = tempdir().expect("temporary directory");
    write_inputs(tmp.path());

    let output = segscore(
        tmp.path(),
        &[
            "segregate",
            "cohort.vcf",
            "--labels",
            "labels.tsv",
            "--out",
            "cohort.seg",
        ],
    );
    assert!(output.status.success(), "segregate failed: {output:?}");
    assert!(output.stdout.is_empty(), "records must go to --out only");

    let records = fs::read_to_string(tmp.path().join("cohort.seg")).expect("read records");
    let lines: Vec<&str> = records.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("6\t30018537\tAA_A_9_30018537_FS\tA/A|A/T\t"));
    let phased: Vec<&str> = lines[1].split('\t').collect();
    assert_eq!(phased[5], "1", "one no-call at rs2");

    let output = segscore(
        tmp.path(),
        &[
            "score",
            "cohort.seg",
            "cohort.vcf",
            "--labels",
            "labels.tsv",
            "--out",
            "scores.tsv",
        ],
    );
    assert!(output.status.success(), "score failed: {output:?}");

    let scores = fs::read_to_string(tmp.path().join("scores.tsv")).expect("read scores");
    let mut rows = scores.lines();
    assert_eq!(rows.next(), Some("sample\tlabel\tscore"));
    let rows: Vec<Vec<&str>> = rows.map(|row| row.split('\t').collect()).collect();
    assert_eq!(rows.len(), 8);
    assert_eq!(rows[0][..2], ["c1", "case"]);
    assert_eq!(rows[7][..2], ["k4", "ctrl"]);
    for row in &rows {
        row[2].parse::<f64>().expect("numeric score");
    }
}

#[test]
fn list_command_writes_header_and_records() {
    let tmp = tempdir().expect("temporary directory");
    write_inputs(tmp.path());
    let list = "6\tv1\tAA\tc1\tc1\n\
6\tv1\tAP\tc2\tc2\tc3\tc3\tk1\tk1\n\
6\tv1\tPP\tc4\tc4\tk2\tk2\tk3\tk3\n\
6\tv1\t00\tk4\tk4\n";
    fs::write(tmp.path().join("calls.list"), list).expect("write list");

    let output = segscore(tmp.path(), &["list", "calls.list", "--labels", "labels.tsv"]);
    assert!(output.status.success(), "list failed: {output:?}");

    let stdout = String::from_utf8(output.stdout).expect("utf8 stdout");
    let mut lines = stdout.lines();
    assert!(lines.next().expect("header").starts_with("Contig\tID\tHET\t"));
    let record: Vec<&str> = lines.next().expect("record").split('\t').collect();
    assert_eq!(record[..3], ["6", "v1", "AP"]);
    assert_eq!(lines.next(), None);
}

#[test]
fn invalid_region_fails_without_touching_the_output() {
    let tmp = tempdir().expect("temporary directory");
    write_inputs(tmp.path());

    let output = segscore(
        tmp.path(),
        &[
            "segregate",
            "cohort.vcf",
            "--labels",
            "labels.tsv",
            "--regions",
            "6:300-200",
            "--out",
            "cohort.seg",
        ],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr was: {stderr}");
    assert!(!tmp.path().join("cohort.seg").exists());
}

#[test]
fn missing_vcf_is_reported() {
    let tmp = tempdir().expect("temporary directory");
    write_inputs(tmp.path());

    let output = segscore(
        tmp.path(),
        &["segregate", "absent.vcf", "--labels", "labels.tsv"],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("absent.vcf"));
}
