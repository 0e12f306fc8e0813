use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use quake_core::RawRow;
use quake_storage::{CsvTable, PartitionStore, StoreError};
use quake_sync::{combine, discover_partitions, split_master, CombineRequest, Router};
use tempfile::tempdir;

fn row(ts: &str, lat: &str, lon: &str, depth: &str, mag: &str, location: &str) -> RawRow {
    RawRow::from_cells(&[ts, lat, lon, depth, mag, location]).unwrap()
}

fn generated_at() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 9, 2)
        .unwrap()
        .and_hms_opt(8, 15, 0)
        .unwrap()
}

fn request(inputs: Vec<PathBuf>, output_dir: &Path, label: &str) -> CombineRequest {
    CombineRequest {
        inputs,
        output_dir: output_dir.to_path_buf(),
        output_prefix: "quakes".to_string(),
        label: Some(label.to_string()),
        generated_at: generated_at(),
        parquet: false,
    }
}

fn seed_partitions(store: &PartitionStore) {
    Router::new(store).route(vec![
        row("01 September 2025 - 12:05 AM", "12.40", "125.10", "012", "2.3", "Sulat (Eastern Samar)"),
        row("31 August 2025 - 11:59 PM", "9.83", "126.31", "025", "2.1", "General Luna (Surigao Del Norte)"),
        row("11 August 2025 - 12:07 PM", "14.10", "121.00", "010", "4.5", "Calatagan (Batangas)"),
        row("02 July 2025 - 06:30 AM", "18.20", "120.60", "", "3.4", "Pagudpud (Ilocos Norte)"),
        row("15 December 2024 - 09:00 PM", "7.10", "126.80", "020", "5.2", "Baganga (Davao Oriental)"),
    ]);
}

fn identities(path: &Path) -> BTreeSet<(String, String, String, String)> {
    let table = CsvTable::read(path).unwrap();
    let col = |name| table.column(name);
    table
        .rows
        .iter()
        .map(|r| {
            (
                CsvTable::cell(r, col("Date-Time")).to_string(),
                CsvTable::cell(r, col("Latitude")).to_string(),
                CsvTable::cell(r, col("Longitude")).to_string(),
                CsvTable::cell(r, col("Magnitude")).to_string(),
            )
        })
        .collect()
}

#[test]
fn combine_writes_canonical_master_newest_first() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path().join("partitions"), "quakes");
    seed_partitions(&store);

    let inputs = discover_partitions(&store, None).unwrap();
    assert_eq!(inputs.len(), 4);
    let report = combine(&request(inputs, dir.path(), "all")).unwrap();

    assert_eq!(
        report.output_path.file_name().unwrap().to_string_lossy(),
        "quakes_complete_all_20250902_0815.csv"
    );
    assert!(report.summary_path.exists());
    assert_eq!(report.summary.total_records, 5);
    assert_eq!(report.duplicates_removed, 0);
    assert_eq!(report.summary.missing_depth, 1);

    let contents = std::fs::read_to_string(&report.output_path).unwrap();
    let mut lines = contents.lines();
    assert_eq!(
        lines.next(),
        Some("Date-Time,Latitude,Longitude,Depth,Magnitude,Location,Source_File")
    );
    assert_eq!(
        lines.next(),
        Some("2025-09-01 00:05:00,12.4,125.1,12,2.3,Sulat (Eastern Samar),quakes_2025_09.csv")
    );
    assert_eq!(lines.last().map(|l| l.starts_with("2024-12-15 21:00:00")), Some(true));
}

#[test]
fn combining_overlapping_sources_keeps_the_first_seen_copy() {
    let dir = tempdir().unwrap();
    let first = dir.path().join("first.csv");
    let second = dir.path().join("second.csv");
    std::fs::write(
        &first,
        "Date-Time,Latitude,Longitude,Depth,Magnitude,Location\n\
         11 August 2025 - 12:07 PM,14.10,121.00,010,4.5,Calatagan (Batangas)\n",
    )
    .unwrap();
    std::fs::write(
        &second,
        "Date-Time,Latitude,Longitude,Depth,Magnitude,Location\n\
         2025-08-11 12:07:00,14.1,121,10,4.5,Calatagan\n\
         2025-08-12 03:40:00,6.91,126.50,033,3.0,Manay (Davao Oriental)\n",
    )
    .unwrap();

    let report = combine(&request(vec![first, second], dir.path(), "overlap")).unwrap();

    assert_eq!(report.rows_before_dedup, 3);
    assert_eq!(report.semantic_duplicates, 1);
    assert_eq!(report.summary.total_records, 2);
    assert_eq!(report.summary.per_source["first.csv"], 1);
    let contents = std::fs::read_to_string(&report.output_path).unwrap();
    assert!(contents.contains("Calatagan (Batangas),first.csv"));
    assert!(!contents.contains("Calatagan,second.csv"));
}

#[test]
fn missing_and_unusable_inputs_are_skipped() {
    let dir = tempdir().unwrap();
    let good = dir.path().join("good.csv");
    let no_magnitude = dir.path().join("no_magnitude.csv");
    std::fs::write(
        &good,
        "Date-Time,Latitude,Longitude,Depth,Magnitude,Location\n\
         2025-08-12 03:40:00,6.91,126.50,033,3.0,Manay\n\
         2025-08-12 04:00:00,not-a-number,126.50,033,3.0,Manay\n\
         whenever,6.91,126.50,033,3.0,Manay\n",
    )
    .unwrap();
    std::fs::write(&no_magnitude, "Date-Time,Latitude,Longitude\n2025-08-12 03:40:00,1,2\n").unwrap();

    let report = combine(&request(
        vec![dir.path().join("absent.csv"), no_magnitude, good],
        dir.path(),
        "mixed",
    ))
    .unwrap();

    assert_eq!(report.skipped_files, 2);
    assert_eq!(report.summary.total_records, 1);
    let good_report = &report.files[2];
    assert_eq!(good_report.missing_required, 1);
    assert_eq!(good_report.unparseable, 1);
    assert_eq!(good_report.kept, 1);
}

#[test]
fn combine_fails_when_nothing_is_readable() {
    let dir = tempdir().unwrap();
    let err = combine(&request(vec![dir.path().join("absent.csv")], dir.path(), "none")).unwrap_err();
    assert!(err.to_string().contains("could be loaded"));
}

#[test]
fn split_then_combine_reproduces_the_year() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path().join("partitions"), "quakes");
    seed_partitions(&store);
    let master = combine(&request(discover_partitions(&store, None).unwrap(), dir.path(), "all"))
        .unwrap()
        .output_path;

    let rebuilt = PartitionStore::new(dir.path().join("rebuilt"), "quakes");
    let split = split_master(&master, 2025, &rebuilt).unwrap();

    assert_eq!(split.matched, 4);
    assert_eq!(split.other_years, 1);
    assert_eq!(split.files.len(), 3);
    assert!(split.failed_partitions.is_empty());
    let august = std::fs::read_to_string(dir.path().join("rebuilt/quakes_2025_08.csv")).unwrap();
    let mut lines = august.lines();
    assert_eq!(lines.next(), Some("Date-Time,Latitude,Longitude,Depth,Magnitude,Location"));
    assert!(lines.next().unwrap().starts_with("2025-08-11 12:07:00"));
    assert!(lines.next().unwrap().starts_with("2025-08-31 23:59:00"));

    let again = combine(&request(
        discover_partitions(&rebuilt, Some(2025)).unwrap(),
        dir.path(),
        "2025",
    ))
    .unwrap();
    let master_2025 = identities(&master)
        .into_iter()
        .filter(|(ts, ..)| ts.starts_with("2025"))
        .collect::<BTreeSet<_>>();
    assert_eq!(identities(&again.output_path), master_2025);
}

#[test]
fn split_for_a_year_with_no_rows_writes_nothing() {
    let dir = tempdir().unwrap();
    let master = dir.path().join("master.csv");
    std::fs::write(
        &master,
        "Date-Time,Latitude,Longitude,Depth,Magnitude,Location,Source_File\n\
         2025-08-11 12:07:00,14.1,121,10,4.5,Calatagan,quakes_2025_08.csv\n",
    )
    .unwrap();
    let store = PartitionStore::new(dir.path().join("out"), "quakes");

    let report = split_master(&master, 2024, &store).unwrap();

    assert_eq!(report.matched, 0);
    assert!(report.files.is_empty());
    assert!(store.list_partitions().unwrap().is_empty());
}

#[test]
fn split_errors_on_missing_master_or_date_column() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path(), "quakes");

    let missing = split_master(&dir.path().join("absent.csv"), 2025, &store).unwrap_err();
    assert!(matches!(missing, StoreError::SourceFileMissing { .. }));

    let dateless = dir.path().join("dateless.csv");
    std::fs::write(&dateless, "Latitude,Longitude\n1,2\n").unwrap();
    let err = split_master(&dateless, 2025, &store).unwrap_err();
    assert!(matches!(err, StoreError::NoDateColumn { .. }));
}

#[test]
fn split_drops_rows_with_unparseable_dates() {
    let dir = tempdir().unwrap();
    let master = dir.path().join("master.csv");
    std::fs::write(
        &master,
        "date_time,Latitude,Longitude,Magnitude\n\
         2025-03-01 10:00:00,1,2,3.1\n\
         garbage,1,2,3.1\n",
    )
    .unwrap();
    let store = PartitionStore::new(dir.path().join("out"), "quakes");

    let report = split_master(&master, 2025, &store).unwrap();

    assert_eq!(report.unparseable, 1);
    assert_eq!(report.columns, vec!["Date-Time", "Latitude", "Longitude", "Magnitude"]);
    assert_eq!(report.files.len(), 1);
}

#[test]
fn split_keeps_partition_rows_missing_from_the_master() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path().join("partitions"), "quakes");
    let august = dir.path().join("partitions/quakes_2025_08.csv");
    std::fs::create_dir_all(dir.path().join("partitions")).unwrap();
    std::fs::write(
        &august,
        "Date-Time,Latitude,Longitude,Depth,Magnitude,Location\n\
         2025-08-01 00:00:00,14.10,121.00,010,4.5,Calatagan (Batangas)\n\
         20 August 2025 - 01:00 PM,6.91,126.50,033,3.0,Manay (Davao Oriental)\n",
    )
    .unwrap();
    let master = dir.path().join("master.csv");
    std::fs::write(
        &master,
        "Date-Time,Latitude,Longitude,Depth,Magnitude,Location,Source_File\n\
         2025-08-01 00:00:00,14.1,121,10,4.5,Calatagan (Batangas),quakes_2025_08.csv\n",
    )
    .unwrap();

    let report = split_master(&master, 2025, &store).unwrap();

    assert!(report.failed_partitions.is_empty());
    assert_eq!(report.matched, 1);
    assert_eq!(report.carried_over, 1);
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].rows, 2);
    assert_eq!(report.files[0].carried_over, 1);
    let contents = std::fs::read_to_string(&august).unwrap();
    let lines = contents.lines().collect::<Vec<_>>();
    assert_eq!(
        lines,
        vec![
            "Date-Time,Latitude,Longitude,Depth,Magnitude,Location",
            "2025-08-01 00:00:00,14.1,121,10,4.5,Calatagan (Batangas)",
            "20 August 2025 - 01:00 PM,6.91,126.50,033,3.0,Manay (Davao Oriental)",
        ]
    );
}

#[test]
fn split_rewrites_a_partition_already_matching_the_master() {
    let dir = tempdir().unwrap();
    let store = PartitionStore::new(dir.path().join("partitions"), "quakes");
    seed_partitions(&store);
    let master = combine(&request(discover_partitions(&store, Some(2025)).unwrap(), dir.path(), "2025"))
        .unwrap()
        .output_path;

    let report = split_master(&master, 2025, &store).unwrap();

    assert_eq!(report.carried_over, 0);
    assert_eq!(report.files.len(), 3);
    let august = std::fs::read_to_string(dir.path().join("partitions/quakes_2025_08.csv")).unwrap();
    assert_eq!(august.lines().count(), 3);
    assert!(august.lines().nth(1).unwrap().starts_with("2025-08-11 12:07:00"));
}
