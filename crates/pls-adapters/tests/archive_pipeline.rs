use std::fs::File;
use std::io::Write;
use std::path::Path;

use pls_adapters::{NormalizedYear, RecordNormalizer};
use pls_storage::DataLayout;
use zip::write::SimpleFileOptions;

fn write_archive(path: &Path, entries: &[(&str, &str)]) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, body) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

#[test]
fn unlabeled_tables_are_classified_by_header_and_mapped() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    let archive = dir.path().join("pls_fy2021_csv.zip");
    write_archive(
        &archive,
        &[
            (
                "__MACOSX/._table_a.csv",
                "binary resource fork",
            ),
            (
                "table_a.csv",
                "FSCSKEY,FSCS_SEQ,LIBNAME,C_OUT_TY,SQ_FEET,HOURS,WKS_OPEN\n\
                 NY0773,001,Central Library,CE,\"120,000\",3276,52\n\
                 NY0773,002,Astoria,BR,-1,2080,52\n",
            ),
            (
                "table_b.csv",
                "FSCSKEY,LIBNAME,STABR,CIRCULATION,VISITS,TOTSTAFF\n\
                 NY0773,Queens Borough Public Library,NY,210000,175000,1523.5\n",
            ),
        ],
    );

    let result = RecordNormalizer::new(layout)
        .process_data_for_year(2021, &archive, None)
        .unwrap();
    let NormalizedYear::Records(records) = result else {
        panic!("expected records, got {result:?}");
    };

    assert!(records.library_source.ends_with("table_b.csv"));
    assert!(records
        .outlet_source
        .as_deref()
        .is_some_and(|p| p.ends_with("table_a.csv")));

    let library = &records.libraries[0];
    assert_eq!(library.library_id, "NY0773");
    assert_eq!(library.state.as_deref(), Some("NY"));
    assert_eq!(library.total_circulation, Some(210_000));
    assert_eq!(library.total_staff, Some(1523.5));

    assert_eq!(records.outlets.len(), 2);
    assert_eq!(records.outlets[0].square_feet, Some(120_000));
    assert_eq!(records.outlets[0].hours_per_week, Some(63.0));
    assert_eq!(records.outlets[1].square_feet, None);
}

#[test]
fn corrupt_archive_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("broken.zip");
    std::fs::write(&archive, b"this is not a zip").unwrap();

    let err = RecordNormalizer::new(DataLayout::new(dir.path()))
        .process_data_for_year(2021, &archive, None)
        .unwrap_err();
    assert!(err.to_string().contains("invalid archive"));
}
