use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use pls_core::{
    normalize_library_id, resolve_amount, resolve_coordinate, resolve_count, resolve_field,
    resolve_text, CollectionScope, LibraryRecord, OutletRecord, RawRecord, LIBRARY_KEY_COLUMN,
    OUTLET_SEQ_COLUMN,
};
use pls_storage::DataLayout;
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::classify::{ArchiveClassifier, Classification};

/// Column aliases, newest survey name first.
mod aliases {
    pub const NAME: &[&str] = &["LIBNAME"];
    pub const ADDRESS: &[&str] = &["ADDRESS", "ADDRES_M"];
    pub const CITY: &[&str] = &["CITY", "CITY_M"];
    pub const STATE: &[&str] = &["STABR", "STATE"];
    pub const ZIP: &[&str] = &["ZIP", "ZIP_M"];
    pub const COUNTY: &[&str] = &["CNTY", "COUNTY"];
    pub const PHONE: &[&str] = &["PHONE"];
    pub const LOCALE: &[&str] = &["LOCALE_ADD", "LOCALE_MOD", "LOCALE"];
    pub const LATITUDE: &[&str] = &["LATITUDE"];
    pub const LONGITUDE: &[&str] = &["LONGITUD", "LONGITUDE"];
    pub const POPULATION: &[&str] = &["POPU_LSA"];
    pub const CENTRAL: &[&str] = &["CENTLIB"];
    pub const BRANCHES: &[&str] = &["BRANLIB"];
    pub const BOOKMOBILES: &[&str] = &["BKMOB"];

    pub const PRINT_VOLUMES: &[&str] = &["BKVOL"];
    pub const EBOOKS: &[&str] = &["EBOOK", "EBOOKS"];
    pub const AUDIO_PHYSICAL: &[&str] = &["AUDIO_PH", "AUDIO"];
    pub const AUDIO_DIGITAL: &[&str] = &["AUDIO_DL"];
    pub const VIDEO_PHYSICAL: &[&str] = &["VIDEO_PH", "VIDEO"];
    pub const VIDEO_DIGITAL: &[&str] = &["VIDEO_DL"];
    pub const DATABASES: &[&str] = &["ELECCOLL", "DATABASE"];

    pub const TOTAL_CIRCULATION: &[&str] = &["TOTCIR", "CIRCULATION"];
    pub const KIDS_CIRCULATION: &[&str] = &["KIDCIRCL"];
    pub const PHYSICAL_CIRCULATION: &[&str] = &["PHYSCIR"];
    pub const ELECTRONIC_CIRCULATION: &[&str] = &["ELMATCIR"];
    pub const VISITS: &[&str] = &["VISITS"];
    pub const REFERENCE: &[&str] = &["REFERENC", "REFERENCE"];
    pub const REGISTERED_USERS: &[&str] = &["REGBOR"];
    pub const HOURS_OPEN: &[&str] = &["HRS_OPEN"];
    pub const PUBLIC_COMPUTERS: &[&str] = &["GPTERMS"];
    pub const COMPUTER_SESSIONS: &[&str] = &["PITUSR"];
    pub const WIFI_SESSIONS: &[&str] = &["WIFISESS"];
    pub const WEBSITE_VISITS: &[&str] = &["WEBVISIT"];

    pub const TOTAL_PROGRAMS: &[&str] = &["TOTPRO", "TOTPROG"];
    pub const KIDS_PROGRAMS: &[&str] = &["KIDPRO", "KIDPROG"];
    pub const YA_PROGRAMS: &[&str] = &["YAPRO", "YAPROG"];
    pub const PROGRAM_ATTENDANCE: &[&str] = &["TOTATTEN"];
    pub const KIDS_ATTENDANCE: &[&str] = &["KIDATTEN"];
    pub const YA_ATTENDANCE: &[&str] = &["YAATTEN"];

    pub const MLS_LIBRARIANS: &[&str] = &["MASTER"];
    pub const LIBRARIANS: &[&str] = &["LIBRARIA"];
    pub const OTHER_STAFF: &[&str] = &["OTHPAID"];
    pub const TOTAL_STAFF: &[&str] = &["TOTSTAFF"];

    pub const LOCAL_REVENUE: &[&str] = &["LOCGVT"];
    pub const STATE_REVENUE: &[&str] = &["STGVT"];
    pub const FEDERAL_REVENUE: &[&str] = &["FEDGVT"];
    pub const OTHER_REVENUE: &[&str] = &["OTHINCM"];
    pub const TOTAL_REVENUE: &[&str] = &["TOTINCM"];
    pub const SALARIES: &[&str] = &["SALARIES"];
    pub const BENEFITS: &[&str] = &["BENEFIT", "BENEFITS"];
    pub const STAFF_EXPENDITURES: &[&str] = &["STAFFEXP"];
    pub const PRINT_EXPENDITURES: &[&str] = &["PRMATEXP"];
    pub const ELECTRONIC_EXPENDITURES: &[&str] = &["ELMATEXP"];
    pub const OTHER_COLLECTION_EXPENDITURES: &[&str] = &["OTHMATEX"];
    pub const COLLECTION_EXPENDITURES: &[&str] = &["TOTEXPCO"];
    pub const OTHER_OPERATING_EXPENDITURES: &[&str] = &["OTHOPEXP"];
    pub const OPERATING_EXPENDITURES: &[&str] = &["TOTOPEXP"];
    pub const CAPITAL_REVENUE: &[&str] = &["CAP_REV"];
    pub const CAPITAL_EXPENDITURES: &[&str] = &["CAPITAL"];

    pub const OUTLET_TYPE: &[&str] = &["C_OUT_TY"];
    pub const SQUARE_FEET: &[&str] = &["SQ_FEET"];
    pub const HOURS_PER_YEAR: &[&str] = &["HOURS"];
    pub const WEEKS_OPEN: &[&str] = &["WKS_OPEN"];
    pub const OUTLET_BOOKMOBILES: &[&str] = &["L_NUM_BM", "BKMOB"];
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid archive {path}: {source}")]
    Archive {
        path: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("no library table identified among {} candidate file(s)", candidates.len())]
    Unclassified { candidates: Vec<PathBuf> },
    #[error("required column {column} missing from {path}")]
    MissingColumn { column: &'static str, path: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> NormalizeError + '_ {
    move |source| NormalizeError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecords {
    pub libraries: Vec<LibraryRecord>,
    pub outlets: Vec<OutletRecord>,
    pub library_source: PathBuf,
    pub outlet_source: Option<PathBuf>,
    /// Rows dropped because their key column was blank.
    pub skipped_blank_keys: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedYear {
    Records(NormalizedRecords),
    /// A scope was applied and none of its libraries appear in the table.
    NoMatchingLibraries {
        library_source: PathBuf,
        rows_scanned: usize,
    },
}

/// Header plus rows keyed by upper-cased column name.
#[derive(Debug, Clone, Default)]
pub struct CsvTable {
    pub columns: Vec<String>,
    pub rows: Vec<RawRecord>,
}

impl CsvTable {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Reads a Latin-1 CSV. Ragged rows are tolerated; missing trailing cells are
/// simply absent from the row map.
pub fn read_csv_table(path: &Path) -> Result<CsvTable, NormalizeError> {
    let csv_err = |source| NormalizeError::Csv {
        path: path.display().to_string(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_path(path)
        .map_err(csv_err)?;

    let columns: Vec<String> = reader
        .byte_headers()
        .map_err(csv_err)?
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let raw = if i == 0 {
                raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw)
            } else {
                raw
            };
            decode_latin1(raw).trim().to_ascii_uppercase()
        })
        .collect();

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record.map_err(csv_err)?;
        let row: RawRecord = columns
            .iter()
            .zip(record.iter())
            .filter(|(column, _)| !column.is_empty())
            .map(|(column, value)| (column.clone(), decode_latin1(value)))
            .collect();
        rows.push(row);
    }
    Ok(CsvTable { columns, rows })
}

/// Unpacks `archive` into a freshly cleared `dest`. Entries whose names would
/// escape `dest` are skipped.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>, NormalizeError> {
    let archive_err = |source| NormalizeError::Archive {
        path: archive.display().to_string(),
        source,
    };

    if dest.exists() {
        fs::remove_dir_all(dest).map_err(io_error(dest))?;
    }
    fs::create_dir_all(dest).map_err(io_error(dest))?;

    let file = File::open(archive).map_err(io_error(archive))?;
    let mut zip = ZipArchive::new(file).map_err(archive_err)?;
    let mut extracted = Vec::new();

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(archive_err)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping archive entry with unsafe path");
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let mut out = File::create(&target).map_err(io_error(&target))?;
        io::copy(&mut entry, &mut out).map_err(io_error(&target))?;
        extracted.push(target);
    }

    extracted.sort();
    debug!(archive = %archive.display(), files = extracted.len(), "archive extracted");
    Ok(extracted)
}

pub fn map_library(row: &RawRecord) -> Option<LibraryRecord> {
    use aliases::*;

    let library_id = resolve_field(row, &[LIBRARY_KEY_COLUMN]).map(normalize_library_id)?;
    Some(LibraryRecord {
        library_id,
        name: resolve_text(row, NAME),
        address: resolve_text(row, ADDRESS),
        city: resolve_text(row, CITY),
        state: resolve_text(row, STATE),
        zip: resolve_text(row, ZIP),
        county: resolve_text(row, COUNTY),
        phone: resolve_text(row, PHONE),
        locale: resolve_text(row, LOCALE),
        latitude: resolve_coordinate(row, LATITUDE),
        longitude: resolve_coordinate(row, LONGITUDE),
        population_lsa: resolve_count(row, POPULATION),
        central_libraries: resolve_count(row, CENTRAL),
        branch_libraries: resolve_count(row, BRANCHES),
        bookmobiles: resolve_count(row, BOOKMOBILES),

        print_volumes: resolve_count(row, PRINT_VOLUMES),
        ebook_volumes: resolve_count(row, EBOOKS),
        audio_physical: resolve_count(row, AUDIO_PHYSICAL),
        audio_digital: resolve_count(row, AUDIO_DIGITAL),
        video_physical: resolve_count(row, VIDEO_PHYSICAL),
        video_digital: resolve_count(row, VIDEO_DIGITAL),
        databases: resolve_count(row, DATABASES),

        total_circulation: resolve_count(row, TOTAL_CIRCULATION),
        kids_circulation: resolve_count(row, KIDS_CIRCULATION),
        physical_circulation: resolve_count(row, PHYSICAL_CIRCULATION),
        electronic_circulation: resolve_count(row, ELECTRONIC_CIRCULATION),
        visits: resolve_count(row, VISITS),
        reference_transactions: resolve_count(row, REFERENCE),
        registered_users: resolve_count(row, REGISTERED_USERS),
        hours_open: resolve_count(row, HOURS_OPEN),
        public_computers: resolve_count(row, PUBLIC_COMPUTERS),
        computer_sessions: resolve_count(row, COMPUTER_SESSIONS),
        wifi_sessions: resolve_count(row, WIFI_SESSIONS),
        website_visits: resolve_count(row, WEBSITE_VISITS),

        total_programs: resolve_count(row, TOTAL_PROGRAMS),
        kids_programs: resolve_count(row, KIDS_PROGRAMS),
        ya_programs: resolve_count(row, YA_PROGRAMS),
        program_attendance: resolve_count(row, PROGRAM_ATTENDANCE),
        kids_program_attendance: resolve_count(row, KIDS_ATTENDANCE),
        ya_program_attendance: resolve_count(row, YA_ATTENDANCE),

        mls_librarians: resolve_amount(row, MLS_LIBRARIANS),
        librarians: resolve_amount(row, LIBRARIANS),
        other_staff: resolve_amount(row, OTHER_STAFF),
        total_staff: resolve_amount(row, TOTAL_STAFF),

        local_revenue: resolve_amount(row, LOCAL_REVENUE),
        state_revenue: resolve_amount(row, STATE_REVENUE),
        federal_revenue: resolve_amount(row, FEDERAL_REVENUE),
        other_revenue: resolve_amount(row, OTHER_REVENUE),
        total_revenue: resolve_amount(row, TOTAL_REVENUE),
        salaries: resolve_amount(row, SALARIES),
        benefits: resolve_amount(row, BENEFITS),
        total_staff_expenditures: resolve_amount(row, STAFF_EXPENDITURES),
        print_expenditures: resolve_amount(row, PRINT_EXPENDITURES),
        electronic_expenditures: resolve_amount(row, ELECTRONIC_EXPENDITURES),
        other_collection_expenditures: resolve_amount(row, OTHER_COLLECTION_EXPENDITURES),
        total_collection_expenditures: resolve_amount(row, COLLECTION_EXPENDITURES),
        other_operating_expenditures: resolve_amount(row, OTHER_OPERATING_EXPENDITURES),
        total_operating_expenditures: resolve_amount(row, OPERATING_EXPENDITURES),
        capital_revenue: resolve_amount(row, CAPITAL_REVENUE),
        capital_expenditures: resolve_amount(row, CAPITAL_EXPENDITURES),
    })
}

pub fn map_outlet(row: &RawRecord) -> Option<OutletRecord> {
    use aliases::*;

    let library_id = resolve_field(row, &[LIBRARY_KEY_COLUMN]).map(normalize_library_id)?;
    let outlet_id = resolve_text(row, &[OUTLET_SEQ_COLUMN])?;
    let hours_per_year = resolve_count(row, HOURS_PER_YEAR);
    let weeks_open = resolve_count(row, WEEKS_OPEN);
    let hours_per_week = match (hours_per_year, weeks_open) {
        (Some(hours), Some(weeks)) if weeks > 0 => {
            Some((hours as f64 / weeks as f64 * 10.0).round() / 10.0)
        }
        _ => None,
    };

    Some(OutletRecord {
        library_id,
        outlet_id,
        name: resolve_text(row, NAME),
        outlet_type: resolve_text(row, OUTLET_TYPE),
        address: resolve_text(row, ADDRESS),
        city: resolve_text(row, CITY),
        state: resolve_text(row, STATE),
        zip: resolve_text(row, ZIP),
        county: resolve_text(row, COUNTY),
        phone: resolve_text(row, PHONE),
        latitude: resolve_coordinate(row, LATITUDE),
        longitude: resolve_coordinate(row, LONGITUDE),
        square_feet: resolve_count(row, SQUARE_FEET),
        hours_per_year,
        weeks_open,
        hours_per_week,
        bookmobiles: resolve_count(row, OUTLET_BOOKMOBILES),
    })
}

fn require_columns(
    table: &CsvTable,
    path: &Path,
    columns: &[&'static str],
) -> Result<(), NormalizeError> {
    match columns.iter().find(|column| !table.has_column(column)) {
        Some(column) => Err(NormalizeError::MissingColumn {
            column: *column,
            path: path.display().to_string(),
        }),
        None => Ok(()),
    }
}

/// Turns a survey archive into canonical library and outlet records.
pub struct RecordNormalizer {
    layout: DataLayout,
    classifier: ArchiveClassifier,
}

impl RecordNormalizer {
    pub fn new(layout: DataLayout) -> Self {
        Self::with_classifier(layout, ArchiveClassifier::default())
    }

    pub fn with_classifier(layout: DataLayout, classifier: ArchiveClassifier) -> Self {
        Self { layout, classifier }
    }

    /// Blocking: extracts into `processed/<year>/` and parses the CSVs.
    pub fn process_data_for_year(
        &self,
        year: i32,
        archive: &Path,
        scope: Option<&CollectionScope>,
    ) -> Result<NormalizedYear, NormalizeError> {
        let workdir = self.layout.processed_dir(year);
        let extracted = extract_archive(archive, &workdir)?;

        let files = match self.classifier.classify_files(&extracted) {
            Classification::Resolved(files) => files,
            Classification::Unresolved { candidates } => {
                return Err(NormalizeError::Unclassified { candidates });
            }
        };
        info!(
            year,
            library = %files.library.display(),
            library_tier = files.library_tier,
            outlet = ?files.outlet,
            "archive classified"
        );

        let library_table = read_csv_table(&files.library)?;
        require_columns(&library_table, &files.library, &[LIBRARY_KEY_COLUMN])?;

        let rows_scanned = library_table.rows.len();
        let mut skipped_blank_keys = 0usize;
        let mut libraries = Vec::new();
        for row in &library_table.rows {
            match map_library(row) {
                Some(record) if scope.map_or(true, |s| s.includes(&record.library_id)) => {
                    libraries.push(record)
                }
                Some(_) => {}
                None => skipped_blank_keys += 1,
            }
        }

        if scope.is_some() && libraries.is_empty() {
            warn!(year, rows_scanned, "no libraries in scope found in library table");
            return Ok(NormalizedYear::NoMatchingLibraries {
                library_source: files.library,
                rows_scanned,
            });
        }

        let mut outlets = Vec::new();
        if let Some(outlet_path) = &files.outlet {
            let outlet_table = read_csv_table(outlet_path)?;
            require_columns(
                &outlet_table,
                outlet_path,
                &[LIBRARY_KEY_COLUMN, OUTLET_SEQ_COLUMN],
            )?;
            for row in &outlet_table.rows {
                match map_outlet(row) {
                    Some(record) if scope.map_or(true, |s| s.includes(&record.library_id)) => {
                        outlets.push(record)
                    }
                    Some(_) => {}
                    None => skipped_blank_keys += 1,
                }
            }
        }

        info!(
            year,
            libraries = libraries.len(),
            outlets = outlets.len(),
            skipped_blank_keys,
            "records normalized"
        );
        Ok(NormalizedYear::Records(NormalizedRecords {
            libraries,
            outlets,
            library_source: files.library,
            outlet_source: files.outlet,
            skipped_blank_keys,
        }))
    }
}
