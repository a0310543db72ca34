//! Survey portal adapters: year discovery and download-link scraping, archive
//! classification, and record normalization for PLS CSV exports.

pub mod classify;
pub mod normalize;
pub mod portal;

pub use classify::{ArchiveClassifier, Classification, ClassifiedFiles, TableRole};
pub use normalize::{NormalizeError, NormalizedRecords, NormalizedYear, RecordNormalizer};
pub use portal::{PortalError, PortalLocator, PortalYearDiscoverer, YearSource};

pub const CRATE_NAME: &str = "pls-adapters";
