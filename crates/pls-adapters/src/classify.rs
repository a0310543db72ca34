//! Picks the library table and the outlet table out of an extracted survey
//! archive. File names and headers drift between survey years, so the
//! decision runs through an ordered list of strategies.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use pls_core::{LIBRARY_KEY_COLUMN, OUTLET_SEQ_COLUMN};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableRole {
    Library,
    Outlet,
}

/// One extracted CSV with the facts the strategies look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub header: Vec<String>,
}

impl CandidateFile {
    pub fn inspect(path: &Path) -> std::io::Result<Self> {
        let size = std::fs::metadata(path)?.len();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            size,
            header: read_header(path)?,
        })
    }

    fn has_column(&self, column: &str) -> bool {
        self.header.iter().any(|c| c == column)
    }
}

/// First line of a Latin-1 CSV, split into upper-cased column names.
pub fn read_header(path: &Path) -> std::io::Result<Vec<String>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    let line = line.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&line);
    let text: String = line.iter().map(|&b| b as char).collect();
    Ok(text
        .trim_end_matches(['\r', '\n'])
        .split(',')
        .map(|column| column.trim().trim_matches('"').trim().to_ascii_uppercase())
        .filter(|column| !column.is_empty())
        .collect())
}

/// Roles not yet assigned when a strategy runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRoles {
    pub library: bool,
    pub outlet: bool,
}

impl OpenRoles {
    pub fn contains(&self, role: TableRole) -> bool {
        match role {
            TableRole::Library => self.library,
            TableRole::Outlet => self.outlet,
        }
    }

    fn any(&self) -> bool {
        self.library || self.outlet
    }

    fn close(&mut self, role: TableRole) {
        match role {
            TableRole::Library => self.library = false,
            TableRole::Outlet => self.outlet = false,
        }
    }
}

pub trait ClassifierStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Proposed role per file, in preference order. Files the strategy has
    /// no opinion on are left out.
    fn propose(&self, remaining: &[&CandidateFile], open: OpenRoles) -> Vec<(PathBuf, TableRole)>;
}

pub struct FilenamePattern;

impl FilenamePattern {
    const OUTLET_PATTERNS: &'static [&'static str] = &["puout", "outlet"];
    const LIBRARY_PATTERNS: &'static [&'static str] = &["pupldf", "pupld", "library"];

    fn role_for(file_name: &str) -> Option<TableRole> {
        let lower = file_name.to_ascii_lowercase();
        if Self::OUTLET_PATTERNS.iter().any(|p| lower.contains(p)) {
            Some(TableRole::Outlet)
        } else if Self::LIBRARY_PATTERNS.iter().any(|p| lower.contains(p)) {
            Some(TableRole::Library)
        } else {
            None
        }
    }
}

impl ClassifierStrategy for FilenamePattern {
    fn name(&self) -> &'static str {
        "filename"
    }

    fn propose(&self, remaining: &[&CandidateFile], _open: OpenRoles) -> Vec<(PathBuf, TableRole)> {
        remaining
            .iter()
            .filter_map(|file| Self::role_for(&file.file_name).map(|role| (file.path.clone(), role)))
            .collect()
    }
}

pub struct HeaderInspection;

impl ClassifierStrategy for HeaderInspection {
    fn name(&self) -> &'static str {
        "header"
    }

    fn propose(&self, remaining: &[&CandidateFile], _open: OpenRoles) -> Vec<(PathBuf, TableRole)> {
        remaining
            .iter()
            .filter(|file| file.has_column(LIBRARY_KEY_COLUMN))
            .map(|file| {
                let role = if file.has_column(OUTLET_SEQ_COLUMN) {
                    TableRole::Outlet
                } else {
                    TableRole::Library
                };
                (file.path.clone(), role)
            })
            .collect()
    }
}

/// One row per library versus one row per branch: with exactly two
/// unexplained files, the smaller one is the library table.
pub struct SizeFallback;

impl ClassifierStrategy for SizeFallback {
    fn name(&self) -> &'static str {
        "size"
    }

    fn propose(&self, remaining: &[&CandidateFile], open: OpenRoles) -> Vec<(PathBuf, TableRole)> {
        if !(open.library && open.outlet) || remaining.len() != 2 {
            return Vec::new();
        }
        let (smaller, larger) = if remaining[0].size <= remaining[1].size {
            (remaining[0], remaining[1])
        } else {
            (remaining[1], remaining[0])
        };
        vec![
            (smaller.path.clone(), TableRole::Library),
            (larger.path.clone(), TableRole::Outlet),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFiles {
    pub library: PathBuf,
    pub outlet: Option<PathBuf>,
    /// Name of the strategy that assigned each role.
    pub library_tier: &'static str,
    pub outlet_tier: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Resolved(ClassifiedFiles),
    /// No library table could be identified.
    Unresolved { candidates: Vec<PathBuf> },
}

impl Classification {
    pub fn resolved(self) -> Option<ClassifiedFiles> {
        match self {
            Self::Resolved(files) => Some(files),
            Self::Unresolved { .. } => None,
        }
    }
}

pub struct ArchiveClassifier {
    strategies: Vec<Box<dyn ClassifierStrategy>>,
}

impl Default for ArchiveClassifier {
    fn default() -> Self {
        Self::new(vec![
            Box::new(FilenamePattern),
            Box::new(HeaderInspection),
            Box::new(SizeFallback),
        ])
    }
}

fn is_candidate(path: &Path) -> bool {
    let is_csv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    let resource_fork = path
        .components()
        .any(|c| c.as_os_str() == OsStr::new("__MACOSX"))
        || path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with("._"));
    is_csv && !resource_fork
}

impl ArchiveClassifier {
    pub fn new(strategies: Vec<Box<dyn ClassifierStrategy>>) -> Self {
        Self { strategies }
    }

    /// Unreadable files are dropped from consideration with a warning.
    pub fn classify_files(&self, paths: &[PathBuf]) -> Classification {
        let mut candidates: Vec<CandidateFile> = paths
            .iter()
            .filter(|path| is_candidate(path))
            .filter_map(|path| match CandidateFile::inspect(path) {
                Ok(file) => Some(file),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable csv");
                    None
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        self.classify_candidates(&candidates)
    }

    pub fn classify_candidates(&self, candidates: &[CandidateFile]) -> Classification {
        let mut open = OpenRoles {
            library: true,
            outlet: true,
        };
        let mut library: Option<(PathBuf, &'static str)> = None;
        let mut outlet: Option<(PathBuf, &'static str)> = None;

        for strategy in &self.strategies {
            if !open.any() {
                break;
            }
            let remaining: Vec<&CandidateFile> = candidates
                .iter()
                .filter(|file| {
                    library.as_ref().map_or(true, |(p, _)| *p != file.path)
                        && outlet.as_ref().map_or(true, |(p, _)| *p != file.path)
                })
                .collect();
            if remaining.is_empty() {
                break;
            }

            for (path, role) in strategy.propose(&remaining, open) {
                if !open.contains(role) {
                    continue;
                }
                debug!(strategy = strategy.name(), path = %path.display(), ?role, "classified");
                let slot = match role {
                    TableRole::Library => &mut library,
                    TableRole::Outlet => &mut outlet,
                };
                *slot = Some((path, strategy.name()));
                open.close(role);
            }
        }

        match library {
            Some((library, library_tier)) => {
                let (outlet, outlet_tier) = match outlet {
                    Some((path, tier)) => (Some(path), Some(tier)),
                    None => (None, None),
                };
                Classification::Resolved(ClassifiedFiles {
                    library,
                    outlet,
                    library_tier,
                    outlet_tier,
                })
            }
            None => Classification::Unresolved {
                candidates: candidates.iter().map(|c| c.path.clone()).collect(),
            },
        }
    }
}
