// SPDX-License-Identifier: GPL-3.0-or-later

//! The module contains the diagnostic store, which is responsible to find the
//! crash reports on the disk and to remember which of them were processed.
//!
//! The store scans one or more directories where the operating system deposits
//! the crash reports. A report belongs to the application when the file name
//! starts with one of the configured prefixes and has one of the configured
//! extensions. The system names the `.crash` files `<App>_<date>_<host>.crash`
//! and the `.ips` files `<App>-<date>-<time>.ips`.
//!
//! The processed state is kept in a small JSON file (the ledger). The store
//! never deletes or modifies the crash report files themselves.

use crate::diagnostic::{CrashDiagnostic, DiagnosticId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use thiserror::Error;

/// Access to the pending crash reports of an application.
///
/// # Thread Safety
/// Implementers must be `Send + Sync`, the pipeline calls them from its worker thread.
pub trait DiagnosticStore: Send + Sync {
    /// Returns the diagnostics which are not yet processed.
    ///
    /// The sequence is ordered by capture time (oldest first) and never contains
    /// two entries with the same identity. Every call starts a fresh scan.
    fn list_pending(&self) -> Box<dyn Iterator<Item = CrashDiagnostic> + '_>;

    /// Records the diagnostic as processed. Recording it again is a no-op.
    fn mark_processed(&self, id: &DiagnosticId) -> Result<(), StoreError>;

    /// Excludes the diagnostic from the pending list of this store instance,
    /// without recording it as processed.
    fn defer(&self, id: &DiagnosticId);
}

/// Errors that can occur while recording the processed state.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to write state file '{path}': {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize state: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Describes where the crash reports of the application are.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagnosticsLocation {
    pub directories: Vec<PathBuf>,
    /// The file name prefixes of the application's reports.
    pub prefixes: Vec<String>,
    /// Accepted file extensions, without the leading dot.
    pub extensions: Vec<String>,
}

impl DiagnosticsLocation {
    /// The prefixes the system uses for the reports of the named application.
    pub fn default_prefixes(application: &str) -> Vec<String> {
        vec![format!("{application}_"), format!("{application}-")]
    }

    /// Checks if the file name looks like a crash report of the application.
    pub fn matches(&self, file_name: &str) -> bool {
        if !self.prefixes.iter().any(|prefix| file_name.starts_with(prefix.as_str())) {
            return false;
        }
        Path::new(file_name)
            .extension()
            .map(|extension| {
                let extension = extension.to_string_lossy();
                self.extensions.iter().any(|accepted| accepted.eq_ignore_ascii_case(&extension))
            })
            .unwrap_or(false)
    }
}

/// The content of the ledger file.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct Ledger {
    #[serde(default)]
    processed: BTreeMap<DiagnosticId, bool>,
}

impl Ledger {
    /// Load the ledger, or start with an empty one.
    ///
    /// A missing file is the normal state on the first run. A broken file is
    /// reported but does not stop the application.
    fn load(path: &Path) -> Self {
        match fs::File::open(path) {
            Ok(file) => match serde_json::from_reader(io::BufReader::new(file)) {
                Ok(ledger) => ledger,
                Err(error) => {
                    log::warn!("Ignoring unreadable state file {}: {error}", path.display());
                    Self::default()
                }
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                log::debug!("State file {} does not exist yet", path.display());
                Self::default()
            }
            Err(error) => {
                log::warn!("Failed to open state file {}: {error}", path.display());
                Self::default()
            }
        }
    }

    fn is_processed(&self, id: &DiagnosticId) -> bool {
        self.processed.get(id).copied().unwrap_or(false)
    }

    /// Write the ledger into a temporary file next to the target, and rename
    /// it over the target. Readers never see a half written file.
    fn persist(&self, path: &Path) -> Result<(), StoreError> {
        let persist_error = |source: io::Error| StoreError::Persist { path: path.to_path_buf(), source };

        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&directory).map_err(persist_error)?;

        let mut temporary = tempfile::NamedTempFile::new_in(&directory).map_err(persist_error)?;
        serde_json::to_writer_pretty(&mut temporary, self)?;
        temporary.flush().map_err(persist_error)?;
        temporary.persist(path).map_err(|error| persist_error(error.error))?;

        Ok(())
    }
}

/// A diagnostic file which was found during the scan, but not read yet.
struct Candidate {
    id: DiagnosticId,
    path: PathBuf,
    modified: SystemTime,
}

/// Diagnostic store backed by the file system.
pub struct FileDiagnosticStore {
    location: DiagnosticsLocation,
    state_file: PathBuf,
    ledger: Mutex<Ledger>,
    deferred: Mutex<HashSet<DiagnosticId>>,
}

impl FileDiagnosticStore {
    /// Create a store for the given location, with the processed state in `state_file`.
    pub fn new(location: DiagnosticsLocation, state_file: PathBuf) -> Self {
        let ledger = Ledger::load(&state_file);
        log::debug!(
            "Diagnostic store opened with {} processed entries from {}",
            ledger.processed.len(),
            state_file.display()
        );
        Self {
            location,
            state_file,
            ledger: Mutex::new(ledger),
            deferred: Mutex::new(HashSet::new()),
        }
    }

    pub fn location(&self) -> &DiagnosticsLocation {
        &self.location
    }

    pub fn is_processed(&self, id: &DiagnosticId) -> bool {
        lock(&self.ledger).is_processed(id)
    }

    /// Scan the directories for report files which are not excluded.
    ///
    /// Unreadable directories and entries are logged and skipped.
    fn scan(&self) -> Vec<Candidate> {
        let excluded: HashSet<DiagnosticId> = {
            let ledger = lock(&self.ledger);
            let deferred = lock(&self.deferred);
            ledger
                .processed
                .iter()
                .filter(|(_, processed)| **processed)
                .map(|(id, _)| id.clone())
                .chain(deferred.iter().cloned())
                .collect()
        };

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for directory in &self.location.directories {
            let entries = match fs::read_dir(directory) {
                Ok(entries) => entries,
                Err(error) => {
                    log::warn!("Failed to read diagnostics directory {}: {error}", directory.display());
                    continue;
                }
            };
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(error) => {
                        log::warn!("Failed to read entry in {}: {error}", directory.display());
                        continue;
                    }
                };
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if !self.location.matches(&file_name) {
                    continue;
                }
                let id = DiagnosticId::new(file_name);
                if excluded.contains(&id) || seen.contains(&id) {
                    continue;
                }
                let modified = match entry.metadata().and_then(|metadata| {
                    if metadata.is_file() {
                        metadata.modified()
                    } else {
                        Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"))
                    }
                }) {
                    Ok(modified) => modified,
                    Err(error) => {
                        log::debug!("Skipping {}: {error}", entry.path().display());
                        continue;
                    }
                };
                seen.insert(id.clone());
                candidates.push(Candidate { id, path: entry.path(), modified });
            }
        }

        candidates.sort_by(|left, right| {
            left.modified.cmp(&right.modified).then_with(|| left.id.cmp(&right.id))
        });
        candidates
    }
}

impl DiagnosticStore for FileDiagnosticStore {
    fn list_pending(&self) -> Box<dyn Iterator<Item = CrashDiagnostic> + '_> {
        let candidates = self.scan();
        log::debug!("Found {} pending diagnostic files", candidates.len());

        Box::new(candidates.into_iter().filter_map(|candidate| {
            match CrashDiagnostic::read(&candidate.path) {
                Ok(diagnostic) => Some(diagnostic),
                Err(error) => {
                    log::warn!("Failed to read diagnostic {}: {error}", candidate.id);
                    None
                }
            }
        }))
    }

    fn mark_processed(&self, id: &DiagnosticId) -> Result<(), StoreError> {
        let mut ledger = lock(&self.ledger);
        if ledger.is_processed(id) {
            log::debug!("Diagnostic {id} is already processed");
            return Ok(());
        }
        // The entry stays in memory even if the write fails, so this process
        // does not offer it again.
        ledger.processed.insert(id.clone(), true);
        log::debug!("Diagnostic {id} marked as processed");
        ledger.persist(&self.state_file)
    }

    fn defer(&self, id: &DiagnosticId) {
        lock(&self.deferred).insert(id.clone());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn location(directories: Vec<PathBuf>) -> DiagnosticsLocation {
        DiagnosticsLocation {
            directories,
            prefixes: DiagnosticsLocation::default_prefixes("Example"),
            extensions: vec!["crash".into(), "ips".into()],
        }
    }

    fn write_report(directory: &Path, name: &str, age: Duration) -> PathBuf {
        let path = directory.join(name);
        fs::write(&path, format!("Process: Example\nVersion: 1.0\nreport {name}\n")).unwrap();
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    fn pending_ids(store: &FileDiagnosticStore) -> Vec<String> {
        store.list_pending().map(|diagnostic| diagnostic.id.to_string()).collect()
    }

    #[test]
    fn test_location_matching() {
        let location = location(vec![]);

        assert!(location.matches("Example_2024-01-01_host.crash"));
        assert!(location.matches("Example_2024-01-01_host.IPS"));
        assert!(!location.matches("Other_2024-01-01_host.crash"));
        assert!(!location.matches("Example_2024-01-01_host.log"));
        assert!(!location.matches("Example_no_extension"));
        assert!(location.matches("Example-2024-05-01-101010.ips"));
        assert!(!location.matches("ExampleHelper-2024-05-01-101010.ips"));
    }

    #[test]
    fn test_lists_both_report_naming_schemes() {
        let reports = TempDir::new().unwrap();
        write_report(reports.path(), "Example_2024-05-01-101010_host.crash", Duration::from_secs(20));
        let modern = reports.path().join("Example-2024-05-01-101010.ips");
        fs::write(&modern, "{\"app_name\":\"Example\",\"app_version\":\"2.0\"}\n{\"crashed\":true}\n").unwrap();

        let state = TempDir::new().unwrap();
        let store = FileDiagnosticStore::new(
            location(vec![reports.path().to_path_buf()]),
            state.path().join("state.json"),
        );

        let pending: Vec<CrashDiagnostic> = store.list_pending().collect();
        let ids: Vec<&str> = pending.iter().map(|diagnostic| diagnostic.id.as_str()).collect();
        assert_eq!(ids, vec!["Example_2024-05-01-101010_host.crash", "Example-2024-05-01-101010.ips"]);
        assert_eq!(pending[1].app_version.as_deref(), Some("2.0"));
    }

    #[test]
    fn test_lists_reports_ordered_by_capture_time() {
        let reports = TempDir::new().unwrap();
        write_report(reports.path(), "Example_b.crash", Duration::from_secs(10));
        write_report(reports.path(), "Example_a.crash", Duration::from_secs(20));
        write_report(reports.path(), "Example_c.ips", Duration::from_secs(30));
        write_report(reports.path(), "Other_d.crash", Duration::from_secs(40));

        let state = TempDir::new().unwrap();
        let store = FileDiagnosticStore::new(
            location(vec![reports.path().to_path_buf()]),
            state.path().join("state.json"),
        );

        assert_eq!(pending_ids(&store), vec!["Example_c.ips", "Example_a.crash", "Example_b.crash"]);
    }

    #[test]
    fn test_same_report_in_two_directories_is_listed_once() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write_report(first.path(), "Example_a.crash", Duration::from_secs(10));
        write_report(second.path(), "Example_a.crash", Duration::from_secs(5));
        write_report(second.path(), "Example_b.crash", Duration::from_secs(1));

        let state = TempDir::new().unwrap();
        let store = FileDiagnosticStore::new(
            location(vec![first.path().to_path_buf(), second.path().to_path_buf()]),
            state.path().join("state.json"),
        );

        assert_eq!(pending_ids(&store), vec!["Example_a.crash", "Example_b.crash"]);
    }

    #[test]
    fn test_unreadable_directory_gives_empty_list() {
        let state = TempDir::new().unwrap();
        let store = FileDiagnosticStore::new(
            location(vec![PathBuf::from("/nonexistent/diagnostic/reports")]),
            state.path().join("state.json"),
        );

        assert_eq!(store.list_pending().count(), 0);
    }

    #[test]
    fn test_mark_processed_is_idempotent() {
        let reports = TempDir::new().unwrap();
        write_report(reports.path(), "Example_a.crash", Duration::from_secs(10));
        write_report(reports.path(), "Example_b.crash", Duration::from_secs(5));

        let state = TempDir::new().unwrap();
        let store = FileDiagnosticStore::new(
            location(vec![reports.path().to_path_buf()]),
            state.path().join("state.json"),
        );

        store.mark_processed(&DiagnosticId::from("Example_a.crash")).unwrap();
        let once = pending_ids(&store);
        store.mark_processed(&DiagnosticId::from("Example_a.crash")).unwrap();
        let twice = pending_ids(&store);

        assert_eq!(once, vec!["Example_b.crash"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_processed_state_survives_restart() {
        let reports = TempDir::new().unwrap();
        write_report(reports.path(), "Example_a.crash", Duration::from_secs(10));
        write_report(reports.path(), "Example_b.crash", Duration::from_secs(5));

        let state = TempDir::new().unwrap();
        let state_file = state.path().join("nested").join("state.json");
        {
            let store =
                FileDiagnosticStore::new(location(vec![reports.path().to_path_buf()]), state_file.clone());
            store.mark_processed(&DiagnosticId::from("Example_b.crash")).unwrap();
        }

        let store = FileDiagnosticStore::new(location(vec![reports.path().to_path_buf()]), state_file);
        assert!(store.is_processed(&DiagnosticId::from("Example_b.crash")));
        assert_eq!(pending_ids(&store), vec!["Example_a.crash"]);
    }

    #[test]
    fn test_broken_state_file_is_treated_as_empty() {
        let reports = TempDir::new().unwrap();
        write_report(reports.path(), "Example_a.crash", Duration::from_secs(10));

        let state = TempDir::new().unwrap();
        let state_file = state.path().join("state.json");
        fs::write(&state_file, "{ this is not json").unwrap();

        let store = FileDiagnosticStore::new(location(vec![reports.path().to_path_buf()]), state_file.clone());
        assert_eq!(pending_ids(&store), vec!["Example_a.crash"]);

        store.mark_processed(&DiagnosticId::from("Example_a.crash")).unwrap();
        let content = fs::read_to_string(&state_file).unwrap();
        let ledger: Ledger = serde_json::from_str(&content).unwrap();
        assert!(ledger.is_processed(&DiagnosticId::from("Example_a.crash")));
    }

    #[test]
    fn test_deferred_reports_are_not_persisted() {
        let reports = TempDir::new().unwrap();
        write_report(reports.path(), "Example_a.crash", Duration::from_secs(10));

        let state = TempDir::new().unwrap();
        let state_file = state.path().join("state.json");
        let store = FileDiagnosticStore::new(location(vec![reports.path().to_path_buf()]), state_file.clone());

        store.defer(&DiagnosticId::from("Example_a.crash"));
        assert!(pending_ids(&store).is_empty());
        assert!(!state_file.exists());

        let store = FileDiagnosticStore::new(location(vec![reports.path().to_path_buf()]), state_file);
        assert_eq!(pending_ids(&store), vec!["Example_a.crash"]);
    }

    #[test]
    fn test_listing_is_restartable() {
        let reports = TempDir::new().unwrap();
        write_report(reports.path(), "Example_a.crash", Duration::from_secs(10));

        let state = TempDir::new().unwrap();
        let store = FileDiagnosticStore::new(
            location(vec![reports.path().to_path_buf()]),
            state.path().join("state.json"),
        );

        assert_eq!(pending_ids(&store), pending_ids(&store));

        write_report(reports.path(), "Example_b.crash", Duration::from_secs(1));
        assert_eq!(pending_ids(&store), vec!["Example_a.crash", "Example_b.crash"]);
    }
}
