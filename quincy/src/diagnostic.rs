// SPDX-License-Identifier: GPL-3.0-or-later

//! The module defines the crash diagnostic, which is a single crash report
//! file deposited by the operating system.
//!
//! Diagnostics are read-only for this application. The file is never modified
//! or deleted, the only thing tracked about it is whether it was processed.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;
use std::{fs, io};

/// Matches the `Version:` header line of a classic crash report.
static VERSION_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Version:[ \t]*(\S.*?)[ \t]*$").expect("valid regex"));

/// The identity of a diagnostic, which is the file name of the report.
///
/// The same report can be visible from multiple directories, but those are
/// considered to be the same diagnostic.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosticId(String);

impl DiagnosticId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identity of a diagnostic file is its file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name().map(|name| Self(name.to_string_lossy().into_owned()))
    }
}

impl fmt::Display for DiagnosticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DiagnosticId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Represents a crash report file as it was found on the disk.
#[derive(Clone, Debug, PartialEq)]
pub struct CrashDiagnostic {
    pub id: DiagnosticId,
    pub path: PathBuf,
    /// The raw text of the report.
    pub content: String,
    /// When the report was written, taken from the file modification time.
    pub captured_at: SystemTime,
    /// The version of the crashed application, if the report mentions it.
    pub app_version: Option<String>,
}

impl CrashDiagnostic {
    /// Read the diagnostic from the given file.
    ///
    /// Crash reports are expected to be text, but invalid UTF-8 sequences
    /// are replaced rather than rejected.
    pub fn read(path: &Path) -> io::Result<Self> {
        let id = DiagnosticId::from_path(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("not a file: {}", path.display()))
        })?;
        let captured_at = fs::metadata(path)?.modified()?;
        let bytes = fs::read(path)?;
        let content = String::from_utf8_lossy(&bytes).into_owned();

        Ok(Self::from_content(id, path.to_path_buf(), content, captured_at))
    }

    pub fn from_content(
        id: DiagnosticId,
        path: PathBuf,
        content: String,
        captured_at: SystemTime,
    ) -> Self {
        let app_version = parse_app_version(&content);
        Self { id, path, content, captured_at, app_version }
    }
}

/// Extract the application version from the crash report text.
///
/// Two formats are recognized: the classic text report with a `Version:`
/// header line, and the JSON report where the first line is a JSON object
/// with an `app_version` attribute.
pub fn parse_app_version(content: &str) -> Option<String> {
    if let Some(first_line) = content.lines().next() {
        if let Ok(serde_json::Value::Object(header)) = serde_json::from_str(first_line) {
            if let Some(serde_json::Value::String(version)) = header.get("app_version") {
                return Some(version.clone());
            }
        }
    }
    VERSION_HEADER
        .captures(content)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CLASSIC_REPORT: &str = "\
Process:               Example [4242]
Path:                  /Applications/Example.app/Contents/MacOS/Example
Identifier:            com.example.app
Version:               1.4.2 (1402)
Code Type:             X86-64 (Native)

Exception Type:  EXC_BAD_ACCESS (SIGSEGV)
";

    #[test]
    fn test_version_from_classic_report() {
        assert_eq!(parse_app_version(CLASSIC_REPORT), Some("1.4.2 (1402)".to_string()));
    }

    #[test]
    fn test_version_from_json_report() {
        let content = r#"{"app_name":"Example","app_version":"2.0","bundleID":"com.example.app"}
{
  "uptime" : 1200
}"#;
        assert_eq!(parse_app_version(content), Some("2.0".to_string()));
    }

    #[test]
    fn test_version_missing() {
        assert_eq!(parse_app_version("Process: Example\nThread 0 crashed\n"), None);
        assert_eq!(parse_app_version(""), None);
    }

    #[test]
    fn test_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Example_2024-01-01-120000_host.crash");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(CLASSIC_REPORT.as_bytes()).unwrap();
        drop(file);

        let diagnostic = CrashDiagnostic::read(&path).unwrap();

        assert_eq!(diagnostic.id, DiagnosticId::from("Example_2024-01-01-120000_host.crash"));
        assert_eq!(diagnostic.path, path);
        assert_eq!(diagnostic.content, CLASSIC_REPORT);
        assert_eq!(diagnostic.app_version.as_deref(), Some("1.4.2 (1402)"));
    }

    #[test]
    fn test_read_tolerates_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Example_binary.crash");
        fs::write(&path, [b'o', b'k', 0xff, 0xfe, b'!']).unwrap();

        let diagnostic = CrashDiagnostic::read(&path).unwrap();

        assert!(diagnostic.content.starts_with("ok"));
        assert!(diagnostic.content.ends_with('!'));
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = CrashDiagnostic::read(&dir.path().join("missing.crash"));
        assert!(result.is_err());
    }
}
