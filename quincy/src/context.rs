// SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Context as AnyhowContext, Result};
use directories::{BaseDirs, ProjectDirs};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

/// The name of the file which records the processed crash reports.
pub const STATE_FILE_NAME: &str = "processed.json";

/// Application context containing runtime environment information.
///
/// This struct captures all the environmental context needed at startup,
/// including the platform specific default locations. This allows for pure
/// validation and configuration phases without additional I/O operations.
#[derive(Debug, Clone)]
pub struct Context {
    /// Current working directory when the program was invoked
    pub current_directory: PathBuf,
    /// The environment variables which influence the run (logging, proxies)
    pub environment: HashMap<String, String>,
    /// Where the operating system deposits the crash reports
    pub diagnostic_directories: Vec<PathBuf>,
    /// Where the processed state is kept, when the configuration does not say otherwise
    pub state_file: Option<PathBuf>,
}

impl Context {
    /// Capture the current application context.
    ///
    /// This function performs I/O operations to gather system state and should
    /// be called early in the application lifecycle, before any validation phase.
    pub fn capture() -> Result<Self> {
        let current_directory =
            env::current_dir().with_context(|| "Failed to get current working directory")?;

        let environment = env::vars()
            .filter(|(key, _)| relevant_env(key))
            .collect::<HashMap<String, String>>();

        Ok(Context {
            current_directory,
            environment,
            diagnostic_directories: default_diagnostic_directories(),
            state_file: default_state_file(),
        })
    }
}

/// The directories where the crash reports are written by the system.
#[cfg(target_os = "macos")]
fn default_diagnostic_directories() -> Vec<PathBuf> {
    let mut directories = Vec::new();
    if let Some(base_dirs) = BaseDirs::new() {
        directories.push(base_dirs.home_dir().join("Library/Logs/DiagnosticReports"));
    }
    directories.push(PathBuf::from("/Library/Logs/DiagnosticReports"));
    directories
}

/// The directories where the crash reports are written by the system.
#[cfg(not(target_os = "macos"))]
fn default_diagnostic_directories() -> Vec<PathBuf> {
    BaseDirs::new()
        .map(|base_dirs| vec![base_dirs.data_local_dir().join("DiagnosticReports")])
        .unwrap_or_default()
}

fn default_state_file() -> Option<PathBuf> {
    ProjectDirs::from("net", "quincykit", "Quincy").map(|dirs| dirs.data_dir().join(STATE_FILE_NAME))
}

fn relevant_env(key: &str) -> bool {
    matches!(key, "HOME" | "RUST_LOG" | "NO_PROXY" | "no_proxy")
        || key.ends_with("_PROXY")
        || key.ends_with("_proxy")
        || key.starts_with("XDG_")
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Application Context:")?;
        writeln!(f, "Current Directory: {}", self.current_directory.display())?;
        writeln!(f, "Diagnostic Directories:")?;
        for directory in &self.diagnostic_directories {
            writeln!(f, "  {}", directory.display())?;
        }
        match &self.state_file {
            Some(path) => writeln!(f, "State File: {}", path.display())?,
            None => writeln!(f, "State File: unknown")?,
        }
        writeln!(f, "Relevant Environment Variables:")?;
        let mut keys: Vec<&String> = self.environment.keys().filter(|key| relevant_env(key)).collect();
        keys.sort();
        for key in keys {
            writeln!(f, "  {key}={}", self.environment[key])?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_capture() {
        let context = Context::capture().unwrap();

        assert!(context.current_directory.is_absolute());
        assert!(context.diagnostic_directories.iter().all(|directory| directory.is_absolute()));
        if let Some(state_file) = &context.state_file {
            assert!(state_file.ends_with(STATE_FILE_NAME));
        }
        assert!(context.environment.keys().all(|key| relevant_env(key)));
    }

    #[test]
    fn test_relevant_variables() {
        assert!(relevant_env("HTTPS_PROXY"));
        assert!(relevant_env("all_proxy"));
        assert!(relevant_env("NO_PROXY"));
        assert!(relevant_env("RUST_LOG"));
        assert!(!relevant_env("PATH"));
        assert!(!relevant_env("SECRET_TOKEN"));
    }

    #[test]
    fn test_display_format() {
        let context = Context {
            current_directory: PathBuf::from("/work"),
            environment: HashMap::from([
                ("RUST_LOG".to_string(), "debug".to_string()),
                ("HTTPS_PROXY".to_string(), "http://proxy:3128".to_string()),
                ("SECRET_TOKEN".to_string(), "hunter2".to_string()),
            ]),
            diagnostic_directories: vec![PathBuf::from("/reports")],
            state_file: None,
        };

        let display = format!("{context}");

        assert!(display.contains("Current Directory: /work"));
        assert!(display.contains("  /reports"));
        assert!(display.contains("State File: unknown"));
        assert!(display.contains("  HTTPS_PROXY=http://proxy:3128\n  RUST_LOG=debug"));
        assert!(!display.contains("hunter2"));
    }
}
