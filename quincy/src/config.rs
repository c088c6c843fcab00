// SPDX-License-Identifier: GPL-3.0-or-later

//! This module defines the configuration of the application.
//!
//! The configuration is either loaded from a file or used with default
//! values, which are defined in the code.
//!
//! The configuration file syntax is based on the YAML format.
//! The default configuration file name is `quincy.yml`.
//!
//! The configuration file location is searched in the following order:
//! 1. The current working directory
//! 2. The local configuration directory of the user
//! 3. The configuration directory of the user
//! 4. The local configuration directory of the application
//! 5. The configuration directory of the application
//!
//! ```yaml
//! schema: 1.0
//!
//! submission:
//!   url: https://crashes.example.com/crash_v200.php
//!   app_identifier: 5a3a9f0c
//!   timeout_secs: 15
//!
//! application:
//!   name: Example
//!   version: 1402
//!   short_version: 1.4.2
//!   identifier: com.example.app
//!
//! diagnostics:
//!   directories:
//!     - /Users/me/Library/Logs/DiagnosticReports
//!   extensions: [crash, ips]
//!
//! system:
//!   platform: MacBookPro18,3
//!
//! consent:
//!   company_name: Example Inc.
//!   auto_submit: false
//!   delay_secs: 5
//!   rejected_candidates: defer
//! ```
//!
//! The diagnostics section is optional. The report files are searched in the
//! platform specific default directories, and are expected to start with the
//! application name followed by an underscore (`.crash` files) or a hyphen
//! (`.ips` files).

// Re-Export the types and the loader module content.
pub use loader::{ConfigError, Loader};
pub use types::*;
pub use validation::{ValidationError, Validator};

mod types {
    use crate::pipeline::RejectedCandidates;
    use serde::Deserialize;
    use std::fmt;
    use std::path::PathBuf;

    /// Represents the application configuration.
    #[derive(Debug, PartialEq, serde::Deserialize, serde::Serialize)]
    pub struct Main {
        #[serde(deserialize_with = "validate_schema_version")]
        pub schema: String,
        #[serde(default)]
        pub submission: Submission,
        #[serde(default)]
        pub application: Application,
        #[serde(default)]
        pub diagnostics: Diagnostics,
        #[serde(default)]
        pub consent: Consent,
        #[serde(default)]
        pub system: System,
    }

    impl Default for Main {
        fn default() -> Self {
            Self {
                schema: String::from(SUPPORTED_SCHEMA_VERSION),
                submission: Submission::default(),
                application: Application::default(),
                diagnostics: Diagnostics::default(),
                consent: Consent::default(),
                system: System::default(),
            }
        }
    }

    impl fmt::Display for Main {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "Configuration:")?;
            let yaml_string = serde_yml::to_string(self).map_err(|_| fmt::Error)?;
            for line in yaml_string.lines() {
                writeln!(f, "{line}")?;
            }
            Ok(())
        }
    }

    /// Where and how to send the reports.
    #[derive(Debug, PartialEq, serde::Deserialize, serde::Serialize)]
    pub struct Submission {
        #[serde(default)]
        pub url: String,
        /// The application identifier on a multi-tenant server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub app_identifier: Option<String>,
        #[serde(default = "default_timeout_secs")]
        pub timeout_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub user_agent: Option<String>,
    }

    impl Default for Submission {
        fn default() -> Self {
            Self { url: String::new(), app_identifier: None, timeout_secs: default_timeout_secs(), user_agent: None }
        }
    }

    /// The application the reports are about.
    ///
    /// When reporting crashes of a plugin, these are the plugin's details,
    /// while the diagnostics prefix names the host application.
    #[derive(Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
    pub struct Application {
        #[serde(default)]
        pub name: String,
        #[serde(default)]
        pub version: String,
        #[serde(default)]
        pub short_version: String,
        #[serde(default)]
        pub identifier: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub icon: Option<PathBuf>,
    }

    /// Where the crash reports are, and where the processed state is kept.
    #[derive(Debug, PartialEq, serde::Deserialize, serde::Serialize)]
    pub struct Diagnostics {
        /// Empty means the platform default directories.
        #[serde(default)]
        pub directories: Vec<PathBuf>,
        /// Empty means the application name followed by an underscore or a hyphen.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub prefixes: Vec<String>,
        #[serde(default = "default_extensions")]
        pub extensions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub state_file: Option<PathBuf>,
    }

    impl Default for Diagnostics {
        fn default() -> Self {
            Self { directories: vec![], prefixes: vec![], extensions: default_extensions(), state_file: None }
        }
    }

    /// How the user is involved.
    #[derive(Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
    pub struct Consent {
        #[serde(default)]
        pub company_name: String,
        #[serde(default)]
        pub auto_submit: bool,
        #[serde(default)]
        pub delay_secs: u64,
        #[serde(default)]
        pub rejected_candidates: RejectedCandidates,
    }

    /// Overrides of what is reported about the machine.
    ///
    /// Servers group the reports by these values, the detected ones are
    /// only the operating system and the architecture.
    #[derive(Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
    pub struct System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub version: Option<String>,
        /// The hardware model, like `MacBookPro18,3`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub platform: Option<String>,
    }

    pub(super) const SUPPORTED_SCHEMA_VERSION: &str = "1.0";

    fn default_timeout_secs() -> u64 {
        15
    }

    fn default_extensions() -> Vec<String> {
        vec!["crash".into(), "ips".into()]
    }

    // Custom deserialization function to validate the schema version
    fn validate_schema_version<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let schema: String = Deserialize::deserialize(deserializer)?;
        if schema != SUPPORTED_SCHEMA_VERSION {
            use serde::de::Error;
            Err(Error::custom(format!(
                "Unsupported schema version: {schema}. Expected: {SUPPORTED_SCHEMA_VERSION}"
            )))
        } else {
            Ok(schema)
        }
    }
}

pub mod validation {

    use super::types::*;
    use crate::report::is_valid_version;
    use thiserror::Error;

    /// Trait for validating configuration objects
    pub trait Validator<T> {
        type Error: std::error::Error;

        fn validate(config: &T) -> Result<(), Self::Error>;
    }

    /// Validation errors for configuration
    #[derive(Debug, Error)]
    pub enum ValidationError {
        #[error("Empty string value for field '{field}'")]
        EmptyString { field: &'static str },
        #[error("Invalid submission URL '{url}': {message}")]
        InvalidUrl { url: String, message: String },
        #[error("Field '{field}' contains characters other than alphanumeric, space and dot: '{value}'")]
        InvalidVersion { field: &'static str, value: String },
        #[error("Zero value for field '{field}'")]
        ZeroValue { field: &'static str },
        #[error("Multiple validation errors: {errors:?}")]
        Multiple { errors: Vec<ValidationError> },
    }

    /// Combinator for collecting and handling validation errors
    #[derive(Default)]
    struct ValidationCollector {
        errors: Vec<ValidationError>,
    }

    impl ValidationCollector {
        fn new() -> Self {
            Self { errors: Vec::new() }
        }

        fn add(&mut self, error: ValidationError) {
            self.errors.push(error);
        }

        fn add_result(&mut self, result: Result<(), ValidationError>) {
            if let Err(error) = result {
                match error {
                    ValidationError::Multiple { errors } => {
                        self.errors.extend(errors);
                    }
                    single_error => self.errors.push(single_error),
                }
            }
        }

        fn finish(mut self) -> Result<(), ValidationError> {
            match self.errors.len() {
                0 => Ok(()),
                1 => Err(self.errors.remove(0)),
                _ => Err(ValidationError::Multiple { errors: self.errors }),
            }
        }
    }

    impl Validator<Main> for Main {
        type Error = ValidationError;

        fn validate(config: &Main) -> Result<(), Self::Error> {
            let mut collector = ValidationCollector::new();

            collector.add_result(Submission::validate(&config.submission));
            collector.add_result(Application::validate(&config.application));
            collector.add_result(Diagnostics::validate(&config.diagnostics));
            collector.add_result(System::validate(&config.system));

            collector.finish()
        }
    }

    impl Validator<Submission> for Submission {
        type Error = ValidationError;

        fn validate(config: &Submission) -> Result<(), Self::Error> {
            let mut collector = ValidationCollector::new();

            // The URL is optional in the file, the submit mode checks its presence.
            if !config.url.is_empty() {
                match reqwest::Url::parse(&config.url) {
                    Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                    Ok(url) => collector.add(ValidationError::InvalidUrl {
                        url: config.url.clone(),
                        message: format!("unsupported scheme '{}'", url.scheme()),
                    }),
                    Err(error) => collector.add(ValidationError::InvalidUrl {
                        url: config.url.clone(),
                        message: error.to_string(),
                    }),
                }
            }
            if config.app_identifier.as_deref().is_some_and(str::is_empty) {
                collector.add(ValidationError::EmptyString { field: "submission.app_identifier" });
            }
            if config.timeout_secs == 0 {
                collector.add(ValidationError::ZeroValue { field: "submission.timeout_secs" });
            }

            collector.finish()
        }
    }

    impl Validator<Application> for Application {
        type Error = ValidationError;

        fn validate(config: &Application) -> Result<(), Self::Error> {
            let mut collector = ValidationCollector::new();

            for (field, value) in [
                ("application.version", &config.version),
                ("application.short_version", &config.short_version),
            ] {
                if !value.is_empty() && !is_valid_version(value) {
                    collector.add(ValidationError::InvalidVersion { field, value: value.clone() });
                }
            }

            collector.finish()
        }
    }

    impl Validator<Diagnostics> for Diagnostics {
        type Error = ValidationError;

        fn validate(config: &Diagnostics) -> Result<(), Self::Error> {
            let mut collector = ValidationCollector::new();

            if config.prefixes.iter().any(String::is_empty) {
                collector.add(ValidationError::EmptyString { field: "diagnostics.prefixes" });
            }
            if config.extensions.is_empty() {
                collector.add(ValidationError::EmptyString { field: "diagnostics.extensions" });
            }
            if config.extensions.iter().any(|extension| extension.trim_start_matches('.').is_empty()) {
                collector.add(ValidationError::EmptyString { field: "diagnostics.extensions" });
            }

            collector.finish()
        }
    }

    impl Validator<System> for System {
        type Error = ValidationError;

        fn validate(config: &System) -> Result<(), Self::Error> {
            let mut collector = ValidationCollector::new();

            if config.version.as_deref().is_some_and(str::is_empty) {
                collector.add(ValidationError::EmptyString { field: "system.version" });
            }
            if config.platform.as_deref().is_some_and(str::is_empty) {
                collector.add(ValidationError::EmptyString { field: "system.platform" });
            }

            collector.finish()
        }
    }

}

pub mod loader {
    use super::{Main, Validator};
    use directories::{BaseDirs, ProjectDirs};
    use log::{debug, info};
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};
    use thiserror::Error;

    /// The name of the configuration file in the default locations.
    pub const CONFIG_FILE_NAME: &str = "quincy.yml";

    pub struct Loader {}

    impl Loader {
        /// Loads the configuration from the specified file or the default locations.
        ///
        /// If the configuration file is specified, it will be used. Otherwise, the default locations
        /// will be searched for the configuration file. If the configuration file is not found, the
        /// default configuration will be returned.
        pub fn load(context: &crate::context::Context, filename: &Option<String>) -> Result<Main, ConfigError> {
            if let Some(path) = filename {
                return Self::from_file(Path::new(path));
            }

            for location in Self::file_locations(context) {
                debug!("Checking configuration file: {}", location.display());
                if location.exists() {
                    return Self::from_file(location.as_path());
                }
            }
            debug!("Configuration file not found. Using the default configuration.");
            Ok(Main::default())
        }

        /// The default locations where the configuration file can be found.
        fn file_locations(context: &crate::context::Context) -> Vec<PathBuf> {
            let mut locations = Vec::new();

            locations.push(context.current_directory.clone());
            if let Some(base_dirs) = BaseDirs::new() {
                locations.push(base_dirs.config_local_dir().to_path_buf());
                locations.push(base_dirs.config_dir().to_path_buf());
            }
            if let Some(proj_dirs) = ProjectDirs::from("net", "quincykit", "Quincy") {
                locations.push(proj_dirs.config_local_dir().to_path_buf());
                locations.push(proj_dirs.config_dir().to_path_buf());
            }
            locations.dedup();

            locations.iter().map(|path| path.join(CONFIG_FILE_NAME)).collect()
        }

        /// Loads the configuration from the specified file.
        pub fn from_file(path: &Path) -> Result<Main, ConfigError> {
            info!("Loading configuration file: {}", path.display());

            let reader = OpenOptions::new()
                .read(true)
                .open(path)
                .map_err(|source| ConfigError::FileAccess { path: path.to_path_buf(), source })?;

            let content: Main = Self::from_reader(reader)
                .map_err(|source| ConfigError::ParseError { path: path.to_path_buf(), source })?;

            Main::validate(&content)
                .map_err(|source| ConfigError::ValidationError { path: path.to_path_buf(), source })?;

            Ok(content)
        }

        /// Define the deserialization format of the config file.
        fn from_reader<R, T>(rdr: R) -> serde_yml::Result<T>
        where
            R: std::io::Read,
            T: serde::de::DeserializeOwned,
        {
            serde_yml::from_reader(rdr)
        }
    }

    /// Represents all possible configuration-related errors.
    #[derive(Debug, Error)]
    pub enum ConfigError {
        /// Error when opening or reading a configuration file.
        #[error("Failed to access configuration file '{path}': {source}")]
        FileAccess {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        /// Error when parsing the configuration file format.
        #[error("Failed to parse configuration from file '{path}': {source}")]
        ParseError {
            path: PathBuf,
            #[source]
            source: serde_yml::Error,
        },
        /// Error when configuration validation fails.
        #[error("Configuration validation failed in '{path}': {source}")]
        ValidationError {
            path: PathBuf,
            #[source]
            source: crate::config::validation::ValidationError,
        },
    }

}
