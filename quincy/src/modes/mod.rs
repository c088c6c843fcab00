// SPDX-License-Identifier: GPL-3.0-or-later

mod submit;

use crate::diagnostic::DiagnosticId;
use crate::pipeline::PipelineConfig;
use crate::report::{AppMetadata, ReportBuilder, SystemInfo};
use crate::store::{DiagnosticStore, DiagnosticsLocation, FileDiagnosticStore};
use crate::submission::{HttpTransport, SubmissionClient, TransportError};
use crate::{args, config, context};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Represent the modes the application can run in.
///
/// To the user the modes are:
/// - list: show the pending crash reports.
/// - submit: send the pending crash reports, with or without asking.
/// - mark: record crash reports as processed, without sending them.
pub enum Mode {
    List(Lister),
    Submit(submit::Submitter),
    Mark(Marker),
}

impl Mode {
    /// Configure the application mode based on the command line arguments and the configuration.
    ///
    /// Here we are checking if the command line arguments and configuration are valid.
    /// If the arguments are valid, we create the appropriate mode instance.
    /// If that is not the case, we try to return a useful error message.
    pub fn configure(
        context: context::Context,
        args: args::Arguments,
        config: config::Main,
    ) -> Result<Self, ConfigurationError> {
        let store = Arc::new(create_store(&context, &config)?);

        match args.mode {
            args::Mode::List => {
                log::debug!("Mode: list pending crash reports");
                Ok(Self::List(Lister { store }))
            }
            args::Mode::Mark { ids } => {
                log::debug!("Mode: mark crash reports as processed");
                let ids = ids.into_iter().map(DiagnosticId::new).collect();
                Ok(Self::Mark(Marker { store, ids }))
            }
            args::Mode::Submit { auto, details } => {
                log::debug!("Mode: submit pending crash reports");
                let pipeline = pipeline_config(&config, auto)?;
                let builder = ReportBuilder::new(app_metadata(&config)?, system_info(&config.system));
                let transport = create_transport(&config.submission)?;
                let client = SubmissionClient::new(Arc::new(transport));

                Ok(Self::Submit(submit::Submitter::new(pipeline, store, builder, client, details)))
            }
        }
    }

    /// It actually runs the application mode.
    ///
    /// These errors are all run-time errors, the user were passing valid
    /// arguments and configurations.
    pub fn run(self) -> ExitCode {
        let status = match self {
            Self::List(lister) => lister.run(&mut std::io::stdout().lock()),
            Self::Submit(submitter) => submitter.run(),
            Self::Mark(marker) => marker.run(),
        };
        status.unwrap_or_else(|error| {
            log::error!("Quincy: {error}");
            ExitCode::FAILURE
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Missing configuration value: {0}")]
    MissingValue(&'static str),
    #[error("No directory to look for crash reports, set diagnostics.directories")]
    NoDiagnosticDirectories,
    #[error("Failed to create HTTP client: {0}")]
    TransportCreation(TransportError),
}

/// Prints the pending crash reports.
pub struct Lister {
    store: Arc<FileDiagnosticStore>,
}

impl Lister {
    fn run(self, output: &mut impl Write) -> anyhow::Result<ExitCode> {
        let mut count = 0;
        for diagnostic in self.store.list_pending() {
            let version = diagnostic.app_version.as_deref().unwrap_or("unknown");
            writeln!(output, "{}\tversion {}\t{}", diagnostic.id, version, diagnostic.path.display())?;
            count += 1;
        }
        writeln!(output, "{count} pending crash reports")?;
        Ok(ExitCode::SUCCESS)
    }
}

/// Records crash reports as processed.
pub struct Marker {
    store: Arc<FileDiagnosticStore>,
    ids: Vec<DiagnosticId>,
}

impl Marker {
    fn run(self) -> anyhow::Result<ExitCode> {
        for id in &self.ids {
            if self.store.is_processed(id) {
                log::info!("Crash report {id} is already processed");
                continue;
            }
            self.store.mark_processed(id)?;
            log::info!("Crash report {id} is marked as processed");
        }
        Ok(ExitCode::SUCCESS)
    }
}

fn create_store(context: &context::Context, config: &config::Main) -> Result<FileDiagnosticStore, ConfigurationError> {
    let diagnostics = &config.diagnostics;

    let directories: Vec<PathBuf> = if diagnostics.directories.is_empty() {
        context.diagnostic_directories.clone()
    } else {
        diagnostics.directories.iter().map(|path| absolute(context, path)).collect()
    };
    if directories.is_empty() {
        return Err(ConfigurationError::NoDiagnosticDirectories);
    }

    let prefixes = if !diagnostics.prefixes.is_empty() {
        diagnostics.prefixes.clone()
    } else if !config.application.name.is_empty() {
        DiagnosticsLocation::default_prefixes(&config.application.name)
    } else {
        return Err(ConfigurationError::MissingValue("application.name"));
    };

    let state_file = diagnostics
        .state_file
        .as_deref()
        .map(|path| absolute(context, path))
        .or_else(|| context.state_file.clone())
        .ok_or(ConfigurationError::MissingValue("diagnostics.state_file"))?;

    let extensions = diagnostics
        .extensions
        .iter()
        .map(|extension| extension.trim_start_matches('.').to_string())
        .collect();

    let location = DiagnosticsLocation { directories, prefixes, extensions };
    Ok(FileDiagnosticStore::new(location, state_file))
}

fn pipeline_config(config: &config::Main, auto: bool) -> Result<PipelineConfig, ConfigurationError> {
    if config.submission.url.is_empty() {
        return Err(ConfigurationError::MissingValue("submission.url"));
    }
    let company_name = if config.consent.company_name.is_empty() {
        config.application.name.clone()
    } else {
        config.consent.company_name.clone()
    };

    Ok(PipelineConfig {
        submission_url: config.submission.url.clone(),
        app_identifier: config.submission.app_identifier.clone(),
        company_name,
        auto_submit: auto || config.consent.auto_submit,
        delay: Duration::from_secs(config.consent.delay_secs),
        rejected_candidates: config.consent.rejected_candidates,
    })
}

fn app_metadata(config: &config::Main) -> Result<AppMetadata, ConfigurationError> {
    let application = &config.application;
    let required = |value: &String, field: &'static str| {
        if value.is_empty() { Err(ConfigurationError::MissingValue(field)) } else { Ok(value.clone()) }
    };

    Ok(AppMetadata {
        name: required(&application.name, "application.name")?,
        version: required(&application.version, "application.version")?,
        short_version: required(&application.short_version, "application.short_version")?,
        identifier: required(&application.identifier, "application.identifier")?,
        icon: application.icon.clone(),
    })
}

fn system_info(system: &config::System) -> SystemInfo {
    let mut detected = SystemInfo::current();
    if let Some(version) = &system.version {
        detected.system_version = version.clone();
    }
    if let Some(platform) = &system.platform {
        detected.platform = platform.clone();
    }
    detected
}

fn create_transport(submission: &config::Submission) -> Result<HttpTransport, ConfigurationError> {
    let user_agent = submission
        .user_agent
        .clone()
        .unwrap_or_else(|| format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")));

    HttpTransport::new(Duration::from_secs(submission.timeout_secs), &user_agent)
        .map_err(ConfigurationError::TransportCreation)
}

fn absolute(context: &context::Context, path: &Path) -> PathBuf {
    if path.is_absolute() { path.to_path_buf() } else { context.current_directory.join(path) }
}
