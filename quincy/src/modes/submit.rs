// SPDX-License-Identifier: GPL-3.0-or-later

use crate::args;
use crate::pipeline::{ConsentRequest, CrashPipeline, Delegate, PipelineConfig, RunOutcome};
use crate::report::{ReportBuilder, ReportDetails};
use crate::status::SubmissionResult;
use crate::store::FileDiagnosticStore;
use crate::submission::SubmissionClient;
use crossbeam_channel::{unbounded, Sender};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

/// Runs the crash report pipeline with the terminal as user interface.
///
/// The pipeline works on its own thread, while this thread waits for its
/// events. When the user needs to be asked, the question goes to the
/// standard output and the answer is read from the standard input.
pub struct Submitter {
    config: PipelineConfig,
    store: Arc<FileDiagnosticStore>,
    builder: ReportBuilder,
    client: SubmissionClient,
    details: ReportDetails,
}

impl Submitter {
    pub(super) fn new(
        config: PipelineConfig,
        store: Arc<FileDiagnosticStore>,
        builder: ReportBuilder,
        client: SubmissionClient,
        details: args::Details,
    ) -> Self {
        let details = ReportDetails {
            description: details.description.unwrap_or_default(),
            user_id: details.user_id,
            contact: details.contact,
        };
        Self { config, store, builder, client, details }
    }

    pub(super) fn run(self) -> anyhow::Result<ExitCode> {
        let stdin = io::stdin();
        let stdout = io::stdout();
        self.run_with(&mut stdin.lock(), &mut stdout.lock())
    }

    fn run_with(self, input: &mut impl BufRead, output: &mut impl Write) -> anyhow::Result<ExitCode> {
        let (events, receiver) = unbounded();
        let delegate: Arc<dyn Delegate> = Arc::new(TerminalDelegate { events, details: self.details.clone() });
        let pipeline = CrashPipeline::new(self.config, self.store, self.builder, self.client, &delegate);
        pipeline.start();

        loop {
            match receiver.recv()? {
                Event::ConsentNeeded(request) => match ask_for_consent(&request, &self.details, input, output) {
                    Ok(Some(details)) => {
                        pipeline.proceed(details);
                    }
                    Ok(None) => {
                        pipeline.cancel();
                    }
                    Err(error) => {
                        log::warn!("Failed to ask for consent: {error}");
                        pipeline.cancel();
                    }
                },
                Event::Completed(outcome) => {
                    pipeline.join();
                    summarize(&outcome, output)?;
                    return Ok(if has_failures(&outcome) { ExitCode::FAILURE } else { ExitCode::SUCCESS });
                }
            }
        }
    }
}

enum Event {
    ConsentNeeded(ConsentRequest),
    Completed(RunOutcome),
}

/// Forwards the pipeline callbacks to the waiting terminal thread.
struct TerminalDelegate {
    events: Sender<Event>,
    details: ReportDetails,
}

impl Delegate for TerminalDelegate {
    fn ui_will_be_shown(&self) {
        log::debug!("Asking for consent on the terminal");
    }

    fn on_consent_needed(&self, request: &ConsentRequest) {
        if self.events.send(Event::ConsentNeeded(request.clone())).is_err() {
            log::error!("Failed to forward consent request");
        }
    }

    fn on_completed(&self, outcome: &RunOutcome) {
        if self.events.send(Event::Completed(outcome.clone())).is_err() {
            log::error!("Failed to forward completion");
        }
    }

    fn crash_report_description(&self) -> String {
        self.details.description.clone()
    }

    fn crash_report_user_id(&self) -> Option<String> {
        self.details.user_id.clone()
    }

    fn crash_report_contact(&self) -> Option<String> {
        self.details.contact.clone()
    }
}

/// Returns the details to send with, or `None` when the user declined.
fn ask_for_consent(
    request: &ConsentRequest,
    defaults: &ReportDetails,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> io::Result<Option<ReportDetails>> {
    writeln!(output, "{} has unexpectedly quit recently.", request.application_name)?;
    writeln!(output, "Crash reports:")?;
    for diagnostic in &request.diagnostics {
        writeln!(output, "  {}", diagnostic.id)?;
    }
    writeln!(output)?;
    writeln!(output, "{}", request.crash_log_text())?;
    write!(output, "Send the crash reports to {}? [y/N] ", request.company_name)?;
    output.flush()?;

    let answer = read_line(input)?;
    if !matches!(answer.to_lowercase().as_str(), "y" | "yes") {
        return Ok(None);
    }

    let mut details = defaults.clone();
    if details.description.is_empty() {
        write!(output, "What were you doing when the crash happened? (optional) ")?;
        output.flush()?;
        details.description = read_line(input)?;
    }
    Ok(Some(details))
}

fn read_line(input: &mut impl BufRead) -> io::Result<String> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn summarize(outcome: &RunOutcome, output: &mut impl Write) -> io::Result<()> {
    for attempt in &outcome.attempts {
        writeln!(output, "{}: {}", attempt.diagnostic, attempt.result)?;
    }
    writeln!(
        output,
        "Crash reporting {}, {} of {} reports sent",
        outcome.state,
        outcome.accepted(),
        outcome.attempts.len()
    )
}

/// Reports left pending for a failure are worth a non-zero exit code.
fn has_failures(outcome: &RunOutcome) -> bool {
    outcome.attempts.iter().any(|attempt| {
        !attempt.result.should_mark_processed() && attempt.result != SubmissionResult::Indeterminate
    })
}
