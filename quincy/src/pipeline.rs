// SPDX-License-Identifier: GPL-3.0-or-later

//! The module contains the crash reporting pipeline, which coordinates the
//! user's consent with the submission of the pending crash reports.
//!
//! The pipeline is a state machine:
//!
//! ```text
//! Idle -> Scanning -> AwaitingConsent -> Submitting -> Completed
//!            |              |                |
//!            |              +-> Cancelled <--+
//!            +-> Completed (nothing to send)
//!            +-> Submitting (auto submit)
//! ```
//!
//! The work is done on a dedicated worker thread, the caller (typically the
//! user interface thread) is never blocked. The user interface is notified
//! through the `Delegate` trait, and answers with the `proceed` or `cancel`
//! methods of the pipeline handle.
//!
//! Nothing in the pipeline is allowed to take down the host application.
//! Failures are logged and the affected report stays pending for the next run.

use crate::diagnostic::{CrashDiagnostic, DiagnosticId};
use crate::report::{join_crash_logs, ReportBuilder, ReportDetails};
use crate::status::{RejectReason, SubmissionResult};
use crate::store::DiagnosticStore;
use crate::submission::{Endpoint, SubmissionClient, TransportError};
use crossbeam_channel::{after, select, unbounded, Receiver, Sender};
use log::Level;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// The states of the pipeline.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum PipelineState {
    Idle,
    Scanning,
    AwaitingConsent,
    Submitting,
    Completed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::AwaitingConsent => "awaiting consent",
            Self::Submitting => "submitting",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What happens to the reports which the delegate finds invalid.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectedCandidates {
    /// Ask the delegate again on every run.
    #[default]
    Reconsider,
    /// Skip them for the lifetime of the diagnostic store.
    Defer,
}

/// The pipeline configuration. Immutable after the pipeline is created.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub submission_url: String,
    /// Identifies the application on a multi-tenant server.
    pub app_identifier: Option<String>,
    /// Shown to the user when asking for consent.
    pub company_name: String,
    /// Submit without asking the user.
    pub auto_submit: bool,
    /// Wait this long after start before looking for reports.
    pub delay: Duration,
    pub rejected_candidates: RejectedCandidates,
}

impl PipelineConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint { url: self.submission_url.clone(), app_identifier: self.app_identifier.clone() }
    }
}

/// Everything the user interface needs to ask the user about the reports.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsentRequest {
    pub company_name: String,
    pub application_name: String,
    pub icon: Option<PathBuf>,
    pub diagnostics: Vec<CrashDiagnostic>,
}

impl ConsentRequest {
    /// The crash logs of all reports, to show them as a single text.
    pub fn crash_log_text(&self) -> String {
        join_crash_logs(self.diagnostics.iter().map(|diagnostic| diagnostic.content.as_str()))
    }
}

/// The result of one submission during the run.
#[derive(Clone, Debug, PartialEq)]
pub struct Attempt {
    pub diagnostic: DiagnosticId,
    pub result: SubmissionResult,
}

/// The summary of a finished run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    /// Either `Completed` or `Cancelled`.
    pub state: PipelineState,
    /// The submissions which were finished (and acted upon) during the run.
    pub attempts: Vec<Attempt>,
}

impl RunOutcome {
    fn completed(attempts: Vec<Attempt>) -> Self {
        Self { state: PipelineState::Completed, attempts }
    }

    fn cancelled(attempts: Vec<Attempt>) -> Self {
        Self { state: PipelineState::Cancelled, attempts }
    }

    pub fn accepted(&self) -> usize {
        self.attempts.iter().filter(|attempt| attempt.result.is_accepted()).count()
    }
}

/// The capabilities the host application (mostly its user interface) provides.
///
/// Every method has a default implementation, the host implements only what
/// it cares about. All methods are called from the pipeline worker thread.
pub trait Delegate: Send + Sync {
    /// Filter for the reports. Invalid reports are neither submitted nor marked processed.
    fn is_valid(&self, _diagnostic: &CrashDiagnostic) -> bool {
        true
    }

    /// Called right before the consent request, e.g. to unhide the application.
    fn ui_will_be_shown(&self) {}

    /// The user shall be asked. Answer with `CrashPipeline::proceed` or `CrashPipeline::cancel`.
    fn on_consent_needed(&self, _request: &ConsentRequest) {}

    /// Called exactly once per run, when the pipeline reached a terminal state.
    fn on_completed(&self, _outcome: &RunOutcome) {}

    /// The description used when submitting without asking the user.
    fn crash_report_description(&self) -> String {
        String::new()
    }

    /// The user id used when submitting without asking the user.
    fn crash_report_user_id(&self) -> Option<String> {
        None
    }

    /// The contact used when submitting without asking the user.
    fn crash_report_contact(&self) -> Option<String> {
        None
    }

    /// Receives the log messages of the pipeline.
    fn log(&self, _level: Level, _message: &str) {}
}

enum Decision {
    Proceed(ReportDetails),
    Cancel,
}

/// Handle to the crash reporting pipeline.
///
/// The handle is cheap to clone. The user interface keeps a clone to answer
/// the consent request, while the pipeline keeps only a weak reference to the
/// delegate.
#[derive(Clone)]
pub struct CrashPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    config: PipelineConfig,
    store: Arc<dyn DiagnosticStore>,
    builder: ReportBuilder,
    client: SubmissionClient,
    delegate: Weak<dyn Delegate>,
    state: Mutex<PipelineState>,
    state_changed: Condvar,
    cancelled: AtomicBool,
    decisions: Sender<Decision>,
    decisions_receiver: Receiver<Decision>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CrashPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn DiagnosticStore>,
        builder: ReportBuilder,
        client: SubmissionClient,
        delegate: &Arc<dyn Delegate>,
    ) -> Self {
        let (decisions, decisions_receiver) = unbounded();
        let inner = Inner {
            config,
            store,
            builder,
            client,
            delegate: Arc::downgrade(delegate),
            state: Mutex::new(PipelineState::Idle),
            state_changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
            decisions,
            decisions_receiver,
            worker: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn state(&self) -> PipelineState {
        *lock(&self.inner.state)
    }

    /// Start the run on a worker thread.
    ///
    /// Returns `false` (and does nothing) when the pipeline was already started.
    pub fn start(&self) -> bool {
        {
            let mut state = lock(&self.inner.state);
            if *state != PipelineState::Idle {
                log::debug!("Ignoring start request, the pipeline is {}", *state);
                return false;
            }
            *state = PipelineState::Scanning;
            self.inner.state_changed.notify_all();
        }

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("quincy-pipeline".into())
            .spawn(move || inner.run());
        match spawned {
            Ok(handle) => {
                *lock(&self.inner.worker) = Some(handle);
            }
            Err(error) => {
                self.inner.emit(Level::Error, format!("Failed to start crash report pipeline: {error}"));
                self.inner.finish(RunOutcome::completed(vec![]));
            }
        }
        true
    }

    /// The user agreed to send the reports.
    ///
    /// Returns `false` (and does nothing) when the pipeline is not waiting for consent.
    pub fn proceed(&self, details: ReportDetails) -> bool {
        let mut state = lock(&self.inner.state);
        if *state != PipelineState::AwaitingConsent {
            log::debug!("Ignoring proceed request, the pipeline is {}", *state);
            return false;
        }
        *state = PipelineState::Submitting;
        self.inner.state_changed.notify_all();
        let _ = self.inner.decisions.send(Decision::Proceed(details));
        true
    }

    /// Stop the run.
    ///
    /// A submission which is already on the wire finishes, but its result is
    /// discarded and no further report is sent. Returns `false` (and does
    /// nothing) when the pipeline is not running.
    pub fn cancel(&self) -> bool {
        let state = lock(&self.inner.state);
        match *state {
            PipelineState::Scanning | PipelineState::AwaitingConsent | PipelineState::Submitting => {
                self.inner.cancelled.store(true, Ordering::SeqCst);
                let _ = self.inner.decisions.send(Decision::Cancel);
                true
            }
            _ => {
                log::debug!("Ignoring cancel request, the pipeline is {}", *state);
                false
            }
        }
    }

    /// Block until the state satisfies the predicate, or the timeout elapses.
    ///
    /// Returns the state at the time of return.
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(PipelineState) -> bool) -> PipelineState {
        let state = lock(&self.inner.state);
        let (state, _) = self
            .inner
            .state_changed
            .wait_timeout_while(state, timeout, |state| !predicate(*state))
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }

    /// Block until the run is over, or the timeout elapses.
    pub fn wait_until_finished(&self, timeout: Duration) -> PipelineState {
        self.wait_for(timeout, PipelineState::is_terminal)
    }

    /// Wait for the worker thread to exit. Must not be called from a delegate method.
    pub fn join(&self) {
        let handle = lock(&self.inner.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Crash report pipeline thread panicked");
            }
        }
    }
}

impl Inner {
    fn run(&self) {
        let outcome = self.execute();
        self.finish(outcome);
    }

    fn execute(&self) -> RunOutcome {
        if !self.config.delay.is_zero() {
            log::debug!("Waiting {:?} before looking for crash reports", self.config.delay);
            if self.cancelled_within(self.config.delay) {
                return RunOutcome::cancelled(vec![]);
            }
        }

        let candidates = self.scan();
        if self.is_cancelled() {
            return RunOutcome::cancelled(vec![]);
        }
        if candidates.is_empty() {
            self.emit(Level::Info, "No pending crash reports".to_string());
            return RunOutcome::completed(vec![]);
        }
        self.emit(Level::Info, format!("Found {} pending crash reports", candidates.len()));

        let details = if self.config.auto_submit {
            self.transition(PipelineState::Submitting);
            self.default_details()
        } else {
            match self.ask_for_consent(&candidates) {
                Some(details) => details,
                None => return RunOutcome::cancelled(vec![]),
            }
        };

        self.submit_all(&candidates, &details)
    }

    /// Collect the pending reports, which the delegate finds valid.
    fn scan(&self) -> Vec<CrashDiagnostic> {
        let delegate = self.delegate.upgrade();
        let mut candidates = Vec::new();
        for diagnostic in self.store.list_pending() {
            let valid = delegate.as_ref().map(|delegate| delegate.is_valid(&diagnostic)).unwrap_or(true);
            if valid {
                candidates.push(diagnostic);
                continue;
            }
            self.emit(Level::Info, format!("Crash report {} is not valid, skipping it", diagnostic.id));
            if self.config.rejected_candidates == RejectedCandidates::Defer {
                self.store.defer(&diagnostic.id);
            }
        }
        candidates
    }

    /// Ask the delegate for consent and wait for the answer, without time limit.
    fn ask_for_consent(&self, candidates: &[CrashDiagnostic]) -> Option<ReportDetails> {
        let Some(delegate) = self.delegate.upgrade() else {
            self.emit(Level::Warn, "No delegate to ask for consent, crash reports are not sent".to_string());
            return None;
        };
        let request = ConsentRequest {
            company_name: self.config.company_name.clone(),
            application_name: self.builder.app().name.clone(),
            icon: self.builder.app().icon.clone(),
            diagnostics: candidates.to_vec(),
        };

        self.transition(PipelineState::AwaitingConsent);
        delegate.ui_will_be_shown();
        delegate.on_consent_needed(&request);
        drop(delegate);

        loop {
            match self.decisions_receiver.recv() {
                Ok(Decision::Proceed(details)) => return Some(details),
                Ok(Decision::Cancel) | Err(_) => {
                    self.emit(Level::Info, "Crash reporting was cancelled".to_string());
                    return None;
                }
            }
        }
    }

    fn default_details(&self) -> ReportDetails {
        match self.delegate.upgrade() {
            Some(delegate) => ReportDetails {
                description: delegate.crash_report_description(),
                user_id: delegate.crash_report_user_id(),
                contact: delegate.crash_report_contact(),
            },
            None => ReportDetails::default(),
        }
    }

    /// Send the reports one after the other.
    fn submit_all(&self, candidates: &[CrashDiagnostic], details: &ReportDetails) -> RunOutcome {
        let endpoint = self.config.endpoint();
        let mut attempts = Vec::new();

        for diagnostic in candidates {
            if self.is_cancelled() {
                return RunOutcome::cancelled(attempts);
            }

            let result = match self.builder.build(diagnostic, details) {
                Ok(payload) => {
                    let pending = self.client.submit_in_background(payload, endpoint.clone());
                    match self.await_submission(pending) {
                        Some(result) => result,
                        None => {
                            self.emit(Level::Info, format!("Submission of {} was cancelled", diagnostic.id));
                            return RunOutcome::cancelled(attempts);
                        }
                    }
                }
                Err(error) => {
                    self.emit(Level::Warn, format!("Crash report {} can not be sent: {error}", diagnostic.id));
                    SubmissionResult::Rejected(RejectReason::InvalidVersionFormat)
                }
            };
            if self.is_cancelled() {
                return RunOutcome::cancelled(attempts);
            }

            self.record(&diagnostic.id, &result);
            attempts.push(Attempt { diagnostic: diagnostic.id.clone(), result });
        }

        RunOutcome::completed(attempts)
    }

    /// Wait for the submission result, unless the run is cancelled meanwhile.
    fn await_submission(&self, pending: Receiver<SubmissionResult>) -> Option<SubmissionResult> {
        loop {
            select! {
                recv(pending) -> result => {
                    return Some(result.unwrap_or(SubmissionResult::TransportFailed(TransportError::Interrupted)));
                }
                recv(self.decisions_receiver) -> decision => match decision {
                    Ok(Decision::Proceed(_)) => continue,
                    Ok(Decision::Cancel) | Err(_) => return None,
                },
            }
        }
    }

    /// Act on the submission result.
    fn record(&self, id: &DiagnosticId, result: &SubmissionResult) {
        match result {
            SubmissionResult::Accepted(_) => {
                self.emit(Level::Info, format!("Crash report {id} was sent: {result}"));
            }
            SubmissionResult::Rejected(reason) if reason.is_terminal() => {
                self.emit(Level::Warn, format!("Crash report {id} is refused for good: {reason}"));
            }
            SubmissionResult::Rejected(reason) => {
                self.emit(Level::Warn, format!("Crash report {id} was rejected: {reason}"));
            }
            SubmissionResult::Indeterminate => {
                self.emit(Level::Info, format!("Crash report {id} has unknown status, keeping it"));
            }
            SubmissionResult::TransportFailed(error) => {
                self.emit(Level::Warn, format!("Crash report {id} was not sent: {error}"));
            }
        }

        if result.should_mark_processed() {
            if let Err(error) = self.store.mark_processed(id) {
                self.emit(Level::Error, format!("Failed to record crash report {id} as processed: {error}"));
            }
        }
    }

    /// Returns `true` if the run was cancelled during the wait.
    fn cancelled_within(&self, delay: Duration) -> bool {
        let deadline = after(delay);
        loop {
            select! {
                recv(deadline) -> _ => return false,
                recv(self.decisions_receiver) -> decision => match decision {
                    Ok(Decision::Proceed(_)) => continue,
                    Ok(Decision::Cancel) | Err(_) => return true,
                },
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn transition(&self, next: PipelineState) {
        let mut state = lock(&self.state);
        if *state != next {
            log::debug!("Pipeline state: {} -> {}", *state, next);
            *state = next;
        }
        self.state_changed.notify_all();
    }

    fn finish(&self, outcome: RunOutcome) {
        self.transition(outcome.state);
        self.emit(
            Level::Info,
            format!("Crash reporting {}: {} of {} reports sent", outcome.state, outcome.accepted(), outcome.attempts.len()),
        );
        if let Some(delegate) = self.delegate.upgrade() {
            delegate.on_completed(&outcome);
        }
    }

    /// Log the message and forward it to the delegate.
    fn emit(&self, level: Level, message: String) {
        log::log!(level, "{message}");
        if let Some(delegate) = self.delegate.upgrade() {
            delegate.log(level, &message);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
