// SPDX-License-Identifier: GPL-3.0-or-later

//! The module contains the submission client, which sends a crash report
//! payload to the collection server and interprets the answer.
//!
//! The network exchange is hidden behind the `Transport` trait. The production
//! implementation is an HTTP POST with a form encoded body, where the single
//! `xmlstring` field holds the payload document. The server answers with a
//! small integer, either bare or wrapped into a `<result>` element.
//!
//! There is no retry on this level. Server answers are final decisions, and
//! transport failures are reported as such to let the caller decide.

use crate::report::ReportPayload;
use crate::status::{RejectReason, ReportStatus, SubmissionResult};
use crossbeam_channel::{bounded, Receiver};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The form field name which carries the payload document.
pub const FORM_FIELD: &str = "xmlstring";

/// Errors that can occur while talking to the server.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connection(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Server responded with HTTP status {0}")]
    Status(u16),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Failed to create payload: {0}")]
    Payload(String),
    #[error("Submission was interrupted")]
    Interrupted,
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else if error.is_connect() {
            Self::Connection(error.to_string())
        } else if let Some(status) = error.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Request(error.to_string())
        }
    }
}

/// Sends a document to the server and returns the body of the answer.
///
/// # Thread Safety
/// Implementers must be `Send + Sync`, submissions run on worker threads.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    fn post(&self, url: &str, document: &str) -> Result<String, TransportError>;
}

/// HTTP implementation of the transport.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post(&self, url: &str, document: &str) -> Result<String, TransportError> {
        log::debug!("Posting {} bytes to {url}", document.len());
        let response = self
            .client
            .post(url)
            .form(&[(FORM_FIELD, document)])
            .send()?
            .error_for_status()?;

        let body = response.text()?;
        log::debug!("Server answered: {body:?}");
        Ok(body)
    }
}

/// Where to send the reports.
#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    pub url: String,
    /// Identifies the application on a multi-tenant server.
    pub app_identifier: Option<String>,
}

/// Submits payloads and interprets the server answers.
#[derive(Clone)]
pub struct SubmissionClient {
    transport: Arc<dyn Transport>,
}

impl SubmissionClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send a single payload. Blocks until the server answers.
    pub fn submit(&self, payload: &ReportPayload, endpoint: &Endpoint) -> SubmissionResult {
        let document = match payload.to_xml(endpoint.app_identifier.as_deref()) {
            Ok(document) => document,
            Err(error) => {
                return SubmissionResult::TransportFailed(TransportError::Payload(error.to_string()));
            }
        };

        match self.transport.post(&endpoint.url, &document) {
            Ok(body) => parse_response(&body),
            Err(error) => SubmissionResult::TransportFailed(error),
        }
    }

    /// Send a single payload from a background thread.
    ///
    /// The result arrives on the returned channel. When the thread can not be
    /// started, the result is a transport failure.
    pub fn submit_in_background(&self, payload: ReportPayload, endpoint: Endpoint) -> Receiver<SubmissionResult> {
        let (sender, receiver) = bounded(1);
        let client = self.clone();

        let spawned = std::thread::Builder::new()
            .name("quincy-submission".into())
            .spawn(move || {
                let result = client.submit(&payload, &endpoint);
                // The receiver is gone when the submission was cancelled.
                let _ = sender.send(result);
            });
        if let Err(error) = spawned {
            log::error!("Failed to start submission thread: {error}");
            let (sender, receiver) = bounded(1);
            let _ = sender.send(SubmissionResult::TransportFailed(TransportError::Request(error.to_string())));
            return receiver;
        }

        receiver
    }
}

/// Interpret the server answer.
///
/// The answer is a status code, either as it is or as the content of a
/// `<result>` element. Anything else is an unknown status.
pub fn parse_response(body: &str) -> SubmissionResult {
    let trimmed = body.trim();
    let code_text = result_element(trimmed).unwrap_or_else(|| trimmed.to_string());

    match code_text.trim().parse::<i64>() {
        Ok(code) => match ReportStatus::from_code(code) {
            Some(status) => SubmissionResult::from(status),
            None => SubmissionResult::Rejected(RejectReason::UnknownServerStatus(code.to_string())),
        },
        Err(_) => SubmissionResult::Rejected(RejectReason::UnknownServerStatus(trimmed.to_string())),
    }
}

/// Find the text of the first `<result>` element in the document.
fn result_element(document: &str) -> Option<String> {
    if !document.starts_with('<') {
        return None;
    }
    let mut reader = Reader::from_str(document);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => inside = element.name().as_ref() == b"result",
            Ok(Event::Text(text)) if inside => return text.unescape().ok().map(|text| text.into_owned()),
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportPayload;

    fn payload() -> ReportPayload {
        ReportPayload {
            crash_log: "Thread 0 crashed".into(),
            description: "pressed save".into(),
            user_id: None,
            contact: Some("me@example.com".into()),
            application_name: "Example".into(),
            application_identifier: "com.example.app".into(),
            version: "1402".into(),
            sender_version: "1.4.2".into(),
            system_version: "unix linux".into(),
            platform: "x86_64".into(),
            icon: None,
        }
    }

    fn endpoint(app_identifier: Option<&str>) -> Endpoint {
        Endpoint {
            url: "https://crashes.example.com/crash_v200.php".into(),
            app_identifier: app_identifier.map(String::from),
        }
    }

    #[test]
    fn test_parse_bare_codes() {
        assert_eq!(parse_response("3"), SubmissionResult::Accepted(ReportStatus::Available));
        assert_eq!(parse_response(" 2\n"), SubmissionResult::Accepted(ReportStatus::Submitted));
        assert_eq!(parse_response("1"), SubmissionResult::Accepted(ReportStatus::Assigned));
        assert_eq!(parse_response("0"), SubmissionResult::Indeterminate);
        assert_eq!(parse_response("-1"), SubmissionResult::Rejected(RejectReason::DatastoreUnavailable));
        assert_eq!(parse_response("-30"), SubmissionResult::Rejected(RejectReason::VersionDiscontinued));
    }

    #[test]
    fn test_parse_wrapped_codes() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?><result>-21</result>"#;
        assert_eq!(parse_response(body), SubmissionResult::Rejected(RejectReason::SenderVersionNotAllowed));
        assert_eq!(
            parse_response("<result> 3 </result>"),
            SubmissionResult::Accepted(ReportStatus::Available)
        );
    }

    #[test]
    fn test_parse_unknown_answers() {
        assert_eq!(
            parse_response("-19"),
            SubmissionResult::Rejected(RejectReason::UnknownServerStatus("-19".into()))
        );
        assert_eq!(
            parse_response("<html>Bad gateway</html>"),
            SubmissionResult::Rejected(RejectReason::UnknownServerStatus("<html>Bad gateway</html>".into()))
        );
        assert_eq!(parse_response(""), SubmissionResult::Rejected(RejectReason::UnknownServerStatus("".into())));
    }

    #[test]
    fn test_submit_posts_the_document() {
        let mut transport = MockTransport::new();
        transport
            .expect_post()
            .withf(|url, document| {
                url.ends_with("/crash_v200.php")
                    && document.contains("<appidentifier>tenant-1</appidentifier>")
                    && document.contains("<contact>me@example.com</contact>")
            })
            .times(1)
            .returning(|_, _| Ok("3".into()));

        let client = SubmissionClient::new(Arc::new(transport));
        let result = client.submit(&payload(), &endpoint(Some("tenant-1")));

        assert_eq!(result, SubmissionResult::Accepted(ReportStatus::Available));
    }

    #[test]
    fn test_submit_reports_transport_failure() {
        let mut transport = MockTransport::new();
        transport
            .expect_post()
            .times(1)
            .returning(|_, _| Err(TransportError::Connection("connection refused".into())));

        let client = SubmissionClient::new(Arc::new(transport));
        let result = client.submit(&payload(), &endpoint(None));

        assert_eq!(
            result,
            SubmissionResult::TransportFailed(TransportError::Connection("connection refused".into()))
        );
        assert!(!result.should_mark_processed());
    }

    #[test]
    fn test_submit_in_background() {
        let mut transport = MockTransport::new();
        transport.expect_post().times(1).returning(|_, _| Ok("-3".into()));

        let client = SubmissionClient::new(Arc::new(transport));
        let receiver = client.submit_in_background(payload(), endpoint(None));
        let result = receiver.recv_timeout(Duration::from_secs(10)).unwrap();

        assert_eq!(result, SubmissionResult::Rejected(RejectReason::InvalidPostData));
    }
}
