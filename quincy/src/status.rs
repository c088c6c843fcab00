// SPDX-License-Identifier: GPL-3.0-or-later

//! This module defines the outcomes of a crash report submission.
//!
//! The collection server answers every submission with a small integer.
//! Positive values (and zero) describe the state of the crash group on the
//! server side, negative values are failures. The `ReportStatus` type is a
//! closed enumeration of the codes the server is known to send, while the
//! `SubmissionResult` type is what the pipeline acts upon.

use crate::submission::TransportError;
use std::fmt;

/// Status codes the collection server is known to answer with.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum ReportStatus {
    /// This app version is set to discontinued, no new crash reports accepted.
    VersionDiscontinued,
    /// The sender version string contains characters other than alphanumeric, space and dot.
    SenderVersionNotAllowed,
    /// The version string contains characters other than alphanumeric, space and dot.
    VersionNotAllowed,
    SqlAddSymbolicateTodo,
    SqlAddCrashLog,
    SqlAddVersion,
    SqlCheckVersionExists,
    SqlAddPattern,
    SqlCheckBugfixStatus,
    SqlUpdatePatternOccurrences,
    SqlFindKnownPatterns,
    SqlSearchAppName,
    /// The post request didn't contain valid data.
    InvalidPostData,
    /// Incoming data may not be added, because e.g. bundle identifier wasn't found.
    InvalidIncomingData,
    /// The server side database cannot be accessed.
    DatabaseNotAvailable,
    Unknown,
    Assigned,
    Submitted,
    Available,
}

impl ReportStatus {
    /// Map the numeric server answer to a known status.
    ///
    /// Returns `None` for codes which are not part of the protocol.
    pub fn from_code(code: i64) -> Option<Self> {
        let status = match code {
            -30 => Self::VersionDiscontinued,
            -21 => Self::SenderVersionNotAllowed,
            -20 => Self::VersionNotAllowed,
            -18 => Self::SqlAddSymbolicateTodo,
            -17 => Self::SqlAddCrashLog,
            -16 => Self::SqlAddVersion,
            -15 => Self::SqlCheckVersionExists,
            -14 => Self::SqlAddPattern,
            -13 => Self::SqlCheckBugfixStatus,
            -12 => Self::SqlUpdatePatternOccurrences,
            -11 => Self::SqlFindKnownPatterns,
            -10 => Self::SqlSearchAppName,
            -3 => Self::InvalidPostData,
            -2 => Self::InvalidIncomingData,
            -1 => Self::DatabaseNotAvailable,
            0 => Self::Unknown,
            1 => Self::Assigned,
            2 => Self::Submitted,
            3 => Self::Available,
            _ => return None,
        };
        Some(status)
    }

    /// The numeric code of the status, as the server sends it.
    pub fn code(self) -> i64 {
        match self {
            Self::VersionDiscontinued => -30,
            Self::SenderVersionNotAllowed => -21,
            Self::VersionNotAllowed => -20,
            Self::SqlAddSymbolicateTodo => -18,
            Self::SqlAddCrashLog => -17,
            Self::SqlAddVersion => -16,
            Self::SqlCheckVersionExists => -15,
            Self::SqlAddPattern => -14,
            Self::SqlCheckBugfixStatus => -13,
            Self::SqlUpdatePatternOccurrences => -12,
            Self::SqlFindKnownPatterns => -11,
            Self::SqlSearchAppName => -10,
            Self::InvalidPostData => -3,
            Self::InvalidIncomingData => -2,
            Self::DatabaseNotAvailable => -1,
            Self::Unknown => 0,
            Self::Assigned => 1,
            Self::Submitted => 2,
            Self::Available => 3,
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::VersionDiscontinued => "version discontinued",
            Self::SenderVersionNotAllowed => "sender version not allowed",
            Self::VersionNotAllowed => "version not allowed",
            Self::SqlAddSymbolicateTodo => "server failed to add symbolicate todo",
            Self::SqlAddCrashLog => "server failed to add crash log",
            Self::SqlAddVersion => "server failed to add version",
            Self::SqlCheckVersionExists => "server failed to check version",
            Self::SqlAddPattern => "server failed to add bug pattern",
            Self::SqlCheckBugfixStatus => "server failed to check bugfix status",
            Self::SqlUpdatePatternOccurrences => "server failed to update pattern occurrences",
            Self::SqlFindKnownPatterns => "server failed to find known patterns",
            Self::SqlSearchAppName => "server failed to find application",
            Self::InvalidPostData => "invalid post data",
            Self::InvalidIncomingData => "invalid incoming data",
            Self::DatabaseNotAvailable => "database not available",
            Self::Unknown => "unknown",
            Self::Assigned => "assigned",
            Self::Submitted => "submitted",
            Self::Available => "available",
        };
        write!(f, "{} ({})", text, self.code())
    }
}

/// Why a crash report was not accepted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RejectReason {
    DatastoreUnavailable,
    InvalidIncomingData,
    InvalidPostData,
    /// One of the internal server processing steps failed. (Codes -10 to -18.)
    ServerProcessing(ReportStatus),
    VersionNotAllowed,
    SenderVersionNotAllowed,
    VersionDiscontinued,
    /// The version was refused locally, before anything was sent.
    InvalidVersionFormat,
    /// The server answered with something which is not part of the protocol.
    UnknownServerStatus(String),
}

impl RejectReason {
    /// Terminal rejections can never succeed on resubmission.
    ///
    /// The report is considered processed after such rejection, otherwise the
    /// user would be asked about the same un-fixable report on every launch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::VersionNotAllowed
                | Self::SenderVersionNotAllowed
                | Self::VersionDiscontinued
                | Self::InvalidVersionFormat
        )
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DatastoreUnavailable => write!(f, "datastore unavailable"),
            Self::InvalidIncomingData => write!(f, "invalid incoming data"),
            Self::InvalidPostData => write!(f, "invalid post data"),
            Self::ServerProcessing(status) => write!(f, "server processing failure: {status}"),
            Self::VersionNotAllowed => write!(f, "version string not allowed"),
            Self::SenderVersionNotAllowed => write!(f, "sender version string not allowed"),
            Self::VersionDiscontinued => write!(f, "version discontinued"),
            Self::InvalidVersionFormat => write!(f, "invalid version format"),
            Self::UnknownServerStatus(answer) => write!(f, "unknown server status: {answer:?}"),
        }
    }
}

/// The outcome of a single submission attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum SubmissionResult {
    /// The server took the report.
    Accepted(ReportStatus),
    /// The server answered with the unknown status. Not an error, but the
    /// report is not considered delivered either.
    Indeterminate,
    /// The server (or the local validation) refused the report.
    Rejected(RejectReason),
    /// The server was not reached or did not answer properly.
    TransportFailed(TransportError),
}

impl SubmissionResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Whether the diagnostic shall be excluded from future scans.
    pub fn should_mark_processed(&self) -> bool {
        match self {
            Self::Accepted(_) => true,
            Self::Rejected(reason) => reason.is_terminal(),
            Self::Indeterminate | Self::TransportFailed(_) => false,
        }
    }
}

impl From<ReportStatus> for SubmissionResult {
    fn from(status: ReportStatus) -> Self {
        use ReportStatus::*;

        match status {
            Available | Submitted | Assigned => Self::Accepted(status),
            Unknown => Self::Indeterminate,
            DatabaseNotAvailable => Self::Rejected(RejectReason::DatastoreUnavailable),
            InvalidIncomingData => Self::Rejected(RejectReason::InvalidIncomingData),
            InvalidPostData => Self::Rejected(RejectReason::InvalidPostData),
            VersionNotAllowed => Self::Rejected(RejectReason::VersionNotAllowed),
            SenderVersionNotAllowed => Self::Rejected(RejectReason::SenderVersionNotAllowed),
            VersionDiscontinued => Self::Rejected(RejectReason::VersionDiscontinued),
            SqlAddSymbolicateTodo
            | SqlAddCrashLog
            | SqlAddVersion
            | SqlCheckVersionExists
            | SqlAddPattern
            | SqlCheckBugfixStatus
            | SqlUpdatePatternOccurrences
            | SqlFindKnownPatterns
            | SqlSearchAppName => Self::Rejected(RejectReason::ServerProcessing(status)),
        }
    }
}

impl fmt::Display for SubmissionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted(status) => write!(f, "accepted: {status}"),
            Self::Indeterminate => write!(f, "indeterminate"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::TransportFailed(error) => write!(f, "transport failed: {error}"),
        }
    }
}
