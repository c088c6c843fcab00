// SPDX-License-Identifier: GPL-3.0-or-later

//! This module builds the crash report payload which is sent to the server.
//!
//! The payload is an XML document with a single crash entry. The free text
//! fields (the user's description and the crash log itself) are embedded as
//! CDATA sections. Since the text may contain the CDATA terminator, the text
//! is split at every terminator into adjacent CDATA sections. XML parsers
//! concatenate those, so the text arrives unmodified. Except the line endings:
//! XML parsers turn every `\r\n` and `\r` into `\n`, so the builder does the
//! same up front, and the payload is what the server will see.
//!
//! ```xml
//! <crashes>
//!   <crash>
//!     <applicationname>Example</applicationname>
//!     <bundleidentifier>com.example.app</bundleidentifier>
//!     <systemversion>macos</systemversion>
//!     <platform>aarch64</platform>
//!     <senderversion>1.4</senderversion>
//!     <version>1402</version>
//!     <userid></userid>
//!     <contact></contact>
//!     <description><![CDATA[It crashed when I pressed save.]]></description>
//!     <log><![CDATA[Process: Example [4242] ...]]></log>
//!   </crash>
//! </crashes>
//! ```
//!
//! (The real document has no whitespace between the elements.)

use crate::diagnostic::CrashDiagnostic;
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Separates the individual crash logs when several are shown to the user at once.
pub const CRASH_LOG_SEPARATOR: &str = "\n\n-------------------------------------------------------------\n\n";

const CDATA_TERMINATOR: &str = "]]>";

/// Metadata of the application the crash reports are about.
///
/// When the reports are about a plugin of a host application, this is the
/// plugin's metadata while the store scans for the host's report files.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppMetadata {
    pub name: String,
    /// The build version.
    pub version: String,
    /// The marketing version, sent as the sender version.
    pub short_version: String,
    pub identifier: String,
    /// Shown by the user interface, never sent to the server.
    pub icon: Option<PathBuf>,
}

/// Describes the machine the report is sent from.
#[derive(Clone, Debug, PartialEq)]
pub struct SystemInfo {
    pub system_version: String,
    pub platform: String,
}

impl SystemInfo {
    pub fn current() -> Self {
        Self {
            system_version: format!("{} {}", std::env::consts::FAMILY, std::env::consts::OS),
            platform: std::env::consts::ARCH.to_string(),
        }
    }
}

/// What the user (or the host application) tells about the crash.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReportDetails {
    pub description: String,
    pub user_id: Option<String>,
    pub contact: Option<String>,
}

/// The submission payload. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportPayload {
    pub crash_log: String,
    pub description: String,
    pub user_id: Option<String>,
    pub contact: Option<String>,
    pub application_name: String,
    pub application_identifier: String,
    pub version: String,
    pub sender_version: String,
    pub system_version: String,
    pub platform: String,
    pub icon: Option<PathBuf>,
}

/// The payload together with the tenant of a multi-tenant server, as parsed
/// back from a wire document.
#[derive(Clone, Debug, PartialEq)]
pub struct WireDocument {
    pub payload: ReportPayload,
    pub app_identifier: Option<String>,
}

/// Errors of the payload construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("Version field '{field}' contains characters other than alphanumeric, space and dot: {value:?}")]
    InvalidVersionFormat { field: &'static str, value: String },
}

/// Errors of the payload (de)serialization.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("Payload misses the '{0}' element")]
    MissingField(&'static str),
}

/// Version strings are limited to alphanumeric characters, space and dot.
///
/// The server refuses anything else, so there is no point to send it.
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty() && version.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '.')
}

/// Builds payloads for one application.
#[derive(Clone, Debug)]
pub struct ReportBuilder {
    app: AppMetadata,
    system: SystemInfo,
}

impl ReportBuilder {
    pub fn new(app: AppMetadata, system: SystemInfo) -> Self {
        Self { app, system }
    }

    pub fn app(&self) -> &AppMetadata {
        &self.app
    }

    /// Build the payload for a single diagnostic.
    ///
    /// Fails when the version fields would be rejected by the server.
    pub fn build(
        &self,
        diagnostic: &CrashDiagnostic,
        details: &ReportDetails,
    ) -> Result<ReportPayload, BuildError> {
        if !is_valid_version(&self.app.version) {
            return Err(BuildError::InvalidVersionFormat { field: "version", value: self.app.version.clone() });
        }
        if !is_valid_version(&self.app.short_version) {
            return Err(BuildError::InvalidVersionFormat {
                field: "senderversion",
                value: self.app.short_version.clone(),
            });
        }

        Ok(ReportPayload {
            crash_log: normalize_line_endings(&diagnostic.content),
            description: normalize_line_endings(&details.description),
            user_id: details.user_id.clone().filter(|value| !value.is_empty()),
            contact: details.contact.clone().filter(|value| !value.is_empty()),
            application_name: self.app.name.clone(),
            application_identifier: self.app.identifier.clone(),
            version: self.app.version.clone(),
            sender_version: self.app.short_version.clone(),
            system_version: self.system.system_version.clone(),
            platform: self.system.platform.clone(),
            icon: self.app.icon.clone(),
        })
    }
}

impl ReportPayload {
    /// Render the wire document. The tenant identifier is included when given.
    pub fn to_xml(&self, app_identifier: Option<&str>) -> Result<String, PayloadError> {
        let mut writer = Writer::new(Vec::new());

        writer.write_event(Event::Start(BytesStart::new("crashes")))?;
        writer.write_event(Event::Start(BytesStart::new("crash")))?;
        write_text(&mut writer, "applicationname", &self.application_name)?;
        write_text(&mut writer, "bundleidentifier", &self.application_identifier)?;
        write_text(&mut writer, "systemversion", &self.system_version)?;
        write_text(&mut writer, "platform", &self.platform)?;
        write_text(&mut writer, "senderversion", &self.sender_version)?;
        write_text(&mut writer, "version", &self.version)?;
        if let Some(app_identifier) = app_identifier {
            write_text(&mut writer, "appidentifier", app_identifier)?;
        }
        write_text(&mut writer, "userid", self.user_id.as_deref().unwrap_or_default())?;
        write_text(&mut writer, "contact", self.contact.as_deref().unwrap_or_default())?;
        write_cdata(&mut writer, "description", &self.description)?;
        write_cdata(&mut writer, "log", &self.crash_log)?;
        writer.write_event(Event::End(BytesEnd::new("crash")))?;
        writer.write_event(Event::End(BytesEnd::new("crashes")))?;

        let document = String::from_utf8(writer.into_inner()).map_err(|error| error.utf8_error())?;
        Ok(document)
    }

    /// Parse a wire document back into the payload.
    pub fn from_xml(document: &str) -> Result<WireDocument, PayloadError> {
        let mut reader = Reader::from_str(document);
        let mut fields: HashMap<String, String> = HashMap::new();
        let mut current: Option<String> = None;
        let mut buffer = String::new();

        loop {
            match reader.read_event()? {
                Event::Start(element) => {
                    current = Some(String::from_utf8_lossy(element.name().as_ref()).into_owned());
                    buffer.clear();
                }
                Event::Empty(element) => {
                    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                    fields.insert(name, String::new());
                }
                Event::Text(text) => buffer.push_str(&text.unescape()?),
                Event::CData(data) => buffer.push_str(std::str::from_utf8(&data.into_inner())?),
                Event::End(_) => {
                    if let Some(name) = current.take() {
                        fields.insert(name, std::mem::take(&mut buffer));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let user_id = fields.remove("userid").filter(|value| !value.is_empty());
        let contact = fields.remove("contact").filter(|value| !value.is_empty());
        let app_identifier = fields.remove("appidentifier");

        let mut required = |name: &'static str| fields.remove(name).ok_or(PayloadError::MissingField(name));
        let payload = ReportPayload {
            application_name: required("applicationname")?,
            application_identifier: required("bundleidentifier")?,
            system_version: required("systemversion")?,
            platform: required("platform")?,
            sender_version: required("senderversion")?,
            version: required("version")?,
            description: required("description")?,
            crash_log: required("log")?,
            user_id,
            contact,
            icon: None,
        };

        Ok(WireDocument { payload, app_identifier })
    }
}

/// Line endings as an XML parser reports them.
fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn write_text(writer: &mut Writer<Vec<u8>>, name: &str, value: &str) -> Result<(), quick_xml::Error> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_cdata(writer: &mut Writer<Vec<u8>>, name: &str, value: &str) -> Result<(), quick_xml::Error> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    for section in cdata_sections(value) {
        writer.write_event(Event::CData(BytesCData::new(section)))?;
    }
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Split the text into pieces which are safe to put into a CDATA section.
///
/// The text is cut between the `]]` and the `>` of every terminator, so no
/// piece contains a complete terminator. The pieces concatenated give back
/// the input text.
pub fn cdata_sections(text: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut start = 0;
    for (position, _) in text.match_indices(CDATA_TERMINATOR) {
        let cut = position + 2;
        sections.push(&text[start..cut]);
        start = cut;
    }
    sections.push(&text[start..]);
    sections
}

/// Join crash logs for displaying them together.
pub fn join_crash_logs<'a>(logs: impl IntoIterator<Item = &'a str>) -> String {
    logs.into_iter().collect::<Vec<_>>().join(CRASH_LOG_SEPARATOR)
}
