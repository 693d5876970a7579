//! Line protocol spoken by runner scripts.
//!
//! Runner scripts write one message per line on standard output:
//!
//! ```text
//! !!_!! free text                      raw diagnostic, forwarded to tracing
//! #_#TestDone#_# {"testCase": {...}}   wrapped event with a JSON payload
//! ```
//!
//! Event kinds are `FileStart`, `TestStart`, `TestDone`, `Log`, `Error`,
//! `CoverageObject` and `FileDone`. `FileDone` is terminal: the script writes
//! it last, right before exiting.
//!
//! Decoding favours partial results over strictness. A payload that fails to
//! parse is degraded to a [`Event::Log`] carrying the raw payload text. The
//! one exception is `FileDone`, whose `failed` count decides the disposition
//! of the whole file; a malformed `FileDone` is a [`ProtocolError`].
//!
//! # Example
//!
//! ```
//! use chutzpah::protocol::{decode_line, Event, Line};
//!
//! let line = decode_line(r#"#_#FileDone#_# {"timetaken": 12, "passed": 3, "failed": 1}"#).unwrap();
//! match line {
//!     Line::Event(Event::FileDone(done)) => assert_eq!(done.failed, 1),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Prefix of raw diagnostic lines.
pub const RAW_PREFIX: &str = "!!_!!";

/// Marker surrounding the event kind of wrapped event lines.
pub const EVENT_MARKER: &str = "#_#";

/// Raw lines that still show the page is making progress.
static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:resource (?:requested|received|error)|page (?:loading|loaded))\b")
        .expect("progress pattern is valid")
});

/// Result type for protocol decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that survive decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A `FileDone` payload could not be parsed.
    #[error("Malformed FileDone payload '{payload}': {source}")]
    MalformedFileDone {
        payload: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Kinds of wrapped events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FileStart,
    TestStart,
    TestDone,
    Log,
    Error,
    CoverageObject,
    FileDone,
}

impl EventKind {
    /// Name as it appears between the markers.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::FileStart => "FileStart",
            EventKind::TestStart => "TestStart",
            EventKind::TestDone => "TestDone",
            EventKind::Log => "Log",
            EventKind::Error => "Error",
            EventKind::CoverageObject => "CoverageObject",
            EventKind::FileDone => "FileDone",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FileStart" => Ok(EventKind::FileStart),
            "TestStart" => Ok(EventKind::TestStart),
            "TestDone" => Ok(EventKind::TestDone),
            "Log" => Ok(EventKind::Log),
            "Error" => Ok(EventKind::Error),
            "CoverageObject" => Ok(EventKind::CoverageObject),
            "FileDone" => Ok(EventKind::FileDone),
            other => Err(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of `FileStart`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FileStartPayload {}

/// Payload of `TestStart` and `TestDone`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseEvent {
    pub test_case: TestCasePayload,
}

/// A test case as serialized by runner scripts.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCasePayload {
    #[serde(default)]
    pub module_name: String,
    pub test_name: String,
    /// Milliseconds.
    #[serde(default)]
    pub time_taken: u64,
    #[serde(default)]
    pub test_results: Vec<TestResultPayload>,
    #[serde(default)]
    pub skipped: bool,
}

/// One assertion inside a [`TestCasePayload`].
///
/// `expected` and `actual` are whatever JSON the framework reported.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultPayload {
    #[serde(default)]
    pub passed: bool,
    pub message: Option<String>,
    pub expected: Option<serde_json::Value>,
    pub actual: Option<serde_json::Value>,
    pub stack_trace: Option<String>,
}

/// Payload of `Log`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogEvent {
    pub log: LogPayload,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogPayload {
    pub message: String,
}

/// Payload of `Error`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorEvent {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub stack_as_string: Option<String>,
    #[serde(default)]
    pub stack: Vec<StackFrame>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StackFrame {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub line: u32,
}

impl ErrorPayload {
    /// Stack rendered as text, preferring the script's own rendering.
    pub fn stack_text(&self) -> Option<String> {
        if let Some(stack) = &self.stack_as_string {
            return Some(stack.clone());
        }
        if self.stack.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .stack
            .iter()
            .map(|f| format!("at {} in {}:{}", f.function, f.file, f.line))
            .collect();
        Some(lines.join("\n"))
    }
}

/// Payload of `CoverageObject`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CoverageEvent {
    pub object: serde_json::Value,
}

/// Payload of `FileDone`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FileDonePayload {
    /// Milliseconds.
    #[serde(default)]
    pub timetaken: u64,
    #[serde(default)]
    pub passed: u32,
    pub failed: u32,
}

/// A decoded wrapped event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    FileStart(FileStartPayload),
    TestStart(TestCaseEvent),
    TestDone(TestCaseEvent),
    Log(LogEvent),
    Error(ErrorEvent),
    CoverageObject(CoverageEvent),
    FileDone(FileDonePayload),
}

impl Event {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FileStart(_) => EventKind::FileStart,
            Event::TestStart(_) => EventKind::TestStart,
            Event::TestDone(_) => EventKind::TestDone,
            Event::Log(_) => EventKind::Log,
            Event::Error(_) => EventKind::Error,
            Event::CoverageObject(_) => EventKind::CoverageObject,
            Event::FileDone(_) => EventKind::FileDone,
        }
    }

    /// A log event with the given message.
    pub fn log(message: impl Into<String>) -> Self {
        Event::Log(LogEvent {
            log: LogPayload {
                message: message.into(),
            },
        })
    }

    /// Returns `true` for `FileDone`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::FileDone(_))
    }
}

/// One decoded output line.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    /// A `!!_!!` diagnostic line, prefix stripped.
    Raw(String),
    /// A wrapped event.
    Event(Event),
    /// Anything else the process printed.
    Other(String),
}

impl Line {
    /// Whether this line proves the producer is still making progress.
    ///
    /// Every event counts. Raw lines only count when they report page or
    /// resource progress; plain chatter does not.
    pub fn refreshes_liveness(&self) -> bool {
        match self {
            Line::Event(_) => true,
            Line::Raw(text) => PROGRESS_LINE.is_match(text),
            Line::Other(_) => false,
        }
    }
}

/// Decodes one output line.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedFileDone`] when a `FileDone` payload is
/// not valid JSON of the expected shape. Every other malformed payload is
/// degraded to a log event.
pub fn decode_line(line: &str) -> ProtocolResult<Line> {
    let line = line.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim_start();

    if let Some(rest) = trimmed.strip_prefix(RAW_PREFIX) {
        return Ok(Line::Raw(rest.trim_start().to_string()));
    }

    let Some(rest) = trimmed.strip_prefix(EVENT_MARKER) else {
        return Ok(Line::Other(line.to_string()));
    };
    let Some((kind, payload)) = rest.split_once(EVENT_MARKER) else {
        return Ok(Line::Other(line.to_string()));
    };
    let kind = match kind.parse::<EventKind>() {
        Ok(kind) => kind,
        Err(unknown) => {
            debug!("Ignoring event of unknown kind '{}'", unknown);
            return Ok(Line::Other(line.to_string()));
        }
    };

    decode_event(kind, payload.trim()).map(Line::Event)
}

fn decode_event(kind: EventKind, payload: &str) -> ProtocolResult<Event> {
    let parsed = match kind {
        EventKind::FileStart => serde_json::from_str(payload).map(Event::FileStart),
        EventKind::TestStart => serde_json::from_str(payload).map(Event::TestStart),
        EventKind::TestDone => serde_json::from_str(payload).map(Event::TestDone),
        EventKind::Log => serde_json::from_str(payload).map(Event::Log),
        EventKind::Error => serde_json::from_str(payload).map(Event::Error),
        EventKind::CoverageObject => serde_json::from_str(payload).map(Event::CoverageObject),
        EventKind::FileDone => {
            return serde_json::from_str(payload)
                .map(Event::FileDone)
                .map_err(|source| ProtocolError::MalformedFileDone {
                    payload: payload.to_string(),
                    source,
                });
        }
    };

    Ok(parsed.unwrap_or_else(|e| {
        debug!("Degrading malformed {} payload to a log line: {}", kind, e);
        Event::log(payload)
    }))
}

/// Encodes an event the way runner scripts write it.
///
/// # Example
///
/// ```
/// use chutzpah::protocol::{encode_event, Event, FileDonePayload};
///
/// let line = encode_event(&Event::FileDone(FileDonePayload { timetaken: 5, passed: 1, failed: 0 }));
/// assert!(line.starts_with("#_#FileDone#_# {"));
/// ```
pub fn encode_event(event: &Event) -> String {
    let payload = match event {
        Event::FileStart(p) => serde_json::to_string(p),
        Event::TestStart(p) | Event::TestDone(p) => serde_json::to_string(p),
        Event::Log(p) => serde_json::to_string(p),
        Event::Error(p) => serde_json::to_string(p),
        Event::CoverageObject(p) => serde_json::to_string(p),
        Event::FileDone(p) => serde_json::to_string(p),
    }
    .unwrap_or_else(|_| "{}".to_string());
    format!("{}{}{} {}", EVENT_MARKER, event.kind(), EVENT_MARKER, payload)
}

/// Encodes a raw diagnostic line.
pub fn encode_raw(text: &str) -> String {
    format!("{} {}", RAW_PREFIX, text)
}
