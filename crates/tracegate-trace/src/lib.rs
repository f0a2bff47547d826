#![forbid(unsafe_code)]
//! Accumulating error traces with per-audience disclosure levels.
//!
//! A trace is a stack of *disjunctions*. Each disjunction describes one
//! abstraction level of a failure ("could not log in", "invalid username")
//! and may carry several alternative wordings, each tagged with the
//! [`DisclosureLevel`] it is safe to show at. Every layer that sees a failure
//! pass through it wraps the trace with its own framing via
//! [`ErrorTrace::append`] instead of replacing it, and decides per layer how
//! much of its own contribution each audience may see.
//!
//! ```
//! use http::StatusCode;
//! use tracegate_trace::{DisclosureLevel, ErrorTrace};
//!
//! let trace = ErrorTrace::new()
//!     .with_status(StatusCode::NOT_FOUND)
//!     .append(DisclosureLevel::Debug, "no row for source 42")
//!     .append(DisclosureLevel::Wordy, "Could not fetch CalDAV source")
//!     .alt(DisclosureLevel::Plain, "Could not fetch source");
//!
//! assert_eq!(trace.serialize(DisclosureLevel::Plain), "Could not fetch source");
//! assert_eq!(
//!     trace.serialize(DisclosureLevel::Debug),
//!     "Could not fetch CalDAV source: No row for source 42"
//! );
//! ```

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use http::StatusCode;
use serde::{Deserialize, Serialize};

mod remote;

pub use remote::interpret_remote_error;

/// How much detail of a failure an audience may see.
///
/// Ordered from most to least detailed. A message tagged with level `L` is
/// visible to every audience cleared for `L` or for anything more detailed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DisclosureLevel {
    /// Internal identifiers and raw driver errors. Never served to clients in
    /// production.
    Debug,
    /// Technical nouns ("CalDAV source", "database") without identifiers.
    Wordy,
    /// Domain nouns only ("source", "calendar").
    Plain,
    /// Only the attempted action ("could not log in").
    Broad,
}

impl DisclosureLevel {
    pub const ALL: [Self; 4] = [Self::Debug, Self::Wordy, Self::Plain, Self::Broad];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Wordy => "wordy",
            Self::Plain => "plain",
            Self::Broad => "broad",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "wordy" => Some(Self::Wordy),
            "plain" => Some(Self::Plain),
            "broad" => Some(Self::Broad),
            _ => None,
        }
    }
}

impl Display for DisclosureLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("unknown disclosure level `{0}` (expected debug, wordy, plain or broad)")]
pub struct UnknownDisclosureLevel(pub String);

impl FromStr for DisclosureLevel {
    type Err = UnknownDisclosureLevel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| UnknownDisclosureLevel(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    level: DisclosureLevel,
    message: String,
}

impl Entry {
    fn new(level: DisclosureLevel, message: String) -> Self {
        Self { level, message }
    }
}

/// An error value that accumulates framing as it travels up the call stack.
///
/// Messages should be capitalized and carry no trailing punctuation; the
/// serializer capitalizes the first letter anyway and lower-cases joined
/// conjunctions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTrace {
    status: StatusCode,
    // Innermost cause first. The last disjunction is the outermost frame.
    disjunctions: Vec<Vec<Entry>>,
}

impl Default for ErrorTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorTrace {
    #[must_use]
    pub fn new() -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, disjunctions: Vec::new() }
    }

    /// Sets the outcome classification. May be called at any point in the
    /// chain; the last call wins.
    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Wraps the trace in a new, more abstract frame.
    #[must_use]
    pub fn append(mut self, level: DisclosureLevel, message: impl Into<String>) -> Self {
        self.disjunctions.push(vec![Entry::new(level, message.into())]);
        self
    }

    #[must_use]
    pub fn append_error<E>(self, level: DisclosureLevel, err: &E) -> Self
    where
        E: Display + ?Sized,
    {
        self.append(level, err.to_string())
    }

    /// Like [`ErrorTrace::append_error`], but an absent error still consumes
    /// a frame (with an empty message) so the trace keeps a predictable shape.
    #[must_use]
    pub fn append_optional_error<E>(self, level: DisclosureLevel, err: Option<E>) -> Self
    where
        E: Display,
    {
        let message = err.map(|err| err.to_string()).unwrap_or_default();
        self.append(level, message)
    }

    /// Joins another cause onto the outermost frame ("X and Y").
    ///
    /// The fragment shares the level of the entry it is joined to. On an
    /// empty trace this opens a `Debug` frame instead.
    #[must_use]
    pub fn and(mut self, message: impl Into<String>) -> Self {
        let fragment = message.into();
        if self.disjunctions.is_empty() {
            return self.append(DisclosureLevel::Debug, fragment);
        }
        if let Some(entry) = self.disjunctions.last_mut().and_then(|alts| alts.last_mut()) {
            join_conjunction(&mut entry.message, &fragment);
        }
        self
    }

    #[must_use]
    pub fn and_error<E>(self, err: &E) -> Self
    where
        E: Display + ?Sized,
    {
        self.and(err.to_string())
    }

    /// Adds another wording of the outermost frame at a different level.
    /// Degrades to [`ErrorTrace::append`] on an empty trace.
    #[must_use]
    pub fn alt(mut self, level: DisclosureLevel, message: impl Into<String>) -> Self {
        if self.disjunctions.is_empty() {
            return self.append(level, message);
        }
        if let Some(alternatives) = self.disjunctions.last_mut() {
            alternatives.push(Entry::new(level, message.into()));
        }
        self
    }

    #[must_use]
    pub fn alt_error<E>(self, level: DisclosureLevel, err: &E) -> Self
    where
        E: Display + ?Sized,
    {
        self.alt(level, err.to_string())
    }

    /// Forces every frame down to at most `max` detail.
    ///
    /// Alternatives more detailed than `max` are redacted outright, so they
    /// are never serialized again, not even for a `Debug` audience. A frame
    /// left without alternatives keeps its slot as an empty entry.
    #[must_use]
    pub fn cap_level(mut self, max: DisclosureLevel) -> Self {
        for alternatives in &mut self.disjunctions {
            alternatives.retain(|entry| entry.level >= max);
            if alternatives.is_empty() {
                alternatives.push(Entry::new(max, String::new()));
            }
        }
        self
    }

    /// Renders the trace for an audience cleared for `requested`.
    ///
    /// Frames are rendered outermost first and joined with `": "`. Per frame
    /// the most detailed permitted alternative is chosen; frames with nothing
    /// permitted, or whose choice is empty, are skipped and repeated segments
    /// are dropped. An empty rendering falls back to the status reason phrase.
    #[must_use]
    pub fn serialize(&self, requested: DisclosureLevel) -> String {
        let mut seen = HashSet::new();
        let mut segments = Vec::with_capacity(self.disjunctions.len());

        for alternatives in self.disjunctions.iter().rev() {
            let Some(chosen) = alternatives
                .iter()
                .filter(|entry| entry.level >= requested)
                .min_by_key(|entry| entry.level)
            else {
                continue;
            };
            if chosen.message.is_empty() {
                continue;
            }

            let rendered = capitalize_first(&chosen.message);
            if seen.insert(rendered.clone()) {
                segments.push(rendered);
            }
        }

        if segments.is_empty() {
            return self.generic_text().to_string();
        }
        segments.join(": ")
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.disjunctions.is_empty()
    }

    /// Number of frames (disjunctions) recorded so far.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.disjunctions.len()
    }

    fn generic_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("Unknown Error")
    }
}

impl Display for ErrorTrace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialize(DisclosureLevel::Debug))
    }
}

impl std::error::Error for ErrorTrace {}

fn join_conjunction(existing: &mut String, fragment: &str) {
    if existing.is_empty() {
        fragment.clone_into(existing);
    } else if !fragment.is_empty() {
        existing.push_str(" and ");
        existing.push_str(&lowercase_first(fragment));
    }
}

fn capitalize_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn lowercase_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}
