//! Request outcomes and their rendering into HTTP responses.

use std::collections::HashSet;

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::{self, HeaderValue};
use http::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use tracegate_trace::{DisclosureLevel, ErrorTrace};
use ulid::Ulid;

use crate::context::{Reply, ReplyBody};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The single terminal outcome of one request.
#[derive(Debug)]
pub enum Outcome {
    Responded(Reply),
    Failed(ErrorTrace),
    TimedOut(ErrorTrace),
}

impl Outcome {
    #[must_use]
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Responded(_) => OutcomeKind::Responded,
            Self::Failed(_) => OutcomeKind::Failed,
            Self::TimedOut(_) => OutcomeKind::TimedOut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Responded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionBody {
    Json(Value),
    File { name: String, bytes: Vec<u8> },
}

/// A fully serialized outcome, ready to be sent.
///
/// Traces have already been reduced to the configured disclosure level at
/// this point; nothing more detailed than that survives into a `Resolution`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    status: StatusCode,
    kind: OutcomeKind,
    body: ResolutionBody,
    warnings: Vec<String>,
    request_id: Ulid,
    allowed_origin: Option<String>,
}

impl Resolution {
    pub(crate) fn new(
        outcome: Outcome,
        warnings: &[ErrorTrace],
        level: DisclosureLevel,
        request_id: Ulid,
        allowed_origin: Option<String>,
    ) -> Self {
        let kind = outcome.kind();
        let (status, body, warnings) = match outcome {
            Outcome::Responded(reply) => {
                let warnings = serialize_warnings(warnings, level);
                let (status, body) = reply.into_parts();
                let body = match body {
                    ReplyBody::Json(fields) => ResolutionBody::Json(success_envelope(fields, &warnings)),
                    ReplyBody::File { name, bytes } => ResolutionBody::File { name, bytes },
                };
                (status, body, warnings)
            }
            Outcome::Failed(trace) | Outcome::TimedOut(trace) => {
                let mut envelope = Map::new();
                envelope.insert("error".to_string(), Value::String(trace.serialize(level)));
                (trace.status(), ResolutionBody::Json(Value::Object(envelope)), Vec::new())
            }
        };
        Self { status, kind, body, warnings, request_id, allowed_origin }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn kind(&self) -> OutcomeKind {
        self.kind
    }

    #[must_use]
    pub fn body(&self) -> &ResolutionBody {
        &self.body
    }

    /// Serialized warnings attached to a successful response.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// The client-facing error text, when the outcome was not a success.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match &self.body {
            ResolutionBody::Json(Value::Object(fields)) if self.kind != OutcomeKind::Responded => {
                fields.get("error").and_then(Value::as_str)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn request_id(&self) -> Ulid {
        self.request_id
    }
}

fn serialize_warnings(warnings: &[ErrorTrace], level: DisclosureLevel) -> Vec<String> {
    let mut seen = HashSet::new();
    warnings
        .iter()
        .map(|warning| warning.serialize(level))
        .filter(|text| seen.insert(text.clone()))
        .collect()
}

fn success_envelope(mut fields: Map<String, Value>, warnings: &[String]) -> Value {
    if !warnings.is_empty() {
        fields.insert(
            "warnings".to_string(),
            Value::Array(warnings.iter().cloned().map(Value::String).collect()),
        );
    }
    Value::Object(fields)
}

fn attachment_disposition(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

impl IntoResponse for Resolution {
    fn into_response(self) -> Response {
        let mut response = match self.body {
            ResolutionBody::Json(value) => (self.status, Json(value)).into_response(),
            ResolutionBody::File { name, bytes } => {
                let mut response = (self.status, bytes).into_response();
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                match HeaderValue::from_str(&attachment_disposition(&name)) {
                    Ok(value) => {
                        headers.insert(header::CONTENT_DISPOSITION, value);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "file name is not a valid header value");
                        headers.insert(
                            header::CONTENT_DISPOSITION,
                            HeaderValue::from_static("attachment"),
                        );
                    }
                }
                response
            }
        };

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&self.request_id.to_string()) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        if let Some(origin) = self.allowed_origin {
            match HeaderValue::from_str(&origin) {
                Ok(value) => {
                    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                }
                Err(err) => tracing::warn!(error = %err, origin = %origin, "allowed origin is not a valid header value"),
            }
        }
        response
    }
}
