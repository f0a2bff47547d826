use std::fmt::Display;

use http::StatusCode;

use crate::{DisclosureLevel, ErrorTrace};

/// Turns an error from an outbound call into a trace the caller can wrap.
///
/// `resource` names the remote end in domain terms ("source"),
/// `wordy_resource` in technical terms ("CalDAV server"). The raw error is
/// always kept as the innermost `Debug` frame.
#[must_use]
pub fn interpret_remote_error<E>(err: &E, resource: &str, wordy_resource: &str) -> ErrorTrace
where
    E: Display + ?Sized,
{
    let diagnostic = err.to_string();
    let normalized = diagnostic.to_ascii_lowercase();
    let base = ErrorTrace::new().append(DisclosureLevel::Debug, diagnostic);

    if normalized.contains("unauthorized") {
        return base
            .with_status(StatusCode::UNAUTHORIZED)
            .append(DisclosureLevel::Wordy, format!("Unauthorized access to {wordy_resource}"))
            .alt(DisclosureLevel::Plain, "Wrong credentials");
    }

    if normalized.contains("not found") {
        return base
            .with_status(StatusCode::NOT_FOUND)
            .append(DisclosureLevel::Wordy, format!("{wordy_resource} not found"))
            .alt(DisclosureLevel::Plain, format!("{resource} not found"));
    }

    if normalized.contains("forbidden") {
        return base
            .with_status(StatusCode::FORBIDDEN)
            .append(DisclosureLevel::Wordy, format!("Access to {wordy_resource} forbidden"))
            .alt(DisclosureLevel::Plain, "Access forbidden");
    }

    if normalized.contains("service unavailable") {
        return base
            .with_status(StatusCode::SERVICE_UNAVAILABLE)
            .append(DisclosureLevel::Wordy, format!("{wordy_resource} temporarily unavailable"))
            .alt(DisclosureLevel::Plain, format!("{resource} temporarily unavailable"));
    }

    if normalized.contains("internal server error") {
        return base
            .with_status(StatusCode::INTERNAL_SERVER_ERROR)
            .append(DisclosureLevel::Plain, "Remote server returned an error");
    }

    if normalized.contains("bad request") || normalized.contains("method not allowed") {
        return base
            .with_status(StatusCode::BAD_REQUEST)
            .append(DisclosureLevel::Wordy, format!("Bad request to {wordy_resource}"))
            .alt(
                DisclosureLevel::Plain,
                format!("Bad request to {resource}, are you sure the URL is correct?"),
            );
    }

    if normalized.contains("connection refused") {
        return base
            .with_status(StatusCode::SERVICE_UNAVAILABLE)
            .append(DisclosureLevel::Wordy, format!("Connection to {wordy_resource} refused"))
            .alt(DisclosureLevel::Plain, format!("Connection refused to {resource}"));
    }

    if normalized.contains("connection reset") {
        return base
            .with_status(StatusCode::SERVICE_UNAVAILABLE)
            .append(DisclosureLevel::Wordy, format!("Connection to {wordy_resource} reset by peer"))
            .alt(DisclosureLevel::Plain, format!("Connection to {resource} reset by peer"));
    }

    if normalized.contains("no such host")
        || normalized.contains("failed to lookup address")
        || normalized.contains("dns error")
    {
        return base
            .with_status(StatusCode::SERVICE_UNAVAILABLE)
            .append(DisclosureLevel::Wordy, format!("Could not resolve {wordy_resource}"))
            .alt(DisclosureLevel::Plain, format!("Could not resolve {resource}"));
    }

    if normalized.contains("error trying to connect") || normalized.contains("tcp connect") {
        return base
            .with_status(StatusCode::SERVICE_UNAVAILABLE)
            .append(DisclosureLevel::Wordy, format!("Could not connect to {wordy_resource}"))
            .alt(DisclosureLevel::Plain, format!("Could not connect to {resource}"));
    }

    base.with_status(StatusCode::INTERNAL_SERVER_ERROR)
        .append(DisclosureLevel::Debug, format!("Could not query {wordy_resource}"))
}
