//! `Surrogate-Control` / `Surrogate-Capability` handling and the header changes applied to
//! responses that get processed.

use fastly::http::header;
use fastly::{Request, Response};
use log::debug;

pub(crate) const SURROGATE_CONTROL: &str = "Surrogate-Control";
pub(crate) const SURROGATE_CAPABILITY: &str = "Surrogate-Capability";

// Highest ESI version this processor understands.
const SUPPORTED_VERSION: (u32, u32) = (1, 0);

/// Iterates the `name=value` directives of a comma separated header. Values are unquoted.
pub fn directives(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.split(',').filter_map(|part| {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        Some(match part.split_once('=') {
            Some((name, value)) => (name.trim(), value.trim().trim_matches('"')),
            None => (part, ""),
        })
    })
}

/// Returns the value of `directive` in `header`, compared case-insensitively.
pub fn directive_value<'a>(header: &'a str, directive: &str) -> Option<&'a str> {
    directives(header)
        .find(|(name, _)| name.eq_ignore_ascii_case(directive))
        .map(|(_, value)| value)
}

/// Whether a whitespace separated capability list names an ESI version this processor can
/// handle, e.g. `ESI/1.0` or `ESI/0.8 ESI-Inline/1.0`.
pub fn esi_version_supported(capabilities: &str) -> bool {
    capabilities
        .split_whitespace()
        .filter_map(parse_esi_version)
        .any(|version| version <= SUPPORTED_VERSION)
}

fn parse_esi_version(token: &str) -> Option<(u32, u32)> {
    let (major, minor) = token.strip_prefix("ESI/")?.split_once('.')?;
    let number = |s: &str| {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse::<u32>().ok()
    };
    Some((number(major)?, number(minor)?))
}

/// Whether the origin asked for ESI processing with `Surrogate-Control: content="ESI/1.0"`.
pub fn response_requests_esi(response: &Response) -> bool {
    response
        .get_header(SURROGATE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| directive_value(value, "content"))
        .is_some_and(esi_version_supported)
}

/// Whether some surrogate between the client and us, other than the device named
/// `own_token`, advertises that it can process ESI.
pub fn downstream_supports_esi(request: &Request, own_token: &str) -> bool {
    request
        .get_header_all(SURROGATE_CAPABILITY)
        .filter_map(|value| value.to_str().ok())
        .flat_map(directives)
        .any(|(device, capabilities)| {
            device != own_token && esi_version_supported(capabilities)
        })
}

/// Adds `{token}="ESI/1.0"` to the request's `Surrogate-Capability` header.
pub fn advertise_surrogate_capability(request: &mut Request, token: &str) {
    let capability = format!("{token}=\"ESI/1.0\"");
    let value = match request
        .get_header(SURROGATE_CAPABILITY)
        .and_then(|value| value.to_str().ok())
    {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {capability}"),
        _ => capability,
    };
    request.set_header(SURROGATE_CAPABILITY, value);
}

/// Header changes for a response whose body is rewritten on the way to the client.
pub fn shape_processed_response(response: &mut Response) {
    debug!("processing ESI, disabling downstream caching");
    response.set_header(header::CACHE_CONTROL, "private, max-age=0");
    response.remove_header(header::LAST_MODIFIED);
    response.remove_header(header::ETAG);
    response.remove_header(header::CONTENT_LENGTH);
    response.remove_header(SURROGATE_CONTROL);
}
