//! Header allow-lists between HTTP and RPC metadata.
//!
//! A matcher receives a header or metadata key in lower case and returns the
//! key to forward it under, or `None` to drop it.

use std::sync::Arc;

use rpcgate_core::metadata;

pub type HeaderMatcher = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// HTTP headers with a fixed meaning that are forwarded only under the
/// `grpcgateway-` prefix.
const PERMANENT_HEADERS: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-language",
    "accept-ranges",
    "authorization",
    "cache-control",
    "content-type",
    "cookie",
    "date",
    "expect",
    "from",
    "host",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-schedule-tag-match",
    "if-unmodified-since",
    "max-forwards",
    "origin",
    "pragma",
    "referer",
    "user-agent",
    "via",
    "warning",
];

#[must_use]
pub fn is_permanent_header(name: &str) -> bool {
    PERMANENT_HEADERS.contains(&name)
}

/// Permanent headers become `grpcgateway-<name>`, `grpc-metadata-<key>`
/// becomes `<key>`, everything else is dropped.
#[must_use]
pub fn default_incoming(name: &str) -> Option<String> {
    if is_permanent_header(name) {
        return Some(format!("{}{name}", metadata::GATEWAY_PREFIX));
    }
    name.strip_prefix(metadata::METADATA_HEADER_PREFIX)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
}

/// Passes only `x-request-id`, as `X-REQUEST-ID`.
#[must_use]
pub fn default_outgoing(name: &str) -> Option<String> {
    (name == metadata::X_REQUEST_ID).then(|| name.to_ascii_uppercase())
}

/// Drops every entry.
#[must_use]
pub fn deny_all(_name: &str) -> Option<String> {
    None
}

#[must_use]
pub fn incoming_matcher() -> HeaderMatcher {
    Arc::new(default_incoming)
}

#[must_use]
pub fn outgoing_matcher() -> HeaderMatcher {
    Arc::new(default_outgoing)
}
