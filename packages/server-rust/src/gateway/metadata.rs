//! Inbound HTTP request to RPC metadata.

use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{self, HeaderName, HeaderValue};
use http::request::Parts;
use http::HeaderMap;
use rpcgate_core::metadata;

use super::headers::HeaderMatcher;

/// Adds metadata derived from the HTTP request, after header matching.
pub trait MetadataModifier: Send + Sync {
    fn metadata(&self, parts: &Parts) -> HeaderMap;
}

/// Copies the `authorization` cookie (name matched case-insensitively) into
/// the `authorization` metadata entry. No other cookie is bridged.
#[derive(Debug, Clone, Copy, Default)]
pub struct CookieAuthorization;

impl MetadataModifier for CookieAuthorization {
    fn metadata(&self, parts: &Parts) -> HeaderMap {
        let mut md = HeaderMap::new();
        let token = parts
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .filter(|(name, _)| name.trim().eq_ignore_ascii_case(metadata::AUTHORIZATION))
            .map(|(_, value)| value.trim().trim_matches('"'))
            .last();
        if let Some(value) = token.and_then(|v| HeaderValue::from_str(v).ok()) {
            md.insert(header::AUTHORIZATION, value);
        }
        md
    }
}

/// The route a request matched.
#[derive(Debug, Clone, Copy)]
pub struct RouteInfo<'a> {
    pub pattern: &'a str,
    pub rpc_method: &'a str,
}

/// Builds the metadata sent with the translated call.
#[must_use]
pub fn inbound_metadata(
    parts: &Parts,
    route: Option<RouteInfo<'_>>,
    peer: Option<SocketAddr>,
    incoming: &HeaderMatcher,
    modifiers: &[Arc<dyn MetadataModifier>],
) -> HeaderMap {
    let mut md = HeaderMap::new();

    for (name, value) in &parts.headers {
        if name == header::AUTHORIZATION {
            md.append(header::AUTHORIZATION, value.clone());
        }
        if name == header::HOST || name.as_str() == metadata::X_FORWARDED_FOR {
            continue;
        }
        if let Some(key) = incoming(name.as_str()) {
            if let Ok(key) = HeaderName::from_bytes(key.as_bytes()) {
                md.append(key, value.clone());
            }
        }
    }

    let forwarded_host = parts
        .headers
        .get(metadata::X_FORWARDED_HOST)
        .or_else(|| parts.headers.get(header::HOST))
        .cloned()
        .or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
    if let Some(host) = forwarded_host {
        md.insert(metadata::X_FORWARDED_HOST, host);
    }

    if let Some(peer) = peer {
        let ip = peer.ip().to_string();
        let chain = match parts
            .headers
            .get(metadata::X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) if !existing.is_empty() => format!("{existing}, {ip}"),
            _ => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            md.insert(metadata::X_FORWARDED_FOR, value);
        }
        if let Ok(value) = HeaderValue::from_str(&peer.to_string()) {
            md.insert(metadata::REMOTE_ADDR, value);
        }
    }

    if let Ok(verb) = HeaderValue::from_str(parts.method.as_str()) {
        md.insert(metadata::HTTP_VERB, verb);
    }
    if let Ok(path) = HeaderValue::from_str(parts.uri.path()) {
        md.insert(metadata::HTTP_PATH, path);
    }
    if let Some(route) = route {
        if let Ok(method) = HeaderValue::from_str(route.rpc_method) {
            md.insert(metadata::GRPC_METHOD, method);
        }
        if let Ok(pattern) = HeaderValue::from_str(route.pattern) {
            md.insert(metadata::HTTP_PATH_PATTERN, pattern);
        }
    }

    // Modifier entries are joined after the header-derived ones, so an
    // explicit `Authorization` header stays the first value read.
    for modifier in modifiers {
        let mut current: Option<HeaderName> = None;
        for (name, value) in modifier.metadata(parts) {
            if let Some(name) = name {
                current = Some(name);
            }
            if let Some(name) = &current {
                md.append(name.clone(), value);
            }
        }
    }
    md
}
