//! Stable transport metadata keys.
//!
//! The HTTP bridge writes the `http-*`, `grpc-method` and `remote-addr`
//! entries; RPC-native calls carry none of them.

pub const HTTP_VERB: &str = "http-verb";
pub const HTTP_PATH: &str = "http-path";
pub const HTTP_PATH_PATTERN: &str = "http-path-pattern";
pub const GRPC_METHOD: &str = "grpc-method";
pub const REMOTE_ADDR: &str = "remote-addr";

pub const AUTHORIZATION: &str = "authorization";
pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const USER_AGENT: &str = "user-agent";

/// Prefix applied to permanent HTTP headers forwarded by the gateway.
pub const GATEWAY_PREFIX: &str = "grpcgateway-";
/// Gateway-forwarded user agent.
pub const GATEWAY_USER_AGENT: &str = "grpcgateway-user-agent";
/// Prefix marking HTTP headers that map one-to-one onto RPC metadata.
pub const METADATA_HEADER_PREFIX: &str = "grpc-metadata-";

/// Deadline header of the RPC transport.
pub const GRPC_TIMEOUT: &str = "grpc-timeout";
