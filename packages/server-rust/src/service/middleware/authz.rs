//! Authorization against an external policy [`Enforcer`].

use std::sync::Arc;

use async_trait::async_trait;
use rpcgate_core::{Code, Enforcer, Error, RequestContext};
use serde::{Deserialize, Serialize};
use tonic::Status;
use tracing::debug;

use super::{Next, ServerMiddleware};
use crate::service::call::{StreamCall, UnaryCall, UnaryReply};
use crate::service::status::{context_done_status, IntoStatus};

/// An HTTP path and method that bypass policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipPath {
    pub path: String,
    pub method: String,
}

impl SkipPath {
    #[must_use]
    pub fn new(path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
        }
    }

    /// Methods always compare case-insensitively; paths only when
    /// `case_sensitive` is off.
    fn matches(&self, path: &str, method: &str, case_sensitive: bool) -> bool {
        let path_matches = if case_sensitive {
            self.path == path
        } else {
            self.path.eq_ignore_ascii_case(path)
        };
        path_matches && self.method.eq_ignore_ascii_case(method)
    }
}

/// Bypass rules for [`AuthzMiddleware`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    pub skip_paths: Vec<SkipPath>,
    /// Compare skip paths exactly instead of ignoring ASCII case.
    pub case_sensitive: bool,
    /// Subjects (service identities) that are always allowed.
    pub skip_subjects: Vec<String>,
}

/// Enforces `(subject, http path, http method)` policy on every call.
///
/// Runs after authentication; calls without gateway path metadata are
/// rejected, since there is nothing to evaluate.
#[derive(Clone)]
pub struct AuthzMiddleware {
    config: AuthzConfig,
    enforcer: Arc<dyn Enforcer>,
}

impl AuthzMiddleware {
    #[must_use]
    pub fn new(config: AuthzConfig, enforcer: Arc<dyn Enforcer>) -> Self {
        Self { config, enforcer }
    }

    async fn authorize(&self, ctx: &RequestContext) -> Result<(), Status> {
        let (Some(path), Some(method)) = (ctx.http_path(), ctx.http_verb()) else {
            return Err(Error::invalid_auth("missing http path or method").into_status());
        };

        if self
            .config
            .skip_paths
            .iter()
            .any(|skip| skip.matches(path, method, self.config.case_sensitive))
        {
            debug!(path, method, "authorization skipped for path");
            return Ok(());
        }

        let Some(subject) = ctx.subject() else {
            return Err(Error::invalid_auth("no authenticated subject").into_status());
        };

        if self.config.skip_subjects.iter().any(|s| s == subject) {
            debug!(subject, "authorization skipped for subject");
            return Ok(());
        }

        match ctx
            .guard(self.enforcer.enforce(ctx, subject, path, method))
            .await
        {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(Error::invalid_auth("permission denied").into_status()),
            Ok(Err(err)) => Err(
                Error::wrap(Code::InvalidAuth, "policy enforcement failed", err).into_status(),
            ),
            Err(done) => Err(context_done_status(&done)),
        }
    }
}

#[async_trait]
impl ServerMiddleware for AuthzMiddleware {
    fn name(&self) -> &str {
        "authz"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        self.authorize(&call.ctx).await?;
        next.run(call).await
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        self.authorize(call.context()).await?;
        next.run(call).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::{HeaderMap, HeaderValue};
    use rpcgate_core::{metadata, BoxError};

    use super::*;
    use crate::service::middleware::testing::{echo_call, echo_stream, run_echo, single};
    use crate::service::status::taxonomy_code;

    /// Allows `alice` on `/v1/items`; counts evaluations.
    #[derive(Default)]
    struct TablePolicy {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Enforcer for TablePolicy {
        async fn enforce(
            &self,
            _ctx: &RequestContext,
            subject: &str,
            object: &str,
            action: &str,
        ) -> Result<bool, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if object == "/v1/broken" {
                return Err("policy store unreachable".into());
            }
            Ok(subject == "alice" && object == "/v1/items" && action == "GET")
        }
    }

    fn request(path: &'static str, verb: &'static str) -> RequestContext {
        let mut md = HeaderMap::new();
        md.insert(metadata::HTTP_PATH, HeaderValue::from_static(path));
        md.insert(metadata::HTTP_VERB, HeaderValue::from_static(verb));
        RequestContext::new(md)
    }

    fn authz(config: AuthzConfig) -> (AuthzMiddleware, Arc<TablePolicy>) {
        let policy = Arc::new(TablePolicy::default());
        (AuthzMiddleware::new(config, policy.clone()), policy)
    }

    fn health_skip(case_sensitive: bool) -> AuthzConfig {
        AuthzConfig {
            skip_paths: vec![SkipPath::new("/healthz", "GET")],
            case_sensitive,
            skip_subjects: Vec::new(),
        }
    }

    #[tokio::test]
    async fn allowed_subject_passes() {
        let (unit, policy) = authz(AuthzConfig::default());
        let chain = single(Arc::new(unit));
        let ctx = request("/v1/items", "GET").with_subject("alice");
        run_echo(&chain, echo_call(ctx)).await.unwrap();
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denied_subject_is_invalid_auth() {
        let (unit, _) = authz(AuthzConfig::default());
        let chain = single(Arc::new(unit));
        let ctx = request("/v1/items", "DELETE").with_subject("alice");
        let status = run_echo(&chain, echo_call(ctx)).await.unwrap_err();
        assert_eq!(taxonomy_code(&status), Some(Code::InvalidAuth));
        assert_eq!(status.message(), "permission denied");
    }

    #[tokio::test]
    async fn enforcer_error_is_invalid_auth_without_detail() {
        let (unit, _) = authz(AuthzConfig::default());
        let chain = single(Arc::new(unit));
        let ctx = request("/v1/broken", "GET").with_subject("alice");
        let status = run_echo(&chain, echo_call(ctx)).await.unwrap_err();
        assert_eq!(taxonomy_code(&status), Some(Code::InvalidAuth));
        assert_eq!(status.message(), "policy enforcement failed");
    }

    #[tokio::test]
    async fn missing_path_metadata_is_rejected() {
        let (unit, policy) = authz(AuthzConfig::default());
        let chain = single(Arc::new(unit));
        let ctx = RequestContext::default().with_subject("alice");
        let status = run_echo(&chain, echo_call(ctx)).await.unwrap_err();
        assert_eq!(taxonomy_code(&status), Some(Code::InvalidAuth));
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_subject_is_rejected() {
        let (unit, _) = authz(AuthzConfig::default());
        let chain = single(Arc::new(unit));
        let status = run_echo(&chain, echo_call(request("/v1/items", "GET")))
            .await
            .unwrap_err();
        assert_eq!(taxonomy_code(&status), Some(Code::InvalidAuth));
    }

    #[tokio::test]
    async fn skip_subject_bypasses_enforcer() {
        let (unit, policy) = authz(AuthzConfig {
            skip_subjects: vec!["service-health-checker".into()],
            ..AuthzConfig::default()
        });
        let chain = single(Arc::new(unit));
        let ctx = request("/v1/anything", "POST").with_subject("service-health-checker");
        run_echo(&chain, echo_call(ctx)).await.unwrap();
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn skip_path_matching_respects_case_flag() {
        // no subject needed for a skipped path
        let (unit, policy) = authz(health_skip(true));
        let chain = single(Arc::new(unit));
        run_echo(&chain, echo_call(request("/healthz", "get")))
            .await
            .unwrap();
        let status = run_echo(&chain, echo_call(request("/HEALTHZ", "get")))
            .await
            .unwrap_err();
        assert_eq!(taxonomy_code(&status), Some(Code::InvalidAuth));
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);

        let (unit, policy) = authz(health_skip(false));
        let chain = single(Arc::new(unit));
        run_echo(&chain, echo_call(request("/HEALTHZ", "get")))
            .await
            .unwrap();
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_calls_are_authorized() {
        let (unit, _) = authz(AuthzConfig::default());
        let chain = single(Arc::new(unit));
        let (call, sent) = echo_stream(request("/v1/items", "GET").with_subject("mallory"));
        let status = chain.stream(call).await.unwrap_err();
        assert_eq!(taxonomy_code(&status), Some(Code::InvalidAuth));
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: AuthzConfig = serde_json::from_str(
            r#"{"skip_paths":[{"path":"/healthz","method":"GET"}]}"#,
        )
        .unwrap();
        assert_eq!(config.skip_paths, vec![SkipPath::new("/healthz", "GET")]);
        assert!(!config.case_sensitive);
        assert!(config.skip_subjects.is_empty());
    }
}
