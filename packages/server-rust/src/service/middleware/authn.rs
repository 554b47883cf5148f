//! Authentication: bearer credential to subject and claims.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use rpcgate_core::{
    metadata, BoxError, ClaimParser, ClaimSet, Code, Error, RequestContext,
};
use tonic::Status;
use tracing::debug;
use uuid::Uuid;

use super::{Next, ServerMiddleware};
use crate::service::call::{StreamCall, UnaryCall, UnaryReply};
use crate::service::status::{context_done_status, IntoStatus};

// ---------------------------------------------------------------------------
// Credential extraction
// ---------------------------------------------------------------------------

/// Extracts the bearer credential from call metadata.
///
/// Scans every `authorization` entry and prefers the first carrying a
/// case-insensitive `Bearer` scheme. When none does, a single scheme-less
/// token is accepted: that is how the gateway's cookie bridge delivers
/// `Authorization` cookies.
#[derive(Debug, Clone, Copy, Default)]
pub struct BearerTokenParser;

impl BearerTokenParser {
    #[must_use]
    pub fn token(ctx: &RequestContext) -> Option<String> {
        let values: Vec<&str> = ctx
            .metadata()
            .get_all(metadata::AUTHORIZATION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();

        values
            .iter()
            .find_map(|v| strip_bearer(v))
            .or_else(|| values.iter().copied().find(|v| !v.contains(' ')))
            .map(str::to_owned)
    }
}

fn strip_bearer(value: &str) -> Option<&str> {
    let (scheme, rest) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    (!token.is_empty()).then_some(token)
}

// ---------------------------------------------------------------------------
// JwtClaimParser
// ---------------------------------------------------------------------------

/// Claim parser for JWTs signed with a shared secret.
pub struct JwtClaimParser {
    key: DecodingKey,
    validation: Validation,
}

impl JwtClaimParser {
    /// HS256 verifier. When `audience` is `None` the `aud` claim is not
    /// checked.
    #[must_use]
    pub fn hs256(secret: &[u8], issuer: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl ClaimParser for JwtClaimParser {
    async fn parse_claim(&self, _ctx: &RequestContext, token: &str) -> Result<ClaimSet, BoxError> {
        let data = jsonwebtoken::decode::<ClaimSet>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

// ---------------------------------------------------------------------------
// AuthnMiddleware
// ---------------------------------------------------------------------------

/// Verifies the caller's credential and layers the resulting identity onto
/// the context: request id (when absent), subject, claims, bearer token.
#[derive(Clone)]
pub struct AuthnMiddleware {
    parser: Arc<dyn ClaimParser>,
    anonymous: bool,
}

impl AuthnMiddleware {
    #[must_use]
    pub fn new(parser: Arc<dyn ClaimParser>) -> Self {
        Self {
            parser,
            anonymous: false,
        }
    }

    /// Lets credential-less calls through as the anonymous identity.
    #[must_use]
    pub fn allow_anonymous(mut self, enabled: bool) -> Self {
        self.anonymous = enabled;
        self
    }

    async fn authenticate(&self, ctx: &RequestContext) -> Result<RequestContext, Status> {
        let token = BearerTokenParser::token(ctx);
        let claims = match &token {
            Some(token) => match ctx.guard(self.parser.parse_claim(ctx, token)).await {
                Ok(Ok(claims)) => claims,
                Ok(Err(err)) => {
                    return Err(
                        Error::wrap(Code::InvalidAuth, "invalid credential", err).into_status()
                    )
                }
                Err(done) => return Err(context_done_status(&done)),
            },
            None if self.anonymous => ClaimSet::anonymous(),
            None => {
                return Err(Error::invalid_auth("no bearer credential found").into_status());
            }
        };

        let mut derived = ctx.clone();
        if derived.request_id().is_none() {
            derived = derived.with_request_id(Uuid::new_v4().to_string());
        }
        if let Some(subject) = claims.subject() {
            tracing::Span::current().record("subject", subject);
            derived = derived.with_subject(subject);
        } else {
            debug!("credential carries no subject");
        }
        derived = derived.with_claims(claims);
        if let Some(token) = token {
            derived = derived.with_bearer_token(token);
        }
        Ok(derived)
    }
}

#[async_trait]
impl ServerMiddleware for AuthnMiddleware {
    fn name(&self) -> &str {
        "authn"
    }

    async fn unary(
        &self,
        call: UnaryCall,
        next: Next<UnaryCall, UnaryReply>,
    ) -> Result<UnaryReply, Status> {
        let ctx = self.authenticate(&call.ctx).await?;
        next.run(call.with_context(ctx)).await
    }

    async fn stream(&self, call: StreamCall, next: Next<StreamCall, ()>) -> Result<(), Status> {
        let ctx = self.authenticate(call.context()).await?;
        next.run(call.with_context(ctx)).await
    }
}
