//! Collaborator interfaces consumed by the pipeline.
//!
//! Each is implemented outside the pipeline (credential verifier, policy
//! engine, identity stores) and injected into the middleware that uses it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::claims::ClaimSet;
use crate::context::RequestContext;
use crate::error::BoxError;
use crate::identity::{Project, UserInfo};

/// Verifies a bearer credential and returns its claims.
#[async_trait]
pub trait ClaimParser: Send + Sync {
    async fn parse_claim(&self, ctx: &RequestContext, token: &str) -> Result<ClaimSet, BoxError>;
}

/// Policy decision point answering allow/deny for a
/// (subject, object, action) triple.
#[async_trait]
pub trait Enforcer: Send + Sync {
    async fn enforce(
        &self,
        ctx: &RequestContext,
        subject: &str,
        object: &str,
        action: &str,
    ) -> Result<bool, BoxError>;
}

/// Looks up a user profile by authenticated subject.
#[async_trait]
pub trait UserGetter: Send + Sync {
    async fn get_user(&self, ctx: &RequestContext, subject: &str) -> Result<UserInfo, BoxError>;
}

/// Looks up a project by id.
#[async_trait]
pub trait ProjectGetter: Send + Sync {
    async fn get_project(
        &self,
        ctx: &RequestContext,
        project_id: &str,
    ) -> Result<Arc<dyn Project>, BoxError>;
}
