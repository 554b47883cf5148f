//! Forwarding the caller's credential on outbound RPCs.

use rpcgate_core::{metadata, Code, Error, RequestContext};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// Client interceptor that sends `authorization: Bearer <token>` using the
/// token retained by authentication.
///
/// ```ignore
/// let auth = BearerPropagation::from_context(&ctx)?;
/// let client = HealthClient::with_interceptor(channel, auth);
/// ```
#[derive(Debug, Clone)]
pub struct BearerPropagation {
    header: MetadataValue<Ascii>,
}

impl BearerPropagation {
    /// # Errors
    ///
    /// Returns `InvalidAuth` when the context carries no bearer token, or
    /// the token cannot be sent as metadata.
    pub fn from_context(ctx: &RequestContext) -> Result<Self, Error> {
        let token = ctx
            .bearer_token()
            .ok_or_else(|| Error::invalid_auth("no bearer token in context"))?;
        let header = MetadataValue::try_from(format!("Bearer {token}"))
            .map_err(|err| Error::wrap(Code::InvalidAuth, "bearer token is not valid metadata", err))?;
        Ok(Self { header })
    }
}

impl Interceptor for BearerPropagation {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert(metadata::AUTHORIZATION, self.header.clone());
        Ok(request)
    }
}
