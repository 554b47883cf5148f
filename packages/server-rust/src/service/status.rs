//! Status mapping between the error taxonomy, RPC status codes and HTTP.

use http::StatusCode;
use rpcgate_core::{Code, ContextDone, Error};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::Status;

/// Response metadata key carrying the numeric taxonomy code.
pub const ERROR_CODE_KEY: &str = "x-error-code";

/// Conversion of taxonomy errors into RPC statuses.
///
/// The status message is the error's caller-visible message only; wrapped
/// causes stay in server logs.
pub trait IntoStatus {
    fn into_status(self) -> Status;
}

impl IntoStatus for Error {
    fn into_status(self) -> Status {
        let mut metadata = MetadataMap::new();
        metadata.insert(ERROR_CODE_KEY, MetadataValue::from(self.code().as_i32()));
        Status::with_metadata(rpc_code(self.code()), self.message(), metadata)
    }
}

/// RPC status code for a taxonomy code.
#[must_use]
pub fn rpc_code(code: Code) -> tonic::Code {
    match code {
        Code::NotFound => tonic::Code::NotFound,
        Code::StatusConflicted => tonic::Code::Aborted,
        Code::InvalidAuth => tonic::Code::Unauthenticated,
        Code::BadParameters => tonic::Code::InvalidArgument,
        Code::Timeout => tonic::Code::DeadlineExceeded,
        Code::Internal => tonic::Code::Internal,
        Code::NoMoreRetry => tonic::Code::ResourceExhausted,
        Code::BadGateway => tonic::Code::Unavailable,
        Code::Unknown => tonic::Code::Unknown,
        Code::NotImpl => tonic::Code::Unimplemented,
    }
}

/// Recovers the taxonomy code attached by [`IntoStatus`], if any.
#[must_use]
pub fn taxonomy_code(status: &Status) -> Option<Code> {
    status
        .metadata()
        .get(ERROR_CODE_KEY)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .and_then(Code::from_i32)
}

/// Status for a call whose context finished before an external
/// collaborator answered.
#[must_use]
pub fn context_done_status(done: &ContextDone) -> Status {
    match Error::from_done(done) {
        Some(err) => err.into_status(),
        None => Status::cancelled(done.to_string()),
    }
}

/// HTTP status for an RPC status code.
#[must_use]
pub fn http_status(code: tonic::Code) -> StatusCode {
    match code {
        tonic::Code::Ok => StatusCode::OK,
        // 499 Client Closed Request
        tonic::Code::Cancelled => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        tonic::Code::InvalidArgument
        | tonic::Code::FailedPrecondition
        | tonic::Code::OutOfRange => StatusCode::BAD_REQUEST,
        tonic::Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        tonic::Code::NotFound => StatusCode::NOT_FOUND,
        tonic::Code::AlreadyExists | tonic::Code::Aborted => StatusCode::CONFLICT,
        tonic::Code::PermissionDenied => StatusCode::FORBIDDEN,
        tonic::Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        tonic::Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        tonic::Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        tonic::Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        tonic::Code::Unknown | tonic::Code::Internal | tonic::Code::DataLoss => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
