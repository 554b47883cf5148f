//! Closed error taxonomy shared by every component of the pipeline.
//!
//! An [`Error`] carries exactly one [`Code`] and one cause. The code is fixed
//! at construction; wrapping an `Error` inside another only changes the
//! visible code when a caller re-codes it explicitly with [`Error::recode`].

use std::error::Error as StdError;
use std::fmt;

use crate::context::{ContextDone, RequestContext};

/// Boxed, thread-safe error used as the cause of taxonomy errors and as the
/// error type of every external collaborator.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Code
// ---------------------------------------------------------------------------

/// Error classification. Numeric values start at 1 and are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    NotFound = 1,
    StatusConflicted = 2,
    InvalidAuth = 3,
    BadParameters = 4,
    Timeout = 5,
    Internal = 6,
    NoMoreRetry = 7,
    BadGateway = 8,
    Unknown = 9,
    NotImpl = 10,
}

impl Code {
    /// All codes in numeric order.
    pub const ALL: [Code; 10] = [
        Code::NotFound,
        Code::StatusConflicted,
        Code::InvalidAuth,
        Code::BadParameters,
        Code::Timeout,
        Code::Internal,
        Code::NoMoreRetry,
        Code::BadGateway,
        Code::Unknown,
        Code::NotImpl,
    ];

    /// Returns the stable numeric value of this code.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Looks up a code by its numeric value.
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Code> {
        Self::ALL.into_iter().find(|c| c.as_i32() == value)
    }

    /// Short snake-case name, suitable for metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Code::NotFound => "not_found",
            Code::StatusConflicted => "status_conflicted",
            Code::InvalidAuth => "invalid_auth",
            Code::BadParameters => "bad_parameters",
            Code::Timeout => "timeout",
            Code::Internal => "internal",
            Code::NoMoreRetry => "no_more_retry",
            Code::BadGateway => "bad_gateway",
            Code::Unknown => "unknown",
            Code::NotImpl => "not_impl",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A taxonomy error: one code plus the underlying cause.
///
/// `source()` returns the cause, so generic chain walkers still reach the
/// original error.
#[derive(Debug, thiserror::Error)]
#[error("code({}), {}", .code.as_i32(), .source)]
pub struct Error {
    code: Code,
    source: BoxError,
}

/// Plain-text cause used by the message constructors.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

/// A caller-visible message layered over a hidden cause.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct Wrapped {
    message: String,
    source: BoxError,
}

impl Error {
    /// Wraps `cause` under `code`.
    #[must_use]
    pub fn new(code: Code, cause: impl Into<BoxError>) -> Self {
        Self {
            code,
            source: cause.into(),
        }
    }

    /// Creates an error whose cause is a plain message.
    #[must_use]
    pub fn msg(code: Code, message: impl Into<String>) -> Self {
        Self::new(code, Message(message.into()))
    }

    /// Creates an error that shows `message` and keeps `cause` in its
    /// source chain for server-side logs only.
    #[must_use]
    pub fn wrap(code: Code, message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::new(
            code,
            Wrapped {
                message: message.into(),
                source: cause.into(),
            },
        )
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::msg(Code::NotFound, message)
    }

    #[must_use]
    pub fn status_conflicted(message: impl Into<String>) -> Self {
        Self::msg(Code::StatusConflicted, message)
    }

    #[must_use]
    pub fn invalid_auth(message: impl Into<String>) -> Self {
        Self::msg(Code::InvalidAuth, message)
    }

    #[must_use]
    pub fn bad_parameters(message: impl Into<String>) -> Self {
        Self::msg(Code::BadParameters, message)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::msg(Code::Timeout, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::msg(Code::Internal, message)
    }

    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::msg(Code::Unknown, message)
    }

    #[must_use]
    pub fn not_impl(message: impl Into<String>) -> Self {
        Self::msg(Code::NotImpl, message)
    }

    /// Returns the code assigned at construction.
    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Returns the caller-visible message: the cause's own text, without
    /// the code prefix or the hidden part of a [`Error::wrap`] chain.
    #[must_use]
    pub fn message(&self) -> String {
        self.source.to_string()
    }

    /// Returns the direct cause.
    #[must_use]
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// Re-classifies this error under a new code. The previous error stays
    /// reachable through the source chain.
    #[must_use]
    pub fn recode(self, code: Code) -> Self {
        let message = self.message();
        Self::wrap(code, message, self)
    }

    /// Renders the full cause chain, outermost first, joined by `": "`.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut current = self.source.source();
        while let Some(err) = current {
            out.push_str(": ");
            out.push_str(&err.to_string());
            current = err.source();
        }
        out
    }

    /// Maps a finished call context into the taxonomy.
    ///
    /// Deadline expiry becomes [`Code::Timeout`]; explicit cancellation is a
    /// benign termination and yields `None`; any other cause is
    /// [`Code::Unknown`].
    #[must_use]
    pub fn from_done(done: &ContextDone) -> Option<Self> {
        match done {
            ContextDone::DeadlineExceeded => Some(Self::msg(Code::Timeout, done.to_string())),
            ContextDone::Canceled => None,
            ContextDone::Other(_) => Some(Self::msg(Code::Unknown, done.to_string())),
        }
    }

    /// Like [`Error::from_done`], reading the state of `ctx`.
    ///
    /// A context that has not finished yet is reported as
    /// [`Code::Unknown`] with the message `"context is not finished"`.
    #[must_use]
    pub fn from_context(ctx: &RequestContext) -> Option<Self> {
        match ctx.done() {
            Some(done) => Self::from_done(&done),
            None => Some(Self::unknown("context is not finished")),
        }
    }
}

/// Finds the first taxonomy error in `err`'s source chain.
///
/// Never panics on foreign error types; returns `None` when the chain
/// contains no taxonomy error.
#[must_use]
pub fn as_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<Error>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

/// Returns the code of the first taxonomy error in `err`'s chain.
#[must_use]
pub fn code_of(err: &(dyn StdError + 'static)) -> Option<Code> {
    as_error(err).map(Error::code)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
