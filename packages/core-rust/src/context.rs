//! Per-call request context.
//!
//! A [`RequestContext`] is immutable. Every `with_*` call derives a new
//! context that layers one more value over its parent; the parent is never
//! touched. Values are stored under private marker keys, so only the typed
//! accessors in this module can read or write them.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::claims::ClaimSet;
use crate::identity::{ProjectHandle, UserInfo};
use crate::metadata;

// ---------------------------------------------------------------------------
// ContextDone
// ---------------------------------------------------------------------------

/// Why a call context finished before its work completed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextDone {
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Canceled,
    #[error("context finished: {0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

mod keys {
    pub enum RequestId {}
    pub enum Subject {}
    pub enum Claims {}
    pub enum BearerToken {}
    pub enum UserInfo {}
    pub enum Project {}
}

/// Entry key: a private marker type for built-in values, or the value's
/// own type for extensions.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Key {
    Builtin(TypeId),
    Extension(TypeId),
}

impl Key {
    fn builtin<K: 'static>() -> Self {
        Key::Builtin(TypeId::of::<K>())
    }
}

struct Entry {
    key: Key,
    value: Box<dyn Any + Send + Sync>,
    parent: Option<Arc<Entry>>,
}

struct Root {
    metadata: HeaderMap,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Immutable, append-only carrier of the facts derived for one call.
///
/// Cloning is cheap: clones share the transport metadata and the value
/// chain.
#[derive(Clone)]
pub struct RequestContext {
    root: Arc<Root>,
    values: Option<Arc<Entry>>,
}

impl RequestContext {
    /// Creates a root context over the call's transport metadata, with no
    /// deadline and a fresh cancellation token.
    #[must_use]
    pub fn new(metadata: HeaderMap) -> Self {
        Self::with_parts(metadata, None, CancellationToken::new())
    }

    /// Creates a root context from explicit parts.
    #[must_use]
    pub fn with_parts(
        metadata: HeaderMap,
        deadline: Option<Instant>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            root: Arc::new(Root {
                metadata,
                deadline,
                cancel,
            }),
            values: None,
        }
    }

    /// Returns a context with the same values and a deadline `timeout` from
    /// now. An existing earlier deadline is kept.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.root.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        Self {
            root: Arc::new(Root {
                metadata: self.root.metadata.clone(),
                deadline: Some(deadline),
                cancel: self.root.cancel.clone(),
            }),
            values: self.values.clone(),
        }
    }

    /// Transport metadata the call arrived with.
    #[must_use]
    pub fn metadata(&self) -> &HeaderMap {
        &self.root.metadata
    }

    /// First metadata value for `key`, if it is valid visible ASCII.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.root.metadata.get(key).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.root.deadline
    }

    /// Token cancelled when the call is abandoned.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.root.cancel
    }

    /// Cancels the call. Every context sharing this call's root observes it.
    pub fn cancel(&self) {
        self.root.cancel.cancel();
    }

    /// Reports whether the call has finished, and why.
    #[must_use]
    pub fn done(&self) -> Option<ContextDone> {
        if self.root.cancel.is_cancelled() {
            return Some(ContextDone::Canceled);
        }
        match self.root.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextDone::DeadlineExceeded),
            _ => None,
        }
    }

    /// Runs `fut` until it completes or the call finishes, whichever comes
    /// first.
    ///
    /// # Errors
    ///
    /// Returns the [`ContextDone`] reason when the call is cancelled or its
    /// deadline passes before `fut` resolves.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, ContextDone> {
        let deadline = self.root.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.root.cancel.cancelled() => Err(ContextDone::Canceled),
            () = expired => Err(ContextDone::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    fn derive<V: Any + Send + Sync>(&self, key: Key, value: V) -> Self {
        Self {
            root: Arc::clone(&self.root),
            values: Some(Arc::new(Entry {
                key,
                value: Box::new(value),
                parent: self.values.clone(),
            })),
        }
    }

    fn lookup<V: Any>(&self, key: Key) -> Option<&V> {
        let mut current = self.values.as_deref();
        while let Some(entry) = current {
            if entry.key == key {
                return entry.value.downcast_ref::<V>();
            }
            current = entry.parent.as_deref();
        }
        None
    }

    // -- derived values ----------------------------------------------------

    #[must_use]
    pub fn with_request_id(&self, id: impl Into<String>) -> Self {
        self.derive::<String>(Key::builtin::<keys::RequestId>(), id.into())
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.lookup::<String>(Key::builtin::<keys::RequestId>()).map(String::as_str)
    }

    #[must_use]
    pub fn with_subject(&self, subject: impl Into<String>) -> Self {
        self.derive::<String>(Key::builtin::<keys::Subject>(), subject.into())
    }

    /// The authenticated principal, set by authentication.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.lookup::<String>(Key::builtin::<keys::Subject>()).map(String::as_str)
    }

    #[must_use]
    pub fn with_claims(&self, claims: ClaimSet) -> Self {
        self.derive::<ClaimSet>(Key::builtin::<keys::Claims>(), claims)
    }

    #[must_use]
    pub fn claims(&self) -> Option<&ClaimSet> {
        self.lookup::<ClaimSet>(Key::builtin::<keys::Claims>())
    }

    #[must_use]
    pub fn with_bearer_token(&self, token: impl Into<String>) -> Self {
        self.derive::<String>(Key::builtin::<keys::BearerToken>(), token.into())
    }

    /// The raw credential, kept for outbound propagation.
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        self.lookup::<String>(Key::builtin::<keys::BearerToken>()).map(String::as_str)
    }

    #[must_use]
    pub fn with_user_info(&self, user: UserInfo) -> Self {
        self.derive::<UserInfo>(Key::builtin::<keys::UserInfo>(), user)
    }

    #[must_use]
    pub fn user_info(&self) -> Option<&UserInfo> {
        self.lookup::<UserInfo>(Key::builtin::<keys::UserInfo>())
    }

    #[must_use]
    pub fn with_project(&self, project: ProjectHandle) -> Self {
        self.derive::<ProjectHandle>(Key::builtin::<keys::Project>(), project)
    }

    /// The resolved project. `None` means project resolution has not run;
    /// a failed resolution yields [`ProjectHandle::Invalid`].
    #[must_use]
    pub fn project(&self) -> Option<&ProjectHandle> {
        self.lookup::<ProjectHandle>(Key::builtin::<keys::Project>())
    }

    /// Layers an application-defined value, keyed by its type.
    #[must_use]
    pub fn with_extension<T: Any + Send + Sync>(&self, value: T) -> Self {
        self.derive::<T>(Key::Extension(TypeId::of::<T>()), value)
    }

    #[must_use]
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.lookup::<T>(Key::Extension(TypeId::of::<T>()))
    }

    // -- HTTP bridge metadata ---------------------------------------------

    #[must_use]
    pub fn http_verb(&self) -> Option<&str> {
        self.metadata_value(metadata::HTTP_VERB)
    }

    #[must_use]
    pub fn http_path(&self) -> Option<&str> {
        self.metadata_value(metadata::HTTP_PATH)
    }

    #[must_use]
    pub fn http_path_pattern(&self) -> Option<&str> {
        self.metadata_value(metadata::HTTP_PATH_PATTERN)
    }

    #[must_use]
    pub fn grpc_method(&self) -> Option<&str> {
        self.metadata_value(metadata::GRPC_METHOD)
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.metadata_value(metadata::REMOTE_ADDR)
    }

    /// Every hop listed in `x-forwarded-for`, in order.
    #[must_use]
    pub fn x_forwarded_for(&self) -> Vec<&str> {
        self.root
            .metadata
            .get_all(metadata::X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect()
    }

    #[must_use]
    pub fn x_forwarded_host(&self) -> Option<&str> {
        self.metadata_value(metadata::X_FORWARDED_HOST)
    }

    /// The caller's user agent. Gateway traffic carries it under the
    /// prefixed key, since RPC clients replace `user-agent` with their own.
    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.metadata_value(metadata::GATEWAY_USER_AGENT)
            .or_else(|| self.metadata_value(metadata::USER_AGENT))
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id())
            .field("subject", &self.subject())
            .field("deadline", &self.root.deadline)
            .field("cancelled", &self.root.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(HeaderMap::new())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
