//! Caller identity and project tenancy values stored in the request context.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::claims::ANONYMOUS;
use crate::error::Error;

// ---------------------------------------------------------------------------
// UserInfo
// ---------------------------------------------------------------------------

/// Resolved user profile for the call's subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    pub groups: Vec<String>,
}

impl UserInfo {
    /// The fixed identity used when no subject is known or lookup fails.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            id: ANONYMOUS.to_string(),
            email: ANONYMOUS.to_string(),
            groups: vec![ANONYMOUS.to_string()],
        }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.id == ANONYMOUS
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A project record returned by the project store.
pub trait Project: Any + fmt::Debug + Send + Sync {
    fn id(&self) -> &str;

    /// Upcast used by [`ProjectHandle::project`] to recover the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Outcome of project resolution.
///
/// Resolution failure is stored as `Invalid` so readers always get a typed
/// value; the accessors turn it into a `BadParameters` error.
#[derive(Debug, Clone)]
pub enum ProjectHandle {
    Resolved(Arc<dyn Project>),
    Invalid,
}

impl ProjectHandle {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, ProjectHandle::Resolved(_))
    }

    /// # Errors
    ///
    /// Returns a `BadParameters` error when resolution failed.
    pub fn project_id(&self) -> Result<&str, Error> {
        match self {
            ProjectHandle::Resolved(project) => Ok(project.id()),
            ProjectHandle::Invalid => Err(invalid_project()),
        }
    }

    /// Returns the resolved project as its concrete type.
    ///
    /// # Errors
    ///
    /// Returns a `BadParameters` error when resolution failed or the stored
    /// project is not a `T`.
    pub fn project<T: Project>(&self) -> Result<&T, Error> {
        match self {
            ProjectHandle::Resolved(project) => project
                .as_any()
                .downcast_ref::<T>()
                .ok_or_else(invalid_project),
            ProjectHandle::Invalid => Err(invalid_project()),
        }
    }
}

fn invalid_project() -> Error {
    Error::bad_parameters("invalid projectid")
}

static PROJECT_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/projects/([a-zA-Z0-9]+)/?").expect("project path pattern is valid")
});

/// Extracts the project id from a request path containing
/// `/projects/{id}` (alphanumeric id, optional trailing slash).
///
/// Returns `None` unless the path contains exactly one such segment.
#[must_use]
pub fn project_id_from_path(path: &str) -> Option<&str> {
    let mut matches = PROJECT_PATH.captures_iter(path);
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    first.get(1).map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::error::Code;

    #[derive(Debug)]
    struct Acme {
        id: String,
        plan: &'static str,
    }

    impl Project for Acme {
        fn id(&self) -> &str {
            &self.id
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct Other;

    impl Project for Other {
        fn id(&self) -> &str {
            "other"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn anonymous_user_fields() {
        let user = UserInfo::anonymous();
        assert_eq!(user.id, "anonymous");
        assert_eq!(user.email, "anonymous");
        assert_eq!(user.groups, vec!["anonymous"]);
        assert!(user.is_anonymous());
    }

    #[test]
    fn resolved_handle_exposes_project() {
        let handle = ProjectHandle::Resolved(Arc::new(Acme {
            id: "p1".into(),
            plan: "pro",
        }));
        assert!(handle.is_valid());
        assert_eq!(handle.project_id().unwrap(), "p1");
        assert_eq!(handle.project::<Acme>().unwrap().plan, "pro");
        assert_eq!(
            handle.project::<Other>().unwrap_err().code(),
            Code::BadParameters
        );
    }

    #[test]
    fn invalid_handle_accessors_return_bad_parameters() {
        let handle = ProjectHandle::Invalid;
        assert!(!handle.is_valid());
        let err = handle.project_id().unwrap_err();
        assert_eq!(err.code(), Code::BadParameters);
        assert_eq!(err.to_string(), "code(4), invalid projectid");
        assert!(handle.project::<Acme>().is_err());
    }

    #[test]
    fn extracts_project_id_with_optional_trailing_slash() {
        assert_eq!(project_id_from_path("/v1/projects/1"), Some("1"));
        assert_eq!(project_id_from_path("/v1/projects/1/"), Some("1"));
        assert_eq!(project_id_from_path("/v1/projects/abc9/members"), Some("abc9"));
    }

    #[test]
    fn rejects_paths_without_exactly_one_project() {
        assert_eq!(project_id_from_path("/v1/healthz"), None);
        assert_eq!(project_id_from_path("/v1/projects/"), None);
        assert_eq!(project_id_from_path("/v1/projects/a/projects/b"), None);
    }

    proptest! {
        #[test]
        fn any_alphanumeric_id_round_trips(id in "[a-zA-Z0-9]{1,24}", slash in any::<bool>()) {
            let path = format!("/v1/projects/{id}{}", if slash { "/" } else { "" });
            prop_assert_eq!(project_id_from_path(&path), Some(id.as_str()));
        }
    }
}
