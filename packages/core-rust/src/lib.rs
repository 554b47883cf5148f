//! `rpcgate` core: request context, error taxonomy, and the identity and
//! claim types shared by the server pipeline.

pub mod claims;
pub mod context;
pub mod error;
pub mod identity;
pub mod metadata;
pub mod traits;

pub use claims::{Audience, ClaimSet, ANONYMOUS};
pub use context::{ContextDone, RequestContext};
pub use error::{as_error, code_of, BoxError, Code, Error};
pub use identity::{project_id_from_path, Project, ProjectHandle, UserInfo};
pub use traits::{ClaimParser, Enforcer, ProjectGetter, UserGetter};
