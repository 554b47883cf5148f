//! Verified claim set produced by credential parsing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identity used when anonymous access is allowed and no credential is sent.
pub const ANONYMOUS: &str = "anonymous";

/// The `aud` claim, which may be a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    /// Reports whether `aud` is one of the audiences.
    #[must_use]
    pub fn contains(&self, aud: &str) -> bool {
        match self {
            Audience::One(one) => one == aud,
            Audience::Many(many) => many.iter().any(|a| a == aud),
        }
    }
}

/// Registered JWT claims plus any private claims, kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    /// Expiry, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Not-before, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    /// Issued-at, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClaimSet {
    /// Synthesized claims for anonymous callers, valid from one minute ago
    /// until 24 hours from now.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::anonymous_at(SystemTime::now())
    }

    /// [`ClaimSet::anonymous`] relative to a fixed instant.
    #[must_use]
    pub fn anonymous_at(now: SystemTime) -> Self {
        let now = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Self {
            sub: Some(ANONYMOUS.to_string()),
            iss: Some(ANONYMOUS.to_string()),
            aud: Some(Audience::One(ANONYMOUS.to_string())),
            exp: Some(now + 24 * 60 * 60),
            nbf: Some(now.saturating_sub(60)),
            iat: Some(now),
            extra: serde_json::Map::new(),
        }
    }

    /// The subject claim, if any.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    /// A private claim by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.extra.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_claims_window() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let claims = ClaimSet::anonymous_at(now);

        assert_eq!(claims.subject(), Some(ANONYMOUS));
        assert_eq!(claims.iss.as_deref(), Some(ANONYMOUS));
        assert!(claims.aud.as_ref().unwrap().contains(ANONYMOUS));
        assert_eq!(claims.nbf, Some(1_000_000 - 60));
        assert_eq!(claims.iat, Some(1_000_000));
        assert_eq!(claims.exp, Some(1_000_000 + 86_400));
    }

    #[test]
    fn deserializes_single_and_list_audience() {
        let one: ClaimSet = serde_json::from_str(r#"{"sub":"a","aud":"api"}"#).unwrap();
        assert_eq!(one.aud, Some(Audience::One("api".into())));

        let many: ClaimSet = serde_json::from_str(r#"{"sub":"a","aud":["x","api"]}"#).unwrap();
        assert!(many.aud.unwrap().contains("api"));
    }

    #[test]
    fn keeps_private_claims() {
        let claims: ClaimSet =
            serde_json::from_str(r#"{"sub":"a","email":"a@example.com","exp":10}"#).unwrap();
        assert_eq!(claims.exp, Some(10));
        assert_eq!(
            claims.get("email").and_then(|v| v.as_str()),
            Some("a@example.com")
        );
    }
}
