use std::fmt;

use serde::{Deserialize, Serialize};

/// The access/refresh pair for the signed-in user. Both values are opaque.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

/// Keep a short prefix so logs can tell tokens apart without leaking them.
fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}… ({} chars)", prefix, token.chars().count())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Anonymous,
    Authenticated,
    RefreshInProgress,
}

/// Token payload returned by the login and refresh endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken", default)]
    pub refresh_token: Option<String>,
    /// Everything else the server sent (user profile on login)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    pub refresh_token: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_tokens() {
        let credential = Credential::new("eyJhbGciOiJIUzI1NiJ9.secret", "refresh-secret");
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("eyJh"));
        assert_eq!(credential.bearer(), "Bearer eyJhbGciOiJIUzI1NiJ9.secret");
    }

    #[test]
    fn test_parse_grant() {
        let json = r#"{"accessToken":"A1","refreshToken":"R1","user":{"id":42,"name":"Ada"}}"#;
        let grant: TokenGrant = serde_json::from_str(json).unwrap();
        assert_eq!(grant.access_token, "A1");
        assert_eq!(grant.refresh_token.as_deref(), Some("R1"));
        assert_eq!(grant.extra["user"]["id"], 42);

        let refreshed: TokenGrant = serde_json::from_str(r#"{"accessToken":"A2"}"#).unwrap();
        assert!(refreshed.refresh_token.is_none());
        assert!(refreshed.extra.is_empty());

        let request = serde_json::to_value(RefreshRequest { refresh_token: "R1" }).unwrap();
        assert_eq!(request, serde_json::json!({ "refreshToken": "R1" }));
    }
}
