//! Connection authentication hook

use std::collections::HashMap;

/// Credentials presented in CONNECT
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials<'a> {
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

impl Credentials<'_> {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
}

/// Decides whether a client may connect. Called once per CONNECT, after the
/// protocol version and client identifier have been accepted.
pub trait AuthHook: Send + Sync {
    fn authenticate(&self, client_id: &str, credentials: &Credentials<'_>) -> AuthDecision;
}

/// Accepts every client
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthHook for AllowAll {
    fn authenticate(&self, _client_id: &str, _credentials: &Credentials<'_>) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// Fixed username/password table
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

impl AuthHook for StaticCredentials {
    fn authenticate(&self, _client_id: &str, credentials: &Credentials<'_>) -> AuthDecision {
        let (Some(username), Some(password)) = (credentials.username, credentials.password) else {
            return AuthDecision::Deny;
        };
        match self.users.get(username) {
            Some(expected) if expected.as_bytes() == password => AuthDecision::Allow,
            _ => AuthDecision::Deny,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credentials() {
        let auth = StaticCredentials::new().with_user("sensor", "s3cret");
        let check = |user: Option<&str>, pass: Option<&[u8]>| {
            auth.authenticate(
                "c1",
                &Credentials {
                    username: user,
                    password: pass,
                },
            )
        };
        assert_eq!(check(Some("sensor"), Some(b"s3cret")), AuthDecision::Allow);
        assert_eq!(check(Some("sensor"), Some(b"wrong")), AuthDecision::Deny);
        assert_eq!(check(Some("other"), Some(b"s3cret")), AuthDecision::Deny);
        assert_eq!(check(None, None), AuthDecision::Deny);
        assert_eq!(
            AllowAll.authenticate("c1", &Credentials::default()),
            AuthDecision::Allow
        );
    }
}
