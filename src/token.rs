//! Boundary to whatever owns the login and token-refresh flow.
//!
//! `None` means no token is available. Whether to proceed unauthenticated or
//! skip the call is the caller's decision.

pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// A fixed token, or none.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenSource for StaticToken {
    fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the token from an environment variable on every call; empty counts as absent.
#[derive(Debug, Clone)]
pub struct EnvToken(pub String);

impl TokenSource for EnvToken {
    fn access_token(&self) -> Option<String> {
        std::env::var(&self.0).ok().filter(|s| !s.trim().is_empty())
    }
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn access_token(&self) -> Option<String> {
        self()
    }
}
