use std::fmt;

/// API credential for the orchestrator.
///
/// Kept opaque so it never ends up in log lines or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// How requests authenticate against the orchestrator.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// User name plus API token, sent as HTTP basic auth.
    Basic { user: String, token: Token },
    /// Token sent as a bearer credential.
    Bearer(Token),
}

impl Credentials {
    pub fn new(user: Option<String>, token: Token) -> Self {
        match user {
            Some(user) if !user.trim().is_empty() => Self::Basic { user, token },
            _ => Self::Bearer(token),
        }
    }

    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::Basic { user, token } => request.basic_auth(user, Some(token.as_str())),
            Self::Bearer(token) => request.bearer_auth(token.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_debug_is_redacted() {
        let token = Token::from("11aa22bb33cc");
        assert_eq!(format!("{token:?}"), "Token(***)");
        assert_eq!(token.as_str(), "11aa22bb33cc");
    }

    #[test]
    fn test_blank_user_falls_back_to_bearer() {
        let creds = Credentials::new(Some("  ".to_string()), Token::from("t"));
        assert!(matches!(creds, Credentials::Bearer(_)));

        let creds = Credentials::new(Some("ci-bot".to_string()), Token::from("t"));
        assert!(matches!(creds, Credentials::Basic { ref user, .. } if user == "ci-bot"));
    }
}
