//! MAAS API wire types that are not shared with the rest of the crate.

use serde::{Deserialize, Serialize};

/// Response of `GET nodes/{id}/?op=details`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDetails {
    /// lshw XML hardware report.
    #[serde(default)]
    pub lshw: String,
}

/// OAuth 1.0 credentials parsed from a MAAS API key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// OAuth consumer key.
    pub consumer_key: String,
    /// OAuth token key.
    pub token_key: String,
    /// OAuth token secret.
    pub token_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("consumer_key", &self.consumer_key)
            .field("token_key", &self.token_key)
            .field("token_secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Parse a `consumer_key:token_key:token_secret` API key.
    #[must_use]
    pub fn parse(api_key: &str) -> Option<Self> {
        let mut parts = api_key.split(':');
        let (Some(consumer_key), Some(token_key), Some(token_secret), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        Some(Self {
            consumer_key: consumer_key.to_string(),
            token_key: token_key.to_string(),
            token_secret: token_secret.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_key() {
        let creds = Credentials::parse("consumer:token:secret").unwrap();
        assert_eq!(creds.consumer_key, "consumer");
        assert_eq!(creds.token_key, "token");
        assert_eq!(creds.token_secret, "secret");

        assert!(Credentials::parse("consumer:token").is_none());
        assert!(Credentials::parse("a:b:c:d").is_none());
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = Credentials::parse("consumer:token:hunter2").unwrap();
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
