//! Shared identifiers.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Opaque token correlating a request with its progress notifications and
/// its registry entry. Clients may send either a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    String(String),
    Integer(i64),
}

impl ProgressToken {
    /// Generate a fresh server-side token.
    pub fn generate() -> Self {
        ProgressToken::String(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressToken::String(value) => f.write_str(value),
            ProgressToken::Integer(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for ProgressToken {
    fn from(value: &str) -> Self {
        ProgressToken::String(value.to_string())
    }
}

impl From<String> for ProgressToken {
    fn from(value: String) -> Self {
        ProgressToken::String(value)
    }
}

impl From<i64> for ProgressToken {
    fn from(value: i64) -> Self {
        ProgressToken::Integer(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn accepts_string_and_integer_tokens() {
        let text: ProgressToken = serde_json::from_str("\"tok-1\"").unwrap();
        let number: ProgressToken = serde_json::from_str("42").unwrap();

        assert_eq!(text, ProgressToken::from("tok-1"));
        assert_eq!(number, ProgressToken::Integer(42));
        assert_eq!(number.to_string(), "42");
    }

    #[test]
    fn generated_tokens_are_unique() {
        assert_ne!(ProgressToken::generate(), ProgressToken::generate());
    }
}
