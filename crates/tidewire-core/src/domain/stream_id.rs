use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ValidationError;

const MAX_STREAM_ID_LEN: usize = 128;

/// Identifier of one logical stream.
///
/// Stream ids travel in URL paths and log fields, so the alphabet is limited
/// to ASCII alphanumerics plus `.`, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

impl StreamId {
    /// Parse a stream id, trimming surrounding whitespace.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyStreamId);
        }

        let len = trimmed.chars().count();
        if len > MAX_STREAM_ID_LEN {
            return Err(ValidationError::StreamIdTooLong {
                len,
                max: MAX_STREAM_ID_LEN,
            });
        }

        for (index, ch) in trimmed.chars().enumerate() {
            let valid = ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-';
            if !valid {
                return Err(ValidationError::StreamIdInvalidChar { ch, index });
            }
        }

        Ok(Self(trimmed.to_owned()))
    }

    /// Generate a fresh random stream id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for StreamId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for StreamId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<StreamId> for String {
    fn from(value: StreamId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_trims_stream_id() {
        let parsed = StreamId::parse(" reply-42 ").expect("stream id should parse");
        assert_eq!(parsed.as_str(), "reply-42");
    }

    #[test]
    fn rejects_path_separators() {
        let err = StreamId::parse("a/b").expect_err("must fail");
        assert!(matches!(err, ValidationError::StreamIdInvalidChar { ch: '/', index: 1 }));
    }

    #[test]
    fn rejects_overlong_ids() {
        let err = StreamId::parse(&"x".repeat(129)).expect_err("must fail");
        assert!(matches!(err, ValidationError::StreamIdTooLong { len: 129, .. }));
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = StreamId::generate();
        let b = StreamId::generate();
        assert_ne!(a, b);
        assert!(StreamId::parse(a.as_str()).is_ok());
    }
}
