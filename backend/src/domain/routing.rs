//! Routing keys and topic binding patterns.
//!
//! A routing key is a dot-delimited sequence of words attached to every
//! published message (`book.deleted`). A binding pattern has the same shape
//! but may use the topic wildcards `*` (exactly one word) and `#` (zero or
//! more words). Both types validate on construction so adapters never see a
//! malformed key.

use std::fmt;

/// Maximum encoded length of a routing key (AMQP short string).
pub const ROUTING_KEY_MAX_LEN: usize = 255;

const SINGLE_WORD_WILDCARD: &str = "*";
const MULTI_WORD_WILDCARD: &str = "#";

/// Validation failures for routing keys and binding patterns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingKeyError {
    /// The key was empty.
    #[error("routing key must not be empty")]
    Empty,
    /// The key exceeds the transport limit.
    #[error("routing key exceeds {max} bytes (got {len})")]
    TooLong {
        /// Observed length in bytes.
        len: usize,
        /// Permitted length in bytes.
        max: usize,
    },
    /// Two dots were adjacent, or the key started or ended with a dot.
    #[error("routing key `{key}` contains an empty word")]
    EmptyWord {
        /// Offending key.
        key: String,
    },
    /// A word contained a character outside `[A-Za-z0-9_-]`.
    #[error("routing key `{key}` contains invalid character `{character}`")]
    InvalidCharacter {
        /// Offending key.
        key: String,
        /// First invalid character.
        character: char,
    },
    /// A wildcard appeared in a concrete routing key.
    #[error("routing key `{key}` must not contain wildcards")]
    WildcardInKey {
        /// Offending key.
        key: String,
    },
}

/// A concrete routing key used when publishing.
///
/// # Examples
///
/// ```
/// use bookworm_events::domain::RoutingKey;
///
/// let key = RoutingKey::new("book.deleted")?;
/// assert_eq!(key.as_str(), "book.deleted");
/// assert!(RoutingKey::new("book.*").is_err());
/// # Ok::<(), bookworm_events::domain::RoutingKeyError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Validate and wrap a routing key.
    pub fn new(key: impl Into<String>) -> Result<Self, RoutingKeyError> {
        let key = key.into();
        validate(&key, false)?;
        Ok(Self(key))
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the dot-separated words.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for RoutingKey {
    type Error = RoutingKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// A binding pattern used when subscribing.
///
/// # Examples
///
/// ```
/// use bookworm_events::domain::{RoutingKey, RoutingPattern};
///
/// let pattern = RoutingPattern::new("book.*")?;
/// assert!(pattern.matches(&RoutingKey::new("book.deleted")?));
/// assert!(!pattern.matches(&RoutingKey::new("book.cover.deleted")?));
/// # Ok::<(), bookworm_events::domain::RoutingKeyError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingPattern(String);

impl RoutingPattern {
    /// Validate and wrap a binding pattern.
    pub fn new(pattern: impl Into<String>) -> Result<Self, RoutingKeyError> {
        let pattern = pattern.into();
        validate(&pattern, true)?;
        Ok(Self(pattern))
    }

    /// Borrow the pattern as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return true when the pattern routes `key` under topic semantics.
    #[must_use]
    pub fn matches(&self, key: &RoutingKey) -> bool {
        let pattern: Vec<&str> = self.0.split('.').collect();
        let words: Vec<&str> = key.words().collect();
        matches_words(&pattern, &words)
    }
}

impl fmt::Display for RoutingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<RoutingKey> for RoutingPattern {
    fn from(key: RoutingKey) -> Self {
        Self(key.0)
    }
}

impl TryFrom<&str> for RoutingPattern {
    type Error = RoutingKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

fn validate(key: &str, allow_wildcards: bool) -> Result<(), RoutingKeyError> {
    if key.is_empty() {
        return Err(RoutingKeyError::Empty);
    }
    if key.len() > ROUTING_KEY_MAX_LEN {
        return Err(RoutingKeyError::TooLong {
            len: key.len(),
            max: ROUTING_KEY_MAX_LEN,
        });
    }

    for word in key.split('.') {
        if word.is_empty() {
            return Err(RoutingKeyError::EmptyWord {
                key: key.to_owned(),
            });
        }
        if word == SINGLE_WORD_WILDCARD || word == MULTI_WORD_WILDCARD {
            if allow_wildcards {
                continue;
            }
            return Err(RoutingKeyError::WildcardInKey {
                key: key.to_owned(),
            });
        }
        if let Some(character) = word
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(RoutingKeyError::InvalidCharacter {
                key: key.to_owned(),
                character,
            });
        }
    }
    Ok(())
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&MULTI_WORD_WILDCARD, rest)) => (0..=key.len())
            .any(|skip| matches_words(rest, key.get(skip..).unwrap_or_default())),
        Some((&SINGLE_WORD_WILDCARD, rest)) => key
            .split_first()
            .is_some_and(|(_, tail)| matches_words(rest, tail)),
        Some((word, rest)) => key
            .split_first()
            .is_some_and(|(head, tail)| head == word && matches_words(rest, tail)),
    }
}
