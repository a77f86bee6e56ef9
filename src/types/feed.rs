//! Feed item types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a feed item.
///
/// The store may persist ids as UUIDs; the kernel treats them as opaque
/// strings and orders them lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedId(String);

impl FeedId {
    /// Create a new FeedId.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the id and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeedId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FeedId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for FeedId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for FeedId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Kind of feed item.
///
/// Persisted names are the ones the feed tables have always held, so
/// `Single` is stored as `"post"` and `Collection` as `"posts"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum FeedType {
    /// A single post.
    #[serde(rename = "post")]
    Single,
    /// A pinned post with related siblings that can take over its slot.
    #[serde(rename = "posts")]
    Collection,
    /// Banner carousel.
    #[default]
    #[serde(rename = "banners")]
    Banner,
    /// Chat entry.
    #[serde(rename = "chat")]
    Chat,
}

impl FeedType {
    /// Parse a feed type from its persisted name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "post" => Some(Self::Single),
            "posts" => Some(Self::Collection),
            "banners" => Some(Self::Banner),
            "chat" => Some(Self::Chat),
            _ => None,
        }
    }

    /// Persisted name of this feed type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "post",
            Self::Collection => "posts",
            Self::Banner => "banners",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate item the caller wants ranked into the feed.
///
/// Scores are supplied by the caller; the kernel only orders and filters.
pub trait Scorable {
    /// Identifier matched against pinned positions and policies.
    fn feed_id(&self) -> &str;
    /// Kind of item.
    fn feed_type(&self) -> FeedType;
    /// Ranking score, higher first.
    fn score(&self) -> f64;
}

/// An entry of the assembled feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed<T> {
    /// Feed item id.
    pub id: FeedId,
    /// Feed item type.
    #[serde(rename = "type")]
    pub feed_type: FeedType,
    /// The caller's item.
    pub data: T,
}

impl<T: Scorable> Feed<T> {
    /// Wrap a scorable item.
    pub fn from_item(data: T) -> Self {
        Self {
            id: FeedId::new(data.feed_id()),
            feed_type: data.feed_type(),
            data,
        }
    }

    /// Score of the wrapped item.
    pub fn score(&self) -> f64 {
        self.data.score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_type_round_trips_persisted_names() {
        for t in [FeedType::Single, FeedType::Collection, FeedType::Banner, FeedType::Chat] {
            assert_eq!(FeedType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(FeedType::from_str("POSTS"), Some(FeedType::Collection));
        assert_eq!(FeedType::from_str("video"), None);
    }

    #[test]
    fn test_feed_type_defaults_to_banner() {
        assert_eq!(FeedType::default(), FeedType::Banner);
    }

    #[test]
    fn test_feed_type_serde_names() {
        let json = serde_json::to_string(&FeedType::Collection).unwrap();
        assert_eq!(json, "\"posts\"");
        let parsed: FeedType = serde_json::from_str("\"banners\"").unwrap();
        assert_eq!(parsed, FeedType::Banner);
    }

    #[test]
    fn test_feed_id_ordering() {
        let a = FeedId::from("a");
        let b = FeedId::from("b");
        assert!(a < b);
        assert_eq!(a.to_string(), "a");
    }
}
