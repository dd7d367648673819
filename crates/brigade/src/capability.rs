//! Capability tags and declarations.
//!
//! A worker declares what it can do either as one tag or as a collection of
//! tags. The declaration is modelled as [`Capability`] and normalized into a
//! [`CapabilitySet`] before anything else in the crate sees it, so the registry
//! and index only ever deal with a non-empty, deduplicated set.

use crate::{Error, Result};
use core::{borrow::Borrow, fmt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// An opaque, non-empty label naming a kind of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    /// Creates a tag, rejecting the empty string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] if `tag` is empty.
    pub fn new(tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(Error::invalid_capability("capability tags must not be empty"));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Hash/Eq of `Tag` match those of the wrapped `String`, so `&str` lookups into
// tag-keyed maps are sound.
impl Borrow<str> for Tag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Tag {
    type Error = Error;

    fn try_from(tag: String) -> Result<Self> {
        Self::new(tag)
    }
}

impl TryFrom<&str> for Tag {
    type Error = Error;

    fn try_from(tag: &str) -> Result<Self> {
        Self::new(tag)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

/// A capability declaration as it arrives at the registration boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// A single tag.
    Single(Tag),
    /// A collection of tags. Must be non-empty; duplicates are collapsed.
    Multiple(Vec<Tag>),
}

impl Capability {
    /// Normalizes the declaration into a canonical [`CapabilitySet`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapability`] for an empty collection.
    pub fn normalize(self) -> Result<CapabilitySet> {
        let tags: BTreeSet<Tag> = match self {
            Self::Single(tag) => BTreeSet::from([tag]),
            Self::Multiple(tags) => tags.into_iter().collect(),
        };
        if tags.is_empty() {
            return Err(Error::invalid_capability(
                "capability set must contain at least one tag",
            ));
        }
        Ok(CapabilitySet(tags))
    }
}

impl From<Tag> for Capability {
    fn from(tag: Tag) -> Self {
        Self::Single(tag)
    }
}

impl FromIterator<Tag> for Capability {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self::Multiple(iter.into_iter().collect())
    }
}

impl TryFrom<&str> for Capability {
    type Error = Error;

    fn try_from(tag: &str) -> Result<Self> {
        Tag::new(tag).map(Self::Single)
    }
}

/// Decodes a dynamically-shaped declaration.
///
/// Exactly two shapes are legal: a string, or a non-empty array whose members
/// are all strings. Anything else is [`Error::InvalidCapability`].
impl TryFrom<Value> for Capability {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(tag) => Tag::new(tag).map(Self::Single),
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(Error::invalid_capability(
                        "capability set must contain at least one tag",
                    ));
                }
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(tag) => Tag::new(tag),
                        other => Err(Error::invalid_capability(format!(
                            "capability tags must be strings, found {}",
                            shape_of(&other)
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Self::Multiple)
            }
            other => Err(Error::invalid_capability(format!(
                "expected a tag or a non-empty array of tags, found {}",
                shape_of(&other)
            ))),
        }
    }
}

const fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The canonical, non-empty set of tags a worker serves.
///
/// Only obtainable through [`Capability::normalize`], which guarantees at
/// least one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Tag>);

impl CapabilitySet {
    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a Tag;
    type IntoIter = std::collections::btree_set::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
