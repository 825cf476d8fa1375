#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_NODE_ID_LEN: usize = 256;
const MAX_TAG_LEN: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, NodeIdError> {
        let value = value.into();
        validate_node_id(&value)?;
        Ok(Self(value.trim().to_string()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = NodeIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeIdError {
    Empty,
    TooLong,
    ContainsControl,
}

impl NodeIdError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "node id must not be empty",
            Self::TooLong => "node id is too long",
            Self::ContainsControl => "node id contains control characters",
        }
    }
}

impl fmt::Display for NodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for NodeIdError {}

fn validate_node_id(value: &str) -> Result<(), NodeIdError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(NodeIdError::Empty);
    }
    if trimmed.len() > MAX_NODE_ID_LEN {
        return Err(NodeIdError::TooLong);
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(NodeIdError::ContainsControl);
    }
    Ok(())
}

/// Names one hierarchy (`category`, `pattern`, `nav`, ...). Tags are
/// compared case-insensitively, so they are stored lowercased.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HierarchyTag(String);

impl HierarchyTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, HierarchyTagError> {
        let value = value.into();
        validate_tag(&value)?;
        Ok(Self(value.trim().to_ascii_lowercase()))
    }
}

impl fmt::Display for HierarchyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for HierarchyTag {
    type Error = HierarchyTagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<HierarchyTag> for String {
    fn from(value: HierarchyTag) -> Self {
        value.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HierarchyTagError {
    Empty,
    TooLong,
    ContainsWhitespace,
    ContainsControl,
}

impl HierarchyTagError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "hierarchy tag must not be empty",
            Self::TooLong => "hierarchy tag is too long",
            Self::ContainsWhitespace => "hierarchy tag must not contain whitespace",
            Self::ContainsControl => "hierarchy tag contains control characters",
        }
    }
}

impl fmt::Display for HierarchyTagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for HierarchyTagError {}

fn validate_tag(value: &str) -> Result<(), HierarchyTagError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(HierarchyTagError::Empty);
    }
    if trimmed.len() > MAX_TAG_LEN {
        return Err(HierarchyTagError::TooLong);
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(HierarchyTagError::ContainsControl);
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(HierarchyTagError::ContainsWhitespace);
    }
    Ok(())
}
