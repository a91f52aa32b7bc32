//! Typed records for every table of the relational dump.
//!
//! These are plain data structs; parsing, binary codecs and join behavior
//! live in the `copy`, `records` and `join` modules. All timestamps are
//! naive UTC, truncated to whole seconds.

mod block;

pub use block::{ChangesetBlock, NodeBlock, RelationBlock, WayBlock};

use chrono::NaiveDateTime;

/// Account standing of a user row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Pending,
    Active,
    Confirmed,
    Suspended,
    Deleted,
}

impl UserStatus {
    pub fn ordinal(self) -> u8 {
        match self {
            UserStatus::Pending => 0,
            UserStatus::Active => 1,
            UserStatus::Confirmed => 2,
            UserStatus::Suspended => 3,
            UserStatus::Deleted => 4,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(UserStatus::Pending),
            1 => Some(UserStatus::Active),
            2 => Some(UserStatus::Confirmed),
            3 => Some(UserStatus::Suspended),
            4 => Some(UserStatus::Deleted),
            _ => None,
        }
    }
}

/// Markup format of free-text columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Html,
    Markdown,
    Text,
}

impl TextFormat {
    pub fn ordinal(self) -> u8 {
        match self {
            TextFormat::Html => 0,
            TextFormat::Markdown => 1,
            TextFormat::Text => 2,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(TextFormat::Html),
            1 => Some(TextFormat::Markdown),
            2 => Some(TextFormat::Text),
            _ => None,
        }
    }
}

/// The three element kinds a relation member can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Node,
    Way,
    Relation,
}

impl ElementType {
    pub fn ordinal(self) -> u8 {
        match self {
            ElementType::Node => 0,
            ElementType::Way => 1,
            ElementType::Relation => 2,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(ElementType::Node),
            1 => Some(ElementType::Way),
            2 => Some(ElementType::Relation),
            _ => None,
        }
    }

    /// The XML attribute value for this member type.
    pub fn as_str(self) -> &'static str {
        match self {
            ElementType::Node => "node",
            ElementType::Way => "way",
            ElementType::Relation => "relation",
        }
    }
}

/// One row of the `users` table, projected to the columns the dump needs.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub display_name: String,
    pub data_public: bool,
    pub status: UserStatus,
    pub description_format: TextFormat,
}

/// One row of the `changesets` table.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub id: i64,
    pub uid: i32,
    pub created_at: NaiveDateTime,
    pub min_lat: Option<i32>,
    pub max_lat: Option<i32>,
    pub min_lon: Option<i32>,
    pub max_lon: Option<i32>,
    pub closed_at: NaiveDateTime,
    pub num_changes: i32,
}

impl Changeset {
    /// Returns the bounding box as (min_lat, min_lon, max_lat, max_lon)
    /// when all four corners are present.
    pub fn bbox(&self) -> Option<(i32, i32, i32, i32)> {
        Some((self.min_lat?, self.min_lon?, self.max_lat?, self.max_lon?))
    }
}

/// One version of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub version: i64,
    pub changeset_id: i64,
    pub timestamp: NaiveDateTime,
    pub visible: bool,
    pub redaction_id: Option<i32>,
    pub latitude: i32,
    pub longitude: i32,
}

/// One version of a way.
#[derive(Debug, Clone, PartialEq)]
pub struct Way {
    pub id: i64,
    pub version: i64,
    pub changeset_id: i64,
    pub timestamp: NaiveDateTime,
    pub visible: bool,
    pub redaction_id: Option<i32>,
}

/// One version of a relation.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub id: i64,
    pub version: i64,
    pub changeset_id: i64,
    pub timestamp: NaiveDateTime,
    pub visible: bool,
    pub redaction_id: Option<i32>,
}

/// A tag on a changeset. Changesets are unversioned, so the key is
/// `(element_id, key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesetTag {
    pub element_id: i64,
    pub key: String,
    pub value: String,
}

/// A tag on one version of a node, way or relation.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementTag {
    pub element_id: i64,
    pub version: i64,
    pub key: String,
    pub value: String,
}

/// One entry of a way's node list.
#[derive(Debug, Clone, PartialEq)]
pub struct WayNode {
    pub way_id: i64,
    pub version: i64,
    pub sequence_id: i64,
    pub node_id: i64,
}

/// One entry of a relation's member list.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationMember {
    pub relation_id: i64,
    pub version: i64,
    pub sequence_id: i32,
    pub member_type: ElementType,
    pub member_id: i64,
    pub member_role: String,
}

/// One comment of a changeset discussion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesetComment {
    pub changeset_id: i64,
    pub created_at: NaiveDateTime,
    pub author_id: i32,
    pub body: String,
    pub visible: bool,
}
