//! The chunks the joiner ships to output sinks.
//!
//! A block bundles up to one block-capacity's worth of parent records with
//! every child row belonging to those parents. Parents are in ascending
//! `(id, version)` order; child arrays are in ascending
//! `(id, version, sequence)` order and each parent's children form a
//! contiguous sub-range.

use crate::types::{
    Changeset, ChangesetComment, ChangesetTag, ElementTag, Node, Relation, RelationMember, Way,
    WayNode,
};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChangesetBlock {
    pub changesets: Vec<Changeset>,
    pub tags: Vec<ChangesetTag>,
    pub comments: Vec<ChangesetComment>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NodeBlock {
    pub nodes: Vec<Node>,
    pub tags: Vec<ElementTag>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WayBlock {
    pub ways: Vec<Way>,
    pub way_nodes: Vec<WayNode>,
    pub tags: Vec<ElementTag>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RelationBlock {
    pub relations: Vec<Relation>,
    pub members: Vec<RelationMember>,
    pub tags: Vec<ElementTag>,
}
