//! Per-table record descriptions.
//!
//! Each table record knows how to build itself from a projected COPY row
//! and how to round-trip through the sorted-run `(key, value)` encoding.
//! The key holds exactly the sort-determining prefix of the record; the
//! value the remainder. `WayNode`, `RelationMember` and the tag types
//! override the field order so that their sort key is
//! `(id[, version][, sequence])` regardless of the column layout.

pub mod codec;

use chrono::NaiveDateTime;

use crate::copy::ProjectedRow;
use crate::error::{DumpError, DumpResult};
use crate::records::codec::{
    ByteReader, Codec, put_bool, put_i32, put_i64, put_option, put_str, put_u8,
};
use crate::types::{
    Changeset, ChangesetComment, ChangesetTag, ElementTag, ElementType, Node, Relation,
    RelationMember, TextFormat, User, UserStatus, Way, WayNode,
};

/// A typed row of one dump table.
pub trait TableRecord: Sized + Send + 'static {
    /// Builds the record from a projected row. Field indices follow the
    /// column list the extraction registry declares for the table.
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self>;

    /// Appends the sort key and the remaining fields to the two buffers.
    fn encode(&self, codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>);

    /// Rebuilds the record from its key and value encodings.
    fn decode(codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self>;

    /// The timestamp that feeds the table's `.complete` sentinel.
    fn timestamp(&self) -> Option<NaiveDateTime> {
        None
    }
}

impl TableRecord for User {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(User {
            id: row.i64(0)?,
            display_name: row.string(1)?,
            data_public: row.bool(2)?,
            status: row.user_status(3)?,
            description_format: row.text_format(4)?,
        })
    }

    fn encode(&self, _codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.id);
        put_str(value, &self.display_name);
        put_bool(value, self.data_public);
        put_u8(value, self.status.ordinal());
        put_u8(value, self.description_format.ordinal());
    }

    fn decode(_codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(User {
            id: key.get_i64()?,
            display_name: value.get_str()?,
            data_public: value.get_bool()?,
            status: decode_user_status(&mut value)?,
            description_format: decode_text_format(&mut value)?,
        })
    }
}

impl TableRecord for Changeset {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(Changeset {
            id: row.i64(0)?,
            uid: row.i32(1)?,
            created_at: row.timestamp(2)?,
            min_lat: row.opt_i32(3)?,
            max_lat: row.opt_i32(4)?,
            min_lon: row.opt_i32(5)?,
            max_lon: row.opt_i32(6)?,
            closed_at: row.timestamp(7)?,
            num_changes: row.i32(8)?,
        })
    }

    fn encode(&self, codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.id);
        put_i32(value, self.uid);
        codec.put_timestamp(value, self.created_at);
        put_option(value, self.min_lat.as_ref(), |b, v| put_i32(b, *v));
        put_option(value, self.max_lat.as_ref(), |b, v| put_i32(b, *v));
        put_option(value, self.min_lon.as_ref(), |b, v| put_i32(b, *v));
        put_option(value, self.max_lon.as_ref(), |b, v| put_i32(b, *v));
        codec.put_timestamp(value, self.closed_at);
        put_i32(value, self.num_changes);
    }

    fn decode(codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(Changeset {
            id: key.get_i64()?,
            uid: value.get_i32()?,
            created_at: codec.get_timestamp(&mut value)?,
            min_lat: value.get_option(|r| r.get_i32())?,
            max_lat: value.get_option(|r| r.get_i32())?,
            min_lon: value.get_option(|r| r.get_i32())?,
            max_lon: value.get_option(|r| r.get_i32())?,
            closed_at: codec.get_timestamp(&mut value)?,
            num_changes: value.get_i32()?,
        })
    }

    fn timestamp(&self) -> Option<NaiveDateTime> {
        Some(self.created_at)
    }
}

impl TableRecord for Node {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(Node {
            id: row.i64(0)?,
            version: row.i64(1)?,
            changeset_id: row.i64(2)?,
            timestamp: row.timestamp(3)?,
            visible: row.bool(4)?,
            redaction_id: row.opt_i32(5)?,
            latitude: row.i32(6)?,
            longitude: row.i32(7)?,
        })
    }

    fn encode(&self, codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.id);
        put_i64(key, self.version);
        put_i64(value, self.changeset_id);
        codec.put_timestamp(value, self.timestamp);
        put_bool(value, self.visible);
        put_option(value, self.redaction_id.as_ref(), |b, v| put_i32(b, *v));
        put_i32(value, self.latitude);
        put_i32(value, self.longitude);
    }

    fn decode(codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(Node {
            id: key.get_i64()?,
            version: key.get_i64()?,
            changeset_id: value.get_i64()?,
            timestamp: codec.get_timestamp(&mut value)?,
            visible: value.get_bool()?,
            redaction_id: value.get_option(|r| r.get_i32())?,
            latitude: value.get_i32()?,
            longitude: value.get_i32()?,
        })
    }

    fn timestamp(&self) -> Option<NaiveDateTime> {
        Some(self.timestamp)
    }
}

impl TableRecord for Way {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(Way {
            id: row.i64(0)?,
            version: row.i64(1)?,
            changeset_id: row.i64(2)?,
            timestamp: row.timestamp(3)?,
            visible: row.bool(4)?,
            redaction_id: row.opt_i32(5)?,
        })
    }

    fn encode(&self, codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.id);
        put_i64(key, self.version);
        put_i64(value, self.changeset_id);
        codec.put_timestamp(value, self.timestamp);
        put_bool(value, self.visible);
        put_option(value, self.redaction_id.as_ref(), |b, v| put_i32(b, *v));
    }

    fn decode(codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(Way {
            id: key.get_i64()?,
            version: key.get_i64()?,
            changeset_id: value.get_i64()?,
            timestamp: codec.get_timestamp(&mut value)?,
            visible: value.get_bool()?,
            redaction_id: value.get_option(|r| r.get_i32())?,
        })
    }

    fn timestamp(&self) -> Option<NaiveDateTime> {
        Some(self.timestamp)
    }
}

impl TableRecord for Relation {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(Relation {
            id: row.i64(0)?,
            version: row.i64(1)?,
            changeset_id: row.i64(2)?,
            timestamp: row.timestamp(3)?,
            visible: row.bool(4)?,
            redaction_id: row.opt_i32(5)?,
        })
    }

    fn encode(&self, codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.id);
        put_i64(key, self.version);
        put_i64(value, self.changeset_id);
        codec.put_timestamp(value, self.timestamp);
        put_bool(value, self.visible);
        put_option(value, self.redaction_id.as_ref(), |b, v| put_i32(b, *v));
    }

    fn decode(codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(Relation {
            id: key.get_i64()?,
            version: key.get_i64()?,
            changeset_id: value.get_i64()?,
            timestamp: codec.get_timestamp(&mut value)?,
            visible: value.get_bool()?,
            redaction_id: value.get_option(|r| r.get_i32())?,
        })
    }

    fn timestamp(&self) -> Option<NaiveDateTime> {
        Some(self.timestamp)
    }
}

impl TableRecord for ChangesetTag {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(ChangesetTag {
            element_id: row.i64(0)?,
            key: row.string(1)?,
            value: row.string(2)?,
        })
    }

    fn encode(&self, _codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.element_id);
        put_str(key, &self.key);
        put_str(value, &self.value);
    }

    fn decode(_codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(ChangesetTag {
            element_id: key.get_i64()?,
            key: key.get_str()?,
            value: value.get_str()?,
        })
    }
}

impl TableRecord for ElementTag {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(ElementTag {
            element_id: row.i64(0)?,
            version: row.i64(1)?,
            key: row.string(2)?,
            value: row.string(3)?,
        })
    }

    fn encode(&self, _codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.element_id);
        put_i64(key, self.version);
        put_str(key, &self.key);
        put_str(value, &self.value);
    }

    fn decode(_codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(ElementTag {
            element_id: key.get_i64()?,
            version: key.get_i64()?,
            key: key.get_str()?,
            value: value.get_str()?,
        })
    }
}

impl TableRecord for WayNode {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(WayNode {
            way_id: row.i64(0)?,
            version: row.i64(1)?,
            sequence_id: row.i64(2)?,
            node_id: row.i64(3)?,
        })
    }

    fn encode(&self, _codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.way_id);
        put_i64(key, self.version);
        put_i64(key, self.sequence_id);
        put_i64(value, self.node_id);
    }

    fn decode(_codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(WayNode {
            way_id: key.get_i64()?,
            version: key.get_i64()?,
            sequence_id: key.get_i64()?,
            node_id: value.get_i64()?,
        })
    }
}

impl TableRecord for RelationMember {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(RelationMember {
            relation_id: row.i64(0)?,
            version: row.i64(1)?,
            sequence_id: row.i32(2)?,
            member_type: row.element_type(3)?,
            member_id: row.i64(4)?,
            member_role: row.string(5)?,
        })
    }

    fn encode(&self, _codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.relation_id);
        put_i64(key, self.version);
        put_i32(key, self.sequence_id);
        put_u8(value, self.member_type.ordinal());
        put_i64(value, self.member_id);
        put_str(value, &self.member_role);
    }

    fn decode(_codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(RelationMember {
            relation_id: key.get_i64()?,
            version: key.get_i64()?,
            sequence_id: key.get_i32()?,
            member_type: decode_element_type(&mut value)?,
            member_id: value.get_i64()?,
            member_role: value.get_str()?,
        })
    }
}

impl TableRecord for ChangesetComment {
    fn from_row(row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Ok(ChangesetComment {
            changeset_id: row.i64(0)?,
            created_at: row.timestamp(1)?,
            author_id: row.i32(2)?,
            body: row.string(3)?,
            visible: row.bool(4)?,
        })
    }

    fn encode(&self, codec: &Codec, key: &mut Vec<u8>, value: &mut Vec<u8>) {
        put_i64(key, self.changeset_id);
        codec.put_timestamp(key, self.created_at);
        put_i32(value, self.author_id);
        put_str(value, &self.body);
        put_bool(value, self.visible);
    }

    fn decode(codec: &Codec, key: &[u8], value: &[u8]) -> DumpResult<Self> {
        let mut key = ByteReader::new(key);
        let mut value = ByteReader::new(value);
        Ok(ChangesetComment {
            changeset_id: key.get_i64()?,
            created_at: codec.get_timestamp(&mut key)?,
            author_id: value.get_i32()?,
            body: value.get_str()?,
            visible: value.get_bool()?,
        })
    }

    fn timestamp(&self) -> Option<NaiveDateTime> {
        Some(self.created_at)
    }
}

/// Stand-in child type for parents without an inner table. Its sorted
/// stream is always absent, so none of its record methods can ever run.
pub enum NoRecord {}

impl TableRecord for NoRecord {
    fn from_row(_row: &ProjectedRow<'_>) -> DumpResult<Self> {
        Err(DumpError::internal("NoRecord cannot be constructed"))
    }

    fn encode(&self, _codec: &Codec, _key: &mut Vec<u8>, _value: &mut Vec<u8>) {
        match *self {}
    }

    fn decode(_codec: &Codec, _key: &[u8], _value: &[u8]) -> DumpResult<Self> {
        Err(DumpError::internal("NoRecord cannot be constructed"))
    }
}

fn decode_user_status(reader: &mut ByteReader<'_>) -> DumpResult<UserStatus> {
    let ordinal = reader.get_u8()?;
    UserStatus::from_ordinal(ordinal)
        .ok_or_else(|| DumpError::internal(format!("invalid user status ordinal: {ordinal}")))
}

fn decode_text_format(reader: &mut ByteReader<'_>) -> DumpResult<TextFormat> {
    let ordinal = reader.get_u8()?;
    TextFormat::from_ordinal(ordinal)
        .ok_or_else(|| DumpError::internal(format!("invalid text format ordinal: {ordinal}")))
}

fn decode_element_type(reader: &mut ByteReader<'_>) -> DumpResult<ElementType> {
    let ordinal = reader.get_u8()?;
    ElementType::from_ordinal(ordinal)
        .ok_or_else(|| DumpError::internal(format!("invalid member type ordinal: {ordinal}")))
}
