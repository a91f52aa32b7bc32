//! PBF output backend.
//!
//! Elements are grouped into primitive groups of one kind each, packed
//! into primitive blocks with a per-block string table, and framed as
//! zlib-compressed blobs. Nodes can be emitted as delta-encoded dense
//! arrays; the parallel arrays must stay exactly co-indexed, which is
//! checked before every group is sealed. Changesets cannot be represented
//! in this format and are ignored.

pub mod format;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use chrono::NaiveDateTime;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use prost::Message;

use crate::error::{DumpError, DumpResult};
use crate::types::{ChangesetBlock, ElementTag, ElementType, NodeBlock, RelationBlock, WayBlock};
use crate::users::UserStore;
use crate::writer::{OutputSink, matching_range};

const OSM_API_ORIGIN: &str = "http://www.openstreetmap.org/api/0.6";

/// Nanodegrees per degree; the header bbox is expressed in these.
const LONLAT_RESOLUTION: i64 = 1_000_000_000;

/// Elements per primitive group before a group boundary is forced.
const MAX_GROUP_ELEMENTS: usize = 16_000;

/// Approximate primitive-block payload ceiling: a quarter of the format's
/// 32 MiB uncompressed blob limit.
const BLOCK_BYTE_LIMIT: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct PbfOptions {
    pub generator: String,
    /// Emit visibility in dense info / info messages.
    pub history: bool,
    pub dense_nodes: bool,
    /// Replication timestamp advertised in the header.
    pub max_time: Option<NaiveDateTime>,
}

/// Tracks the previously written value for one delta-coded column.
#[derive(Default)]
struct Delta {
    value: i64,
}

impl Delta {
    fn update(&mut self, new_value: i64) -> i64 {
        let delta = new_value - self.value;
        self.value = new_value;
        delta
    }
}

#[derive(Default)]
struct StringTableBuilder {
    indexes: HashMap<String, u32>,
    strings: Vec<Vec<u8>>,
}

impl StringTableBuilder {
    /// Interns a string, returning its 1-based index; index 0 is the
    /// reserved empty string.
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&index) = self.indexes.get(s) {
            return index;
        }
        let index = self.strings.len() as u32 + 1;
        self.indexes.insert(s.to_string(), index);
        self.strings.push(s.as_bytes().to_vec());
        index
    }

    fn build(&mut self) -> format::StringTable {
        let mut s = Vec::with_capacity(self.strings.len() + 1);
        s.push(Vec::new());
        s.append(&mut self.strings);
        self.indexes.clear();
        format::StringTable { s }
    }
}

#[derive(Default)]
struct DenseBuffer {
    id: Vec<i64>,
    lat: Vec<i64>,
    lon: Vec<i64>,
    version: Vec<i32>,
    timestamp: Vec<i64>,
    changeset: Vec<i64>,
    uid: Vec<i32>,
    user_sid: Vec<i32>,
    visible: Vec<bool>,
    keys_vals: Vec<i32>,
    id_delta: Delta,
    lat_delta: Delta,
    lon_delta: Delta,
    timestamp_delta: Delta,
    changeset_delta: Delta,
    uid_delta: Delta,
    user_sid_delta: Delta,
}

#[derive(Default)]
struct GroupBuffer {
    nodes: Vec<format::Node>,
    dense: DenseBuffer,
    ways: Vec<format::Way>,
    relations: Vec<format::Relation>,
}

impl GroupBuffer {
    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.dense.id.is_empty()
            && self.ways.is_empty()
            && self.relations.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Node,
    Way,
    Relation,
}

pub struct PbfWriter {
    out: Box<dyn Write + Send>,
    users: Arc<UserStore>,
    options: PbfOptions,
    strings: StringTableBuilder,
    sealed_groups: Vec<format::PrimitiveGroup>,
    current: GroupBuffer,
    kind: Option<ElementKind>,
    group_elements: usize,
    approx_bytes: usize,
}

impl PbfWriter {
    pub fn new(
        out: Box<dyn Write + Send>,
        users: Arc<UserStore>,
        options: PbfOptions,
    ) -> DumpResult<Self> {
        let mut writer = Self {
            out,
            users,
            options,
            strings: StringTableBuilder::default(),
            sealed_groups: Vec::new(),
            current: GroupBuffer::default(),
            kind: None,
            group_elements: 0,
            approx_bytes: 0,
        };
        writer.write_header_block()?;
        Ok(writer)
    }

    fn write_header_block(&mut self) -> DumpResult<()> {
        let mut required_features = vec![format!("OsmSchema-V{}", "0.6")];
        if self.options.dense_nodes {
            required_features.push("DenseNodes".to_string());
        }

        let header = format::HeaderBlock {
            bbox: Some(format::HeaderBBox {
                left: -180 * LONLAT_RESOLUTION,
                right: 180 * LONLAT_RESOLUTION,
                top: 90 * LONLAT_RESOLUTION,
                bottom: -90 * LONLAT_RESOLUTION,
            }),
            required_features,
            optional_features: vec![
                "Has_Metadata".to_string(),
                "Sort.Type_then_ID".to_string(),
            ],
            writingprogram: Some(self.options.generator.clone()),
            source: Some(OSM_API_ORIGIN.to_string()),
            osmosis_replication_timestamp: self.options.max_time.map(unix_seconds),
        };
        self.write_blob(&header, "OSMHeader")
    }

    fn write_blob(&mut self, message: &impl Message, blob_type: &str) -> DumpResult<()> {
        let raw = message.encode_to_vec();

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&raw).map_err(pbf_err)?;
        let compressed = encoder.finish().map_err(pbf_err)?;

        let blob = format::Blob {
            raw: None,
            raw_size: Some(raw.len() as i32),
            zlib_data: Some(compressed),
        };
        let blob_bytes = blob.encode_to_vec();

        let header = format::BlobHeader {
            r#type: blob_type.to_string(),
            datasize: blob_bytes.len() as i32,
        };
        let header_bytes = header.encode_to_vec();

        self.out
            .write_all(&(header_bytes.len() as u32).to_be_bytes())
            .map_err(pbf_err)?;
        self.out.write_all(&header_bytes).map_err(pbf_err)?;
        self.out.write_all(&blob_bytes).map_err(pbf_err)?;
        Ok(())
    }

    /// Enforces group/block boundaries before an element of `kind` is
    /// appended.
    fn overflow(&mut self, kind: ElementKind) -> DumpResult<()> {
        if self.kind.is_none() {
            self.kind = Some(kind);
        }
        if self.kind != Some(kind) || self.group_elements >= MAX_GROUP_ELEMENTS {
            let new_block = self.kind != Some(kind) || self.approx_bytes >= BLOCK_BYTE_LIMIT;
            self.seal_group()?;
            if new_block {
                self.flush_block()?;
            }
            self.kind = Some(kind);
            self.group_elements = 0;
        }
        Ok(())
    }

    fn seal_group(&mut self) -> DumpResult<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        self.check_dense_columns()?;

        let buffer = std::mem::take(&mut self.current);
        let dense = if buffer.dense.id.is_empty() {
            None
        } else {
            let d = buffer.dense;
            Some(format::DenseNodes {
                id: d.id,
                denseinfo: Some(format::DenseInfo {
                    version: d.version,
                    timestamp: d.timestamp,
                    changeset: d.changeset,
                    uid: d.uid,
                    user_sid: d.user_sid,
                    visible: d.visible,
                }),
                lat: d.lat,
                lon: d.lon,
                keys_vals: d.keys_vals,
            })
        };

        self.sealed_groups.push(format::PrimitiveGroup {
            nodes: buffer.nodes,
            dense,
            ways: buffer.ways,
            relations: buffer.relations,
        });
        Ok(())
    }

    /// The dense columns must be exactly co-indexed before a group may be
    /// sealed; divergence is a bug in the writer, not bad input.
    fn check_dense_columns(&self) -> DumpResult<()> {
        let d = &self.current.dense;
        let n = d.id.len();
        let mut ok = d.lat.len() == n
            && d.lon.len() == n
            && d.version.len() == n
            && d.timestamp.len() == n
            && d.changeset.len() == n
            && d.uid.len() == n
            && d.user_sid.len() == n;
        if self.options.history {
            ok = ok && d.visible.len() == n;
        }
        if !ok {
            return Err(DumpError::internal(
                "dense node columns are not equally long",
            ));
        }
        Ok(())
    }

    fn flush_block(&mut self) -> DumpResult<()> {
        if self.sealed_groups.is_empty() {
            return Ok(());
        }

        let block = format::PrimitiveBlock {
            stringtable: self.strings.build(),
            primitivegroup: std::mem::take(&mut self.sealed_groups),
            granularity: None,
            lat_offset: None,
            lon_offset: None,
            date_granularity: None,
        };
        self.approx_bytes = 0;
        self.write_blob(&block, "OSMData")
    }

    fn intern_tags(&mut self, tags: &[ElementTag]) -> (Vec<u32>, Vec<u32>) {
        let mut keys = Vec::with_capacity(tags.len());
        let mut vals = Vec::with_capacity(tags.len());
        for tag in tags {
            keys.push(self.strings.intern(&tag.key));
            vals.push(self.strings.intern(&tag.value));
            self.approx_bytes += tag.key.len() + tag.value.len() + 8;
        }
        (keys, vals)
    }

    fn build_info(
        &mut self,
        version: i64,
        timestamp: NaiveDateTime,
        changeset_id: i64,
        visible: bool,
    ) -> format::Info {
        let user = self.users.user_for_changeset(changeset_id);
        let (uid, user_sid) = match user {
            Some(user) => (
                Some(user.uid as i32),
                Some(self.strings.intern(&user.name)),
            ),
            None => (None, None),
        };
        format::Info {
            version: Some(version as i32),
            timestamp: Some(unix_seconds(timestamp)),
            changeset: Some(changeset_id),
            uid,
            user_sid,
            visible: self.options.history.then_some(visible),
        }
    }
}

fn pbf_err<E>(err: E) -> DumpError
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    DumpError::writer("pbf", err)
}

fn unix_seconds(t: NaiveDateTime) -> i64 {
    t.and_utc().timestamp()
}

fn member_type(t: ElementType) -> format::MemberType {
    match t {
        ElementType::Node => format::MemberType::Node,
        ElementType::Way => format::MemberType::Way,
        ElementType::Relation => format::MemberType::Relation,
    }
}

impl OutputSink for PbfWriter {
    fn name(&self) -> &'static str {
        "pbf"
    }

    async fn changesets(&mut self, _block: Arc<ChangesetBlock>) -> DumpResult<()> {
        // The PBF format has no changeset message.
        Ok(())
    }

    async fn nodes(&mut self, block: Arc<NodeBlock>) -> DumpResult<()> {
        let mut tag_index = 0;
        for node in &block.nodes {
            let tags = matching_range(&block.tags, &mut tag_index, (node.id, node.version), |t| {
                (t.element_id, t.version)
            });

            self.overflow(ElementKind::Node)?;
            self.group_elements += 1;
            self.approx_bytes += 40;

            if self.options.dense_nodes {
                let user = self.users.user_for_changeset(node.changeset_id);
                let (uid, sid) = match user {
                    Some(user) => (user.uid, i64::from(self.strings.intern(&user.name))),
                    None => (0, 0),
                };

                let history = self.options.history;
                let d = &mut self.current.dense;
                d.id.push(d.id_delta.update(node.id));
                d.lat.push(d.lat_delta.update(i64::from(node.latitude)));
                d.lon.push(d.lon_delta.update(i64::from(node.longitude)));
                d.version.push(node.version as i32);
                d.timestamp
                    .push(d.timestamp_delta.update(unix_seconds(node.timestamp)));
                d.changeset.push(d.changeset_delta.update(node.changeset_id));
                d.uid.push(d.uid_delta.update(uid) as i32);
                d.user_sid.push(d.user_sid_delta.update(sid) as i32);
                if history {
                    d.visible.push(node.visible);
                }

                for tag in tags {
                    let key = self.strings.intern(&tag.key) as i32;
                    let val = self.strings.intern(&tag.value) as i32;
                    let d = &mut self.current.dense;
                    d.keys_vals.push(key);
                    d.keys_vals.push(val);
                    self.approx_bytes += tag.key.len() + tag.value.len() + 8;
                }
                self.current.dense.keys_vals.push(0);
            } else {
                let (keys, vals) = self.intern_tags(tags);
                let info = self.build_info(
                    node.version,
                    node.timestamp,
                    node.changeset_id,
                    node.visible,
                );
                self.current.nodes.push(format::Node {
                    id: node.id,
                    keys,
                    vals,
                    info: Some(info),
                    lat: i64::from(node.latitude),
                    lon: i64::from(node.longitude),
                });
            }
        }
        Ok(())
    }

    async fn ways(&mut self, block: Arc<WayBlock>) -> DumpResult<()> {
        let mut tag_index = 0;
        let mut node_index = 0;
        for way in &block.ways {
            let key = (way.id, way.version);
            let tags = matching_range(&block.tags, &mut tag_index, key, |t| {
                (t.element_id, t.version)
            });
            let way_nodes = matching_range(&block.way_nodes, &mut node_index, key, |wn| {
                (wn.way_id, wn.version)
            });

            self.overflow(ElementKind::Way)?;
            self.group_elements += 1;
            self.approx_bytes += 24 + 5 * way_nodes.len();

            let (keys, vals) = self.intern_tags(tags);
            let info = self.build_info(way.version, way.timestamp, way.changeset_id, way.visible);

            // Node references are delta coded within each way.
            let mut ref_delta = Delta::default();
            let refs = way_nodes
                .iter()
                .map(|wn| ref_delta.update(wn.node_id))
                .collect();

            self.current.ways.push(format::Way {
                id: way.id,
                keys,
                vals,
                info: Some(info),
                refs,
            });
        }
        Ok(())
    }

    async fn relations(&mut self, block: Arc<RelationBlock>) -> DumpResult<()> {
        let mut tag_index = 0;
        let mut member_index = 0;
        for relation in &block.relations {
            let key = (relation.id, relation.version);
            let tags = matching_range(&block.tags, &mut tag_index, key, |t| {
                (t.element_id, t.version)
            });
            let members = matching_range(&block.members, &mut member_index, key, |m| {
                (m.relation_id, m.version)
            });

            self.overflow(ElementKind::Relation)?;
            self.group_elements += 1;
            self.approx_bytes += 24 + 8 * members.len();

            let (keys, vals) = self.intern_tags(tags);
            let info = self.build_info(
                relation.version,
                relation.timestamp,
                relation.changeset_id,
                relation.visible,
            );

            let mut roles_sid = Vec::with_capacity(members.len());
            let mut memids = Vec::with_capacity(members.len());
            let mut types = Vec::with_capacity(members.len());
            let mut member_delta = Delta::default();
            for member in members {
                roles_sid.push(self.strings.intern(&member.member_role) as i32);
                memids.push(member_delta.update(member.member_id));
                types.push(member_type(member.member_type) as i32);
                self.approx_bytes += member.member_role.len();
            }

            self.current.relations.push(format::Relation {
                id: relation.id,
                keys,
                vals,
                info: Some(info),
                roles_sid,
                memids,
                types,
            });
        }
        Ok(())
    }

    async fn finish(&mut self) -> DumpResult<()> {
        self.seal_group()?;
        self.flush_block()?;
        self.out.flush().map_err(pbf_err)
    }
}
