//! XML output backend.
//!
//! Writes the planet `<osm>` document: changesets (for the changeset
//! dump), nodes, ways and relations with their tags, resolving author
//! attributes through the user store. Element and attribute layout follows
//! the public planet files.

use std::io::Write;
use std::sync::Arc;

use chrono::NaiveDateTime;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::error::{DumpError, DumpResult};
use crate::types::{
    Changeset, ChangesetBlock, ChangesetComment, ChangesetTag, ElementTag, NodeBlock,
    RelationBlock, WayBlock,
};
use crate::users::UserStore;
use crate::writer::{OutputSink, matching_range};

const OSM_LICENSE: &str = "http://opendatacommons.org/licenses/odbl/1-0/";
const OSM_COPYRIGHT: &str = "OpenStreetMap and contributors";
const OSM_VERSION: &str = "0.6";
const OSM_ATTRIBUTION: &str = "http://www.openstreetmap.org/copyright";
const OSM_API_ORIGIN: &str = "http://www.openstreetmap.org/api/0.6";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone)]
pub struct XmlOptions {
    pub generator: String,
    /// Emit `visible` attributes (and deleted versions arrive at all).
    pub history: bool,
    /// Write `<changeset>` elements. Off for planet files, on for the
    /// changeset dump.
    pub changesets: bool,
    /// Write `<discussion>` blocks under changesets.
    pub include_discussions: bool,
    pub coordinate_scale: f64,
}

/// Attribute list under construction; values are owned so they can be
/// assembled with conditionals and formatted numbers before the element
/// borrows them.
type Attributes = Vec<(&'static str, String)>;

fn element<'a>(name: &'static str, attributes: &'a [(&'static str, String)]) -> BytesStart<'a> {
    let mut elem = BytesStart::new(name);
    for (name, value) in attributes {
        elem.push_attribute((*name, value.as_str()));
    }
    elem
}

pub struct XmlWriter {
    writer: Writer<Box<dyn Write + Send>>,
    users: Arc<UserStore>,
    options: XmlOptions,
    now: NaiveDateTime,
}

impl XmlWriter {
    pub fn new(
        out: Box<dyn Write + Send>,
        users: Arc<UserStore>,
        options: XmlOptions,
    ) -> DumpResult<Self> {
        let mut writer = Writer::new_with_indent(out, b' ', 2);
        let now = chrono::Utc::now().naive_utc();

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;

        let osm_attributes: Attributes = vec![
            ("license", OSM_LICENSE.to_string()),
            ("copyright", OSM_COPYRIGHT.to_string()),
            ("version", OSM_VERSION.to_string()),
            ("generator", options.generator.clone()),
            ("attribution", OSM_ATTRIBUTION.to_string()),
            ("timestamp", now.format(TIMESTAMP_FORMAT).to_string()),
        ];
        writer
            .write_event(Event::Start(element("osm", &osm_attributes)))
            .map_err(xml_err)?;

        let bound_attributes: Attributes = vec![
            ("box", "-90,-180,90,180".to_string()),
            ("origin", OSM_API_ORIGIN.to_string()),
        ];
        writer
            .write_event(Event::Empty(element("bound", &bound_attributes)))
            .map_err(xml_err)?;

        Ok(Self {
            writer,
            users,
            options,
            now,
        })
    }

    fn emit(&mut self, event: Event<'_>) -> DumpResult<()> {
        self.writer.write_event(event).map_err(xml_err)
    }

    fn coordinate(&self, scaled: i32) -> String {
        format!("{:.7}", f64::from(scaled) / self.options.coordinate_scale)
    }

    fn timestamp(&self, t: NaiveDateTime) -> String {
        t.format(TIMESTAMP_FORMAT).to_string()
    }

    fn write_tags(&mut self, tags: &[ElementTag]) -> DumpResult<()> {
        for tag in tags {
            let mut elem = BytesStart::new("tag");
            elem.push_attribute(("k", tag.key.as_str()));
            elem.push_attribute(("v", tag.value.as_str()));
            self.emit(Event::Empty(elem))?;
        }
        Ok(())
    }

    /// The attributes every versioned element shares: timestamp, version,
    /// changeset, visibility (history mode) and resolved author.
    fn common_attributes(
        &self,
        attributes: &mut Attributes,
        timestamp: NaiveDateTime,
        version: i64,
        changeset_id: i64,
        visible: bool,
    ) {
        attributes.push(("timestamp", self.timestamp(timestamp)));
        attributes.push(("version", version.to_string()));
        attributes.push(("changeset", changeset_id.to_string()));
        if self.options.history {
            attributes.push(("visible", visible.to_string()));
        }
        if let Some(user) = self.users.user_for_changeset(changeset_id) {
            attributes.push(("user", user.name.to_string()));
            attributes.push(("uid", user.uid.to_string()));
        }
    }

    fn write_changeset(
        &mut self,
        cs: &Changeset,
        tags: &[ChangesetTag],
        comments: &[ChangesetComment],
    ) -> DumpResult<()> {
        let mut attributes: Attributes = vec![
            ("id", cs.id.to_string()),
            ("created_at", self.timestamp(cs.created_at)),
        ];

        // No explicit open flag in the database: a changeset still open at
        // generation time has its closing timestamp in the future.
        let open = cs.closed_at > self.now;
        if !open {
            attributes.push(("closed_at", self.timestamp(cs.closed_at)));
        }
        attributes.push(("open", open.to_string()));

        if let Some(user) = self.users.user(i64::from(cs.uid)) {
            attributes.push(("user", user.name.to_string()));
            attributes.push(("uid", user.uid.to_string()));
        }

        if let Some((min_lat, min_lon, max_lat, max_lon)) = cs.bbox() {
            attributes.push(("min_lat", self.coordinate(min_lat)));
            attributes.push(("min_lon", self.coordinate(min_lon)));
            attributes.push(("max_lat", self.coordinate(max_lat)));
            attributes.push(("max_lon", self.coordinate(max_lon)));
        }

        attributes.push(("num_changes", cs.num_changes.to_string()));
        let visible_comments: Vec<&ChangesetComment> =
            comments.iter().filter(|c| c.visible).collect();
        attributes.push(("comments_count", visible_comments.len().to_string()));

        let write_discussion = self.options.include_discussions && !visible_comments.is_empty();
        if tags.is_empty() && !write_discussion {
            return self.emit(Event::Empty(element("changeset", &attributes)));
        }

        self.emit(Event::Start(element("changeset", &attributes)))?;
        for tag in tags {
            let mut elem = BytesStart::new("tag");
            elem.push_attribute(("k", tag.key.as_str()));
            elem.push_attribute(("v", tag.value.as_str()));
            self.emit(Event::Empty(elem))?;
        }
        if write_discussion {
            self.emit(Event::Start(BytesStart::new("discussion")))?;
            for comment in visible_comments {
                let mut comment_attributes: Attributes =
                    vec![("date", self.timestamp(comment.created_at))];
                if let Some(user) = self.users.user(i64::from(comment.author_id)) {
                    comment_attributes.push(("uid", user.uid.to_string()));
                    comment_attributes.push(("user", user.name.to_string()));
                }
                self.emit(Event::Start(element("comment", &comment_attributes)))?;
                self.emit(Event::Start(BytesStart::new("text")))?;
                self.emit(Event::Text(BytesText::new(&comment.body)))?;
                self.emit(Event::End(BytesEnd::new("text")))?;
                self.emit(Event::End(BytesEnd::new("comment")))?;
            }
            self.emit(Event::End(BytesEnd::new("discussion")))?;
        }
        self.emit(Event::End(BytesEnd::new("changeset")))
    }
}

fn xml_err<E>(err: E) -> DumpError
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    DumpError::writer("xml", err)
}

impl OutputSink for XmlWriter {
    fn name(&self) -> &'static str {
        "xml"
    }

    async fn changesets(&mut self, block: Arc<ChangesetBlock>) -> DumpResult<()> {
        if !self.options.changesets {
            return Ok(());
        }

        let mut tag_index = 0;
        let mut comment_index = 0;
        for cs in &block.changesets {
            let tags = matching_range(&block.tags, &mut tag_index, (cs.id, 0), |t| {
                (t.element_id, 0)
            });
            let comments = matching_range(&block.comments, &mut comment_index, (cs.id, 0), |c| {
                (c.changeset_id, 0)
            });
            self.write_changeset(cs, tags, comments)?;
        }
        Ok(())
    }

    async fn nodes(&mut self, block: Arc<NodeBlock>) -> DumpResult<()> {
        let mut tag_index = 0;
        for node in &block.nodes {
            let tags = matching_range(&block.tags, &mut tag_index, (node.id, node.version), |t| {
                (t.element_id, t.version)
            });

            let mut attributes: Attributes = vec![("id", node.id.to_string())];
            if node.visible {
                attributes.push(("lat", self.coordinate(node.latitude)));
                attributes.push(("lon", self.coordinate(node.longitude)));
            }
            self.common_attributes(
                &mut attributes,
                node.timestamp,
                node.version,
                node.changeset_id,
                node.visible,
            );

            if tags.is_empty() {
                self.emit(Event::Empty(element("node", &attributes)))?;
            } else {
                self.emit(Event::Start(element("node", &attributes)))?;
                self.write_tags(tags)?;
                self.emit(Event::End(BytesEnd::new("node")))?;
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

            let mut attributes: Attributes = vec![("id", way.id.to_string())];
            self.common_attributes(
                &mut attributes,
                way.timestamp,
                way.version,
                way.changeset_id,
                way.visible,
            );

            if tags.is_empty() && way_nodes.is_empty() {
                self.emit(Event::Empty(element("way", &attributes)))?;
                continue;
            }

            self.emit(Event::Start(element("way", &attributes)))?;
            for way_node in way_nodes {
                let ref_attributes: Attributes = vec![("ref", way_node.node_id.to_string())];
                self.emit(Event::Empty(element("nd", &ref_attributes)))?;
            }
            self.write_tags(tags)?;
            self.emit(Event::End(BytesEnd::new("way")))?;
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

            let mut attributes: Attributes = vec![("id", relation.id.to_string())];
            self.common_attributes(
                &mut attributes,
                relation.timestamp,
                relation.version,
                relation.changeset_id,
                relation.visible,
            );

            if tags.is_empty() && members.is_empty() {
                self.emit(Event::Empty(element("relation", &attributes)))?;
                continue;
            }

            self.emit(Event::Start(element("relation", &attributes)))?;
            for member in members {
                let member_attributes: Attributes = vec![
                    ("type", member.member_type.as_str().to_string()),
                    ("ref", member.member_id.to_string()),
                    ("role", member.member_role.clone()),
                ];
                self.emit(Event::Empty(element("member", &member_attributes)))?;
            }
            self.write_tags(tags)?;
            self.emit(Event::End(BytesEnd::new("relation")))?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> DumpResult<()> {
        self.emit(Event::End(BytesEnd::new("osm")))?;
        self.writer.get_mut().flush().map_err(xml_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Node, Way, WayNode};
    use std::sync::Mutex;

    /// A writer handle tests can keep while the sink owns the other end.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn ts(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn options(history: bool) -> XmlOptions {
        XmlOptions {
            generator: "test-generator".to_string(),
            history,
            changesets: false,
            include_discussions: false,
            coordinate_scale: 1e7,
        }
    }

    fn node(id: i64, version: i64) -> Node {
        Node {
            id,
            version,
            changeset_id: 10,
            timestamp: ts("2020-01-01 00:00:00"),
            visible: true,
            redaction_id: None,
            latitude: 515000000,
            longitude: -1230000,
        }
    }

    #[tokio::test]
    async fn writes_nodes_with_tags_and_attribution() {
        let buf = SharedBuf::default();
        let users = Arc::new(UserStore::empty());
        users.record_changeset(10, 7);

        let mut writer =
            XmlWriter::new(Box::new(buf.clone()), users, options(false)).unwrap();
        let block = NodeBlock {
            nodes: vec![node(1, 1)],
            tags: vec![ElementTag {
                element_id: 1,
                version: 1,
                key: "amenity".to_string(),
                value: "cafe".to_string(),
            }],
        };
        writer.nodes(Arc::new(block)).await.unwrap();
        writer.finish().await.unwrap();

        let xml = buf.contents();
        assert!(xml.contains("generator=\"test-generator\""));
        assert!(xml.contains("<node id=\"1\" lat=\"51.5000000\" lon=\"-0.1230000\""));
        assert!(xml.contains("changeset=\"10\""));
        assert!(xml.contains("<tag k=\"amenity\" v=\"cafe\"/>"));
        assert!(xml.contains("</osm>"));
        // No user map entry for uid 7, so no attribution.
        assert!(!xml.contains("user="));
        // Current output carries no visible attribute.
        assert!(!xml.contains("visible="));
    }

    #[tokio::test]
    async fn history_mode_marks_deleted_nodes_without_coordinates() {
        let buf = SharedBuf::default();
        let mut deleted = node(9, 2);
        deleted.visible = false;

        let mut writer = XmlWriter::new(
            Box::new(buf.clone()),
            Arc::new(UserStore::empty()),
            options(true),
        )
        .unwrap();
        writer
            .nodes(Arc::new(NodeBlock {
                nodes: vec![deleted],
                tags: vec![],
            }))
            .await
            .unwrap();
        writer.finish().await.unwrap();

        let xml = buf.contents();
        assert!(xml.contains("visible=\"false\""));
        assert!(!xml.contains("lat="));
        assert!(!xml.contains("lon="));
    }

    #[tokio::test]
    async fn ways_nest_node_refs_before_tags() {
        let buf = SharedBuf::default();
        let mut writer = XmlWriter::new(
            Box::new(buf.clone()),
            Arc::new(UserStore::empty()),
            options(false),
        )
        .unwrap();

        let block = WayBlock {
            ways: vec![Way {
                id: 5,
                version: 1,
                changeset_id: 10,
                timestamp: ts("2020-01-01 00:00:00"),
                visible: true,
                redaction_id: None,
            }],
            way_nodes: vec![
                WayNode {
                    way_id: 5,
                    version: 1,
                    sequence_id: 0,
                    node_id: 1,
                },
                WayNode {
                    way_id: 5,
                    version: 1,
                    sequence_id: 1,
                    node_id: 2,
                },
            ],
            tags: vec![],
        };
        writer.ways(Arc::new(block)).await.unwrap();
        writer.finish().await.unwrap();

        let xml = buf.contents();
        let first = xml.find("<nd ref=\"1\"/>").unwrap();
        let second = xml.find("<nd ref=\"2\"/>").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn changeset_dump_includes_discussions() {
        let buf = SharedBuf::default();
        let users = Arc::new(UserStore::empty());
        let mut opts = options(false);
        opts.changesets = true;
        opts.include_discussions = true;

        let mut writer = XmlWriter::new(Box::new(buf.clone()), users, opts).unwrap();
        let block = ChangesetBlock {
            changesets: vec![Changeset {
                id: 10,
                uid: 7,
                created_at: ts("2020-01-01 00:00:00"),
                min_lat: None,
                max_lat: None,
                min_lon: None,
                max_lon: None,
                closed_at: ts("2020-01-01 01:00:00"),
                num_changes: 1,
            }],
            tags: vec![ChangesetTag {
                element_id: 10,
                key: "comment".to_string(),
                value: "first edit".to_string(),
            }],
            comments: vec![
                ChangesetComment {
                    changeset_id: 10,
                    created_at: ts("2020-06-01 10:00:00"),
                    author_id: 7,
                    body: "nice work & thanks".to_string(),
                    visible: true,
                },
                ChangesetComment {
                    changeset_id: 10,
                    created_at: ts("2020-06-02 10:00:00"),
                    author_id: 8,
                    body: "hidden".to_string(),
                    visible: false,
                },
            ],
        };
        writer.changesets(Arc::new(block)).await.unwrap();
        writer.finish().await.unwrap();

        let xml = buf.contents();
        assert!(xml.contains("<changeset id=\"10\""));
        assert!(xml.contains("closed_at="));
        assert!(xml.contains("open=\"false\""));
        assert!(xml.contains("comments_count=\"1\""));
        assert!(xml.contains("<tag k=\"comment\" v=\"first edit\"/>"));
        // Body text is escaped; the hidden comment is dropped.
        assert!(xml.contains("nice work &amp; thanks"));
        assert!(!xml.contains("hidden"));
    }

    #[tokio::test]
    async fn planet_output_skips_changesets() {
        let buf = SharedBuf::default();
        let mut writer = XmlWriter::new(
            Box::new(buf.clone()),
            Arc::new(UserStore::empty()),
            options(true),
        )
        .unwrap();
        writer
            .changesets(Arc::new(ChangesetBlock::default()))
            .await
            .unwrap();
        writer.finish().await.unwrap();
        assert!(!buf.contents().contains("changeset"));
    }
}
