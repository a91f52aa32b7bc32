use std::borrow::Cow;

use chrono::{NaiveDateTime, Timelike};

use crate::copy::unescape::unescape_field;
use crate::error::{DumpError, DumpResult};
use crate::types::{ElementType, TextFormat, UserStatus};

/// Projects COPY data rows onto a record's required columns.
///
/// The index permutation from declared column order to target field order
/// is computed once at construction; a missing required column fails
/// immediately rather than on the first row.
#[derive(Debug)]
pub struct RowDecoder {
    table: String,
    declared_count: usize,
    permutation: Vec<usize>,
}

impl RowDecoder {
    pub fn new(table: impl Into<String>, declared: &[String], wanted: &[&str]) -> DumpResult<Self> {
        let table = table.into();
        let mut permutation = Vec::with_capacity(wanted.len());
        for &column in wanted {
            let index = declared
                .iter()
                .position(|declared| declared == column)
                .ok_or_else(|| DumpError::column_missing(&table, column))?;
            permutation.push(index);
        }

        Ok(Self {
            table,
            declared_count: declared.len(),
            permutation,
        })
    }

    /// Splits a data row on tabs, unescapes each wanted field and returns
    /// the projected row for typed access.
    pub fn project<'a>(&'a self, line: &'a [u8], line_number: u64) -> DumpResult<ProjectedRow<'a>> {
        let raw: Vec<&[u8]> = line.split(|&b| b == b'\t').collect();
        if raw.len() != self.declared_count {
            return Err(DumpError::row_decode(
                &self.table,
                line_number,
                0,
                format!(
                    "expected {} columns, got {}",
                    self.declared_count,
                    raw.len()
                ),
            ));
        }

        let fields = self
            .permutation
            .iter()
            .map(|&index| unescape_field(raw[index]))
            .collect();

        Ok(ProjectedRow {
            table: &self.table,
            line_number,
            fields,
        })
    }
}

/// One data row reduced to the target record's fields, in target order.
///
/// `None` fields are SQL NULLs; accessors for non-optional types reject
/// them. All accessor errors carry the field index and the offending bytes.
#[derive(Debug)]
pub struct ProjectedRow<'a> {
    table: &'a str,
    line_number: u64,
    fields: Vec<Option<Cow<'a, [u8]>>>,
}

impl ProjectedRow<'_> {
    fn error(&self, field: usize, value: impl Into<String>) -> DumpError {
        DumpError::row_decode(self.table, self.line_number, field, value)
    }

    fn required(&self, field: usize) -> DumpResult<&[u8]> {
        match self.fields.get(field) {
            Some(Some(bytes)) => Ok(bytes),
            Some(None) => Err(self.error(field, "unexpected NULL")),
            None => Err(self.error(field, "field index out of range")),
        }
    }

    fn is_null(&self, field: usize) -> bool {
        matches!(self.fields.get(field), Some(None))
    }

    pub fn bool(&self, field: usize) -> DumpResult<bool> {
        match self.required(field)? {
            b"t" => Ok(true),
            b"f" => Ok(false),
            other => Err(self.error(field, String::from_utf8_lossy(other))),
        }
    }

    pub fn i16(&self, field: usize) -> DumpResult<i16> {
        self.integer(field)
    }

    pub fn i32(&self, field: usize) -> DumpResult<i32> {
        self.integer(field)
    }

    pub fn i64(&self, field: usize) -> DumpResult<i64> {
        self.integer(field)
    }

    pub fn f64(&self, field: usize) -> DumpResult<f64> {
        let bytes = self.required(field)?;
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| self.error(field, String::from_utf8_lossy(bytes)))
    }

    pub fn opt_i32(&self, field: usize) -> DumpResult<Option<i32>> {
        if self.is_null(field) {
            return Ok(None);
        }
        self.i32(field).map(Some)
    }

    pub fn string(&self, field: usize) -> DumpResult<String> {
        let bytes = self.required(field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| self.error(field, String::from_utf8_lossy(bytes)))
    }

    /// Parses `YYYY-MM-DD HH:MM:SS[.fraction]`, truncating to seconds.
    pub fn timestamp(&self, field: usize) -> DumpResult<NaiveDateTime> {
        let bytes = self.required(field)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| self.error(field, String::from_utf8_lossy(bytes)))?;
        let parsed = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map_err(|_| self.error(field, text))?;
        parsed
            .with_nanosecond(0)
            .ok_or_else(|| self.error(field, text))
    }

    pub fn user_status(&self, field: usize) -> DumpResult<UserStatus> {
        match self.required(field)? {
            b"pending" => Ok(UserStatus::Pending),
            b"active" => Ok(UserStatus::Active),
            b"confirmed" => Ok(UserStatus::Confirmed),
            b"suspended" => Ok(UserStatus::Suspended),
            b"deleted" => Ok(UserStatus::Deleted),
            other => Err(self.error(field, String::from_utf8_lossy(other))),
        }
    }

    pub fn text_format(&self, field: usize) -> DumpResult<TextFormat> {
        match self.required(field)? {
            b"html" => Ok(TextFormat::Html),
            b"markdown" => Ok(TextFormat::Markdown),
            b"text" => Ok(TextFormat::Text),
            other => Err(self.error(field, String::from_utf8_lossy(other))),
        }
    }

    pub fn element_type(&self, field: usize) -> DumpResult<ElementType> {
        match self.required(field)? {
            b"Node" => Ok(ElementType::Node),
            b"Way" => Ok(ElementType::Way),
            b"Relation" => Ok(ElementType::Relation),
            other => Err(self.error(field, String::from_utf8_lossy(other))),
        }
    }

    fn integer<T: std::str::FromStr>(&self, field: usize) -> DumpResult<T> {
        let bytes = self.required(field)?;
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| self.error(field, String::from_utf8_lossy(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn declared(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn projects_by_name_in_any_order() {
        let decoder = RowDecoder::new(
            "nodes",
            &declared(&["latitude", "node_id", "tile", "visible"]),
            &["node_id", "visible", "latitude"],
        )
        .unwrap();

        let row = decoder.project(b"515000000\t42\t99\tt", 1).unwrap();
        assert_eq!(row.i64(0).unwrap(), 42);
        assert!(row.bool(1).unwrap());
        assert_eq!(row.i32(2).unwrap(), 515000000);
    }

    #[test]
    fn missing_column_fails_at_construction() {
        let err = RowDecoder::new("nodes", &declared(&["a", "b"]), &["node_id"]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ColumnMissing { .. }));
    }

    #[test]
    fn wrong_column_count_is_a_row_error() {
        let decoder = RowDecoder::new("nodes", &declared(&["a", "b"]), &["a"]).unwrap();
        let err = decoder.project(b"1", 3).unwrap_err();
        match err.kind() {
            ErrorKind::RowDecode { line, .. } => assert_eq!(*line, 3),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn null_rejected_for_required_field() {
        let decoder = RowDecoder::new("nodes", &declared(&["a"]), &["a"]).unwrap();
        let row = decoder.project(b"\\N", 1).unwrap();
        assert!(row.i64(0).is_err());
        assert_eq!(row.opt_i32(0).unwrap(), None);
    }

    #[test]
    fn timestamps_truncate_to_seconds() {
        let decoder = RowDecoder::new("t", &declared(&["ts"]), &["ts"]).unwrap();
        let row = decoder.project(b"2013-09-11 13:39:52.742365", 1).unwrap();
        let ts = row.timestamp(0).unwrap();
        assert_eq!(ts.to_string(), "2013-09-11 13:39:52");

        let row = decoder.project(b"2013-09-11 13:39:52", 2).unwrap();
        assert_eq!(row.timestamp(0).unwrap(), ts);
    }

    #[test]
    fn enums_parse_fixed_literals() {
        let decoder = RowDecoder::new("t", &declared(&["m"]), &["m"]).unwrap();
        let row = decoder.project(b"Way", 1).unwrap();
        assert_eq!(row.element_type(0).unwrap(), ElementType::Way);
        let row = decoder.project(b"way", 2).unwrap();
        assert!(row.element_type(0).is_err());
    }

    #[test]
    fn escaped_fields_are_unescaped_before_parsing() {
        let decoder = RowDecoder::new("t", &declared(&["v"]), &["v"]).unwrap();
        let row = decoder.project(br"a\tb", 1).unwrap();
        assert_eq!(row.string(0).unwrap(), "a\tb");
    }
}
