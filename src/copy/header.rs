use crate::error::{DumpError, DumpResult};

/// The parsed form of a `COPY ... FROM stdin;` header line.
///
/// The column list establishes the on-the-wire field order of every data
/// row that follows.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyHeader {
    pub table: String,
    pub columns: Vec<String>,
}

impl CopyHeader {
    /// Parses a header of the form
    /// `COPY [schema.]tableName ( identList ) FROM stdin;` where identifiers
    /// are bare `[A-Za-z][A-Za-z0-9_]*` or double-quoted.
    pub fn parse(table: &str, line: &str) -> DumpResult<Self> {
        let mut parser = HeaderParser { rest: line };
        parser
            .parse()
            .ok_or_else(|| DumpError::copy_header(table, line))
    }
}

struct HeaderParser<'a> {
    rest: &'a str,
}

impl HeaderParser<'_> {
    fn parse(&mut self) -> Option<CopyHeader> {
        self.expect("COPY")?;
        let mut table = self.identifier()?;
        if self.try_expect(".") {
            // The part before the dot was the schema; the table follows.
            table = self.identifier()?;
        }
        self.expect("(")?;

        let mut columns = vec![self.identifier()?];
        while self.try_expect(",") {
            columns.push(self.identifier()?);
        }

        self.expect(")")?;
        self.expect("FROM")?;
        self.expect("stdin;")?;
        self.skip_whitespace();
        if !self.rest.is_empty() {
            return None;
        }

        Some(CopyHeader { table, columns })
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start_matches([' ', '\t']);
    }

    fn expect(&mut self, token: &str) -> Option<()> {
        if self.try_expect(token) { Some(()) } else { None }
    }

    fn try_expect(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        match self.rest.strip_prefix(token) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn identifier(&mut self) -> Option<String> {
        self.skip_whitespace();

        if let Some(rest) = self.rest.strip_prefix('"') {
            let end = rest.find('"')?;
            let ident = rest[..end].to_string();
            self.rest = &rest[end + 1..];
            return Some(ident);
        }

        let mut chars = self.rest.char_indices();
        let (_, first) = chars.next()?;
        if !first.is_ascii_alphabetic() {
            return None;
        }
        let end = self
            .rest
            .char_indices()
            .skip(1)
            .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len());

        let ident = self.rest[..end].to_string();
        self.rest = &self.rest[end..];
        Some(ident)
    }
}
