// Snapshot Reader
// Streaming parser for workspace export snapshots. The top-level shape
// is `{formatVersion: 1, docs: [...], editors: [], workspaces: {}}`;
// `docs` routinely holds hundreds of thousands of records, so the reader
// never materializes the array. A byte-level scanner slices one record
// at a time out of the `docs` array and serde parses just that slice.
// Memory use is bounded by the largest single record.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::errors::SupertagError;

/// Properties of a record we normalize. Everything else stays in the
/// preserved raw bytes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordProps {
    #[serde(rename = "_docType")]
    pub doc_type: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub created: Option<i64>,
    pub updated: Option<i64>,
    pub done_at: Option<i64>,
    pub flags: Option<i64>,
    #[serde(rename = "_entity_override")]
    pub entity_override: Option<bool>,
    /// Parent supertag ids on a tagDef record.
    #[serde(rename = "_extends")]
    pub extends: Option<Vec<String>>,
    /// Target supertag of a reference-typed field definition.
    #[serde(rename = "_targetSupertagId")]
    pub target_supertag_id: Option<String>,
}

/// One raw record view: id, normalized props, ordered children, and the
/// untouched source bytes.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: String,
    pub props: RecordProps,
    pub children: Vec<String>,
    pub raw: String,
}

#[derive(Debug, Deserialize)]
struct RecordDoc {
    id: String,
    #[serde(default)]
    props: RecordProps,
    #[serde(default)]
    children: Vec<String>,
}

/// Item yielded per `docs` element. Malformed individual records are
/// reported, not fatal; the indexer counts and skips them.
#[derive(Debug)]
pub enum RecordItem {
    Record(RawRecord),
    Malformed { error: String },
}

/// Streaming reader over one snapshot file.
pub struct SnapshotReader {
    path: PathBuf,
    docs_offset: u64,
}

impl SnapshotReader {
    /// Open a snapshot and validate its top-level shape.
    ///
    /// Fails with `CorruptSnapshot` when the file is not a JSON object,
    /// `formatVersion` is missing or unsupported, or there is no `docs`
    /// array. Does not read past the start of `docs`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("opening snapshot {}", path.display()))?;
        let mut scanner = ByteScanner::new(BufReader::new(file));

        let shown = path.display().to_string();
        let corrupt =
            move |reason: &str| {
                anyhow::Error::new(SupertagError::CorruptSnapshot(format!("{shown}: {reason}")))
            };

        if scanner.next_non_ws()? != Some(b'{') {
            return Err(corrupt("top level is not an object"));
        }

        let mut format_version: Option<i64> = None;
        loop {
            match scanner.next_non_ws()? {
                Some(b'"') => {}
                Some(b'}') => return Err(corrupt("no docs array")),
                _ => return Err(corrupt("malformed object key")),
            }
            let key = scanner.read_string_body()?;
            if scanner.next_non_ws()? != Some(b':') {
                return Err(corrupt("missing ':' after key"));
            }

            match key.as_str() {
                "formatVersion" => {
                    let value = scanner.read_scalar()?;
                    let version: i64 = value
                        .trim()
                        .parse()
                        .map_err(|_| corrupt("formatVersion is not a number"))?;
                    if version != 1 {
                        return Err(corrupt(&format!("unsupported formatVersion {version}")));
                    }
                    format_version = Some(version);
                }
                "docs" => {
                    if format_version.is_none() {
                        return Err(corrupt("formatVersion missing before docs"));
                    }
                    if scanner.next_non_ws()? != Some(b'[') {
                        return Err(corrupt("docs is not an array"));
                    }
                    // Offset of the '[' so record iterators can seek
                    // straight to it on every restart.
                    let docs_offset = scanner.position() - 1;
                    return Ok(Self { path, docs_offset });
                }
                _ => {
                    scanner.skip_value()?;
                }
            }

            match scanner.next_non_ws()? {
                Some(b',') => continue,
                Some(b'}') => return Err(corrupt("no docs array")),
                _ => return Err(corrupt("malformed object")),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh, restartable pass over the `docs` array.
    pub fn records(&self) -> Result<RecordIter> {
        let mut file = File::open(&self.path)
            .with_context(|| format!("reopening snapshot {}", self.path.display()))?;
        file.seek(SeekFrom::Start(self.docs_offset))?;
        let mut scanner = ByteScanner::new(BufReader::new(file));
        // Consume the leading '['.
        scanner.next_non_ws()?;
        Ok(RecordIter {
            scanner,
            done: false,
            first: true,
        })
    }
}

/// Iterator over `docs` elements.
pub struct RecordIter {
    scanner: ByteScanner,
    done: bool,
    first: bool,
}

impl Iterator for RecordIter {
    /// `Err` means a structural or I/O failure that aborts the pass;
    /// per-record problems come through as `RecordItem::Malformed`.
    type Item = Result<RecordItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some(item)) => Some(Ok(item)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl RecordIter {
    fn advance(&mut self) -> Result<Option<RecordItem>> {
        let sep = self.scanner.next_non_ws()?;
        match sep {
            Some(b']') => return Ok(None),
            None => bail!(SupertagError::CorruptSnapshot(
                "docs array not terminated".into()
            )),
            Some(b',') if !self.first => {}
            Some(other) if self.first => {
                self.scanner.push_back(other);
            }
            Some(other) => bail!(SupertagError::CorruptSnapshot(format!(
                "unexpected byte {:?} between records",
                other as char
            ))),
        }
        self.first = false;

        let raw = self.scanner.read_value_text()?;
        match serde_json::from_str::<RecordDoc>(&raw) {
            Ok(doc) => Ok(Some(RecordItem::Record(RawRecord {
                id: doc.id,
                props: doc.props,
                children: doc.children,
                raw,
            }))),
            Err(e) => Ok(Some(RecordItem::Malformed {
                error: e.to_string(),
            })),
        }
    }
}

/// Buffered byte scanner with single-byte pushback and a JSON-aware
/// value skipper. Tracks the absolute offset so `docs` can be found
/// again on restart.
struct ByteScanner {
    inner: BufReader<File>,
    pushback: Option<u8>,
    position: u64,
}

impl ByteScanner {
    fn new(inner: BufReader<File>) -> Self {
        Self {
            inner,
            pushback: None,
            position: 0,
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn push_back(&mut self, byte: u8) {
        debug_assert!(self.pushback.is_none());
        self.pushback = Some(byte);
        self.position -= 1;
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        if let Some(b) = self.pushback.take() {
            self.position += 1;
            return Ok(Some(b));
        }
        let buf = self.inner.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        let byte = buf[0];
        self.inner.consume(1);
        self.position += 1;
        Ok(Some(byte))
    }

    fn next_non_ws(&mut self) -> Result<Option<u8>> {
        loop {
            match self.next_byte()? {
                Some(b) if (b as char).is_ascii_whitespace() => continue,
                other => return Ok(other),
            }
        }
    }

    /// Read the remainder of a JSON string (opening quote consumed).
    fn read_string_body(&mut self) -> Result<String> {
        let mut out = Vec::new();
        let mut escaped = false;
        loop {
            let byte = self
                .next_byte()?
                .ok_or_else(|| anyhow::anyhow!("unterminated string"))?;
            if escaped {
                out.push(byte);
                escaped = false;
            } else if byte == b'\\' {
                out.push(byte);
                escaped = true;
            } else if byte == b'"' {
                break;
            } else {
                out.push(byte);
            }
        }
        // Escapes are rare in keys; go through serde for correctness.
        let quoted = format!("\"{}\"", String::from_utf8_lossy(&out));
        Ok(serde_json::from_str(&quoted).unwrap_or_else(|_| String::from_utf8_lossy(&out).into()))
    }

    /// Read a bare scalar (number/true/false/null) as text.
    fn read_scalar(&mut self) -> Result<String> {
        let mut out = String::new();
        loop {
            match self.next_byte()? {
                None => break,
                Some(b) => {
                    let c = b as char;
                    if c == ',' || c == '}' || c == ']' || c.is_ascii_whitespace() {
                        self.push_back(b);
                        break;
                    }
                    out.push(c);
                }
            }
        }
        Ok(out)
    }

    /// Skip one complete JSON value of any shape.
    fn skip_value(&mut self) -> Result<()> {
        self.walk_value(&mut |_| {})
    }

    /// Read one complete JSON value, returning its exact text.
    fn read_value_text(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        self.walk_value(&mut |b| bytes.push(b))?;
        Ok(String::from_utf8(bytes).context("record is not valid UTF-8")?)
    }

    fn walk_value(&mut self, sink: &mut impl FnMut(u8)) -> Result<()> {
        let first = self
            .next_non_ws()?
            .ok_or_else(|| anyhow::anyhow!("unexpected end of snapshot"))?;
        sink(first);
        match first {
            b'{' | b'[' => {
                let mut depth: usize = 1;
                let mut in_string = false;
                let mut escaped = false;
                while depth > 0 {
                    let byte = self
                        .next_byte()?
                        .ok_or_else(|| anyhow::anyhow!("unterminated value"))?;
                    sink(byte);
                    if in_string {
                        if escaped {
                            escaped = false;
                        } else if byte == b'\\' {
                            escaped = true;
                        } else if byte == b'"' {
                            in_string = false;
                        }
                    } else {
                        match byte {
                            b'"' => in_string = true,
                            b'{' | b'[' => depth += 1,
                            b'}' | b']' => depth -= 1,
                            _ => {}
                        }
                    }
                }
                Ok(())
            }
            b'"' => {
                let mut escaped = false;
                loop {
                    let byte = self
                        .next_byte()?
                        .ok_or_else(|| anyhow::anyhow!("unterminated string"))?;
                    sink(byte);
                    if escaped {
                        escaped = false;
                    } else if byte == b'\\' {
                        escaped = true;
                    } else if byte == b'"' {
                        return Ok(());
                    }
                }
            }
            _ => {
                // Scalar: consume until a delimiter.
                loop {
                    match self.next_byte()? {
                        None => return Ok(()),
                        Some(b) => {
                            let c = b as char;
                            if c == ',' || c == '}' || c == ']' || c.is_ascii_whitespace() {
                                self.push_back(b);
                                return Ok(());
                            }
                            sink(b);
                        }
                    }
                }
            }
        }
    }
}
