//! Document source and pull cursor.
//!
//! Exports are XML, optionally gzip-compressed. The cursor reads one event at
//! a time and hands out owned [`Node`]s; an element's subtree is discarded
//! with [`DocumentCursor::skip_element`] once its attributes have been read,
//! so memory stays bounded by the largest single element regardless of file
//! size. Namespace prefixes are ignored: elements and attributes match by
//! local name.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use thiserror::Error;
use tracing::debug;

/// First two bytes of every gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors opening or reading an export document.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("input document not found: {0}")]
    NotFound(PathBuf),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} has wrong format (expected .xml or .xml.gz)")]
    UnsupportedFormat(PathBuf),

    #[error("{0} is not a gzip file")]
    NotGzip(PathBuf),

    #[error("malformed XML at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    #[error("unexpected end of document inside <{0}>")]
    UnexpectedEof(String),

    #[error("<{element}> is missing required attribute {attribute}")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("literal {enumeration}.{literal} has non-integer value '{value}'")]
    InvalidLiteral {
        enumeration: String,
        literal: String,
        value: String,
    },

    #[error("document has no <Instrument> element")]
    MissingInstrument,
}

impl DocumentError {
    /// True when the document could not be opened at all.
    pub fn is_open_error(&self) -> bool {
        matches!(
            self,
            DocumentError::NotFound(_)
                | DocumentError::Io { .. }
                | DocumentError::UnsupportedFormat(_)
                | DocumentError::NotGzip(_)
        )
    }
}

/// Compression of an input file, decided by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    /// `.xml` is plain, `.gz` (including `.xml.gz`) is gzip, anything else is rejected.
    pub fn from_path(path: &Path) -> Result<Self, DocumentError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("xml") => Ok(Compression::None),
            Some("gz") => Ok(Compression::Gzip),
            _ => Err(DocumentError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Open an export file and position a cursor at its start.
pub fn open_document(path: &Path) -> Result<DocumentCursor<Box<dyn BufRead>>, DocumentError> {
    let compression = Compression::from_path(path)?;
    let io_err = |source: std::io::Error| {
        if source.kind() == std::io::ErrorKind::NotFound {
            DocumentError::NotFound(path.to_path_buf())
        } else {
            DocumentError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    };

    let mut file = BufReader::new(File::open(path).map_err(io_err)?);
    let reader: Box<dyn BufRead> = match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => {
            let head = file.fill_buf().map_err(io_err)?;
            if !head.starts_with(&GZIP_MAGIC) {
                return Err(DocumentError::NotGzip(path.to_path_buf()));
            }
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        }
    };
    debug!(path = %path.display(), ?compression, "opened document");
    Ok(DocumentCursor::new(reader))
}

/// An element's name and attributes, detached from the reader buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    qname: Vec<u8>,
    attrs: Vec<(String, String)>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, quick_xml::Error> {
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            attrs.push((key, attr.unescape_value()?.into_owned()));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            qname: start.name().as_ref().to_vec(),
            attrs,
        })
    }

    /// Local name, without namespace prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Raw attribute value, possibly empty.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value, with an empty value treated as absent.
    pub fn attr_opt(&self, key: &str) -> Option<&str> {
        self.attr(key).filter(|v| !v.is_empty())
    }
}

/// One owned document event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Start(Element),
    /// Local name of the closed element.
    End(String),
    Text(String),
    Eof,
}

/// Forward-only cursor over a document. Single pass, not restartable.
pub struct DocumentCursor<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    skip_buf: Vec<u8>,
    pushback: Vec<Node>,
}

impl<R: BufRead> DocumentCursor<R> {
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().expand_empty_elements = true;
        Self {
            reader,
            buf: Vec::with_capacity(4096),
            skip_buf: Vec::new(),
            pushback: Vec::new(),
        }
    }

    /// Byte offset of the reader in the (decompressed) document.
    pub fn position(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    /// Next start, end or text node. Declarations, comments and processing
    /// instructions are skipped.
    pub fn next_node(&mut self) -> Result<Node, DocumentError> {
        if let Some(node) = self.pushback.pop() {
            return Ok(node);
        }
        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(source) => {
                    return Err(DocumentError::Xml {
                        position: self.reader.buffer_position() as u64,
                        source,
                    })
                }
            };
            let position = self.reader.buffer_position() as u64;
            let xml_err = |source: quick_xml::Error| DocumentError::Xml { position, source };

            return match event {
                Event::Start(start) => Ok(Node::Start(Element::from_start(&start).map_err(xml_err)?)),
                Event::Empty(start) => {
                    let element = Element::from_start(&start).map_err(xml_err)?;
                    self.pushback.push(Node::End(element.name.clone()));
                    Ok(Node::Start(element))
                }
                Event::End(end) => Ok(Node::End(
                    String::from_utf8_lossy(end.local_name().as_ref()).into_owned(),
                )),
                Event::Text(text) => Ok(Node::Text(text.unescape().map_err(xml_err)?.into_owned())),
                Event::CData(data) => Ok(Node::Text(String::from_utf8_lossy(&data).into_owned())),
                Event::Eof => Ok(Node::Eof),
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => continue,
            };
        }
    }

    /// Push a start node back so the next `next_node` returns it.
    pub fn unread(&mut self, element: Element) {
        self.pushback.push(Node::Start(element));
    }

    /// Discard the rest of `element`'s subtree, up to and including its end tag.
    /// Must be called right after `element`'s start node was returned.
    pub fn skip_element(&mut self, element: &Element) -> Result<(), DocumentError> {
        if matches!(self.pushback.last(), Some(Node::End(_))) {
            self.pushback.pop();
            return Ok(());
        }
        self.skip_buf.clear();
        self.reader
            .read_to_end_into(QName(&element.qname), &mut self.skip_buf)
            .map_err(|source| DocumentError::Xml {
                position: self.reader.buffer_position() as u64,
                source,
            })?;
        Ok(())
    }

    /// Concatenated direct text of `element`, consuming it through its end tag.
    /// Child elements are skipped.
    pub fn read_text(&mut self, element: &Element) -> Result<String, DocumentError> {
        let mut text = String::new();
        loop {
            match self.next_node()? {
                Node::Text(t) => text.push_str(&t),
                Node::Start(child) => self.skip_element(&child)?,
                Node::End(_) => return Ok(text),
                Node::Eof => return Err(DocumentError::UnexpectedEof(element.name.clone())),
            }
        }
    }

    /// Advance to the next start element named one of `names`, descending into
    /// anything else. Returns `None` at end of document.
    pub fn seek(&mut self, names: &[&str]) -> Result<Option<Element>, DocumentError> {
        loop {
            match self.next_node()? {
                Node::Start(element) if names.contains(&element.name()) => return Ok(Some(element)),
                Node::Eof => return Ok(None),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(xml: &str) -> DocumentCursor<&[u8]> {
        DocumentCursor::new(xml.as_bytes())
    }

    #[test]
    fn test_namespace_prefixes_ignored() {
        let mut c = cursor(r#"<ns:Root xmlns:ns="urn:x"><ns:Item ns:Name="a"/></ns:Root>"#);
        let root = c.seek(&["Root"]).unwrap().unwrap();
        assert_eq!(root.name(), "Root");
        let item = c.seek(&["Item"]).unwrap().unwrap();
        assert_eq!(item.attr("Name"), Some("a"));
    }

    #[test]
    fn test_empty_attribute_is_absent() {
        let mut c = cursor(r#"<P Unit="" Scale="Log"/>"#);
        let p = c.seek(&["P"]).unwrap().unwrap();
        assert_eq!(p.attr("Unit"), Some(""));
        assert_eq!(p.attr_opt("Unit"), None);
        assert_eq!(p.attr_opt("Scale"), Some("Log"));
    }

    #[test]
    fn test_skip_element_discards_subtree() {
        let mut c = cursor("<R><A><B>deep</B><A>nested</A></A><C/></R>");
        c.seek(&["R"]).unwrap();
        let a = c.seek(&["A"]).unwrap().unwrap();
        c.skip_element(&a).unwrap();
        match c.next_node().unwrap() {
            Node::Start(e) => assert_eq!(e.name(), "C"),
            other => panic!("expected <C>, got {other:?}"),
        }
    }

    #[test]
    fn test_skip_self_closing_element() {
        let mut c = cursor("<R><A/><C/></R>");
        let a = c.seek(&["A"]).unwrap().unwrap();
        c.skip_element(&a).unwrap();
        assert!(matches!(c.next_node().unwrap(), Node::Start(e) if e.is("C")));
    }

    #[test]
    fn test_read_text_unescapes_and_skips_children() {
        let mut c = cursor("<V>a &amp; <x>ignored</x>b</V>");
        let v = c.seek(&["V"]).unwrap().unwrap();
        assert_eq!(c.read_text(&v).unwrap(), "a & b");
        assert_eq!(c.next_node().unwrap(), Node::Eof);
    }

    #[test]
    fn test_read_text_keeps_whitespace() {
        let mut c = cursor("<V>  padded </V>");
        let v = c.seek(&["V"]).unwrap().unwrap();
        assert_eq!(c.read_text(&v).unwrap(), "  padded ");
    }

    #[test]
    fn test_unread_returns_element_again() {
        let mut c = cursor("<R><A/></R>");
        let a = c.seek(&["A"]).unwrap().unwrap();
        c.unread(a.clone());
        assert_eq!(c.next_node().unwrap(), Node::Start(a));
    }

    #[test]
    fn test_truncated_text_is_eof_error() {
        let mut c = cursor("<V>never closed");
        let v = c.seek(&["V"]).unwrap().unwrap();
        assert!(c.read_text(&v).is_err());
    }

    #[test]
    fn test_extension_detection() {
        assert_eq!(
            Compression::from_path(Path::new("a.xml")).unwrap(),
            Compression::None
        );
        assert_eq!(
            Compression::from_path(Path::new("a.xml.gz")).unwrap(),
            Compression::Gzip
        );
        assert!(matches!(
            Compression::from_path(Path::new("a.json")),
            Err(DocumentError::UnsupportedFormat(_))
        ));
    }
}
