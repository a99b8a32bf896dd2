//! Minimal namespace-tolerant XML tree.
//!
//! Cameras and routers disagree wildly on namespace prefixes (and sometimes
//! on namespace URIs), so lookups here match on the local name only. The tree
//! keeps just enough to answer "first descendant named X" and "direct
//! children of Y", which is all the discovery parsers need.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use thiserror::Error;

/// Errors from parsing or walking an XML document.
#[derive(Debug, Error)]
pub enum XmlError {
    /// The document is not well-formed.
    #[error("malformed XML: {0}")]
    Malformed(String),

    /// A required element is absent.
    #[error("missing element <{0}>")]
    MissingElement(&'static str),

    /// An element is present but its text cannot be interpreted.
    #[error("invalid value {value:?} in <{element}>")]
    InvalidValue {
        element: &'static str,
        value: String,
    },
}

pub type XmlResult<T> = Result<T, XmlError>;

/// One element of a parsed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    /// Local name, prefix stripped.
    pub name: String,
    /// Attributes as (local name, decoded value).
    pub attrs: Vec<(String, String)>,
    /// Child elements in document order.
    pub children: Vec<XmlElement>,
    /// Decoded character data directly inside this element, untrimmed.
    pub text: String,
}

impl XmlElement {
    /// Returns the attribute with the given local name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given local name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First descendant (document order, excluding `self`) with the given
    /// local name.
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given local name, in document order.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a XmlElement> {
        let mut out = Vec::new();
        self.collect(name, &mut out);
        out
    }

    fn collect<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            }
            child.collect(name, out);
        }
    }

    /// Like [`find`](Self::find) but fails with [`XmlError::MissingElement`].
    pub fn require(&self, name: &'static str) -> XmlResult<&XmlElement> {
        self.find(name).ok_or(XmlError::MissingElement(name))
    }

    /// Trimmed text of the first descendant named `name`, if non-empty.
    pub fn find_text(&self, name: &str) -> Option<String> {
        self.find(name)
            .map(|e| e.text.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Trimmed text of the first descendant named `name`, required non-empty.
    pub fn require_text(&self, name: &'static str) -> XmlResult<String> {
        self.find_text(name).ok_or(XmlError::MissingElement(name))
    }

    /// True when the element holds character data and no child elements.
    pub fn is_simple(&self) -> bool {
        self.children.is_empty() && !self.text.is_empty()
    }
}

fn local_name(raw: &[u8]) -> String {
    let local = match raw.iter().rposition(|b| *b == b':') {
        Some(pos) => &raw[pos + 1..],
        None => raw,
    };
    String::from_utf8_lossy(local).into_owned()
}

fn decode(raw: &[u8]) -> String {
    html_escape::decode_html_entities(&String::from_utf8_lossy(raw)).into_owned()
}

fn element_from(start: &BytesStart<'_>) -> XmlResult<XmlElement> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Malformed(e.to_string()))?;
        let key = attr.key.as_ref();
        // Namespace declarations are not data.
        if key == b"xmlns" || key.starts_with(b"xmlns:") {
            continue;
        }
        attrs.push((local_name(key), decode(&attr.value)));
    }
    Ok(XmlElement {
        name: local_name(start.name().as_ref()),
        attrs,
        children: Vec::new(),
        text: String::new(),
    })
}

/// Parses a complete document and returns its root element.
///
/// Entity references are resolved after the raw text is collected, so both
/// predefined and numeric character references come out decoded.
pub fn parse(xml: &str) -> XmlResult<XmlElement> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    // Open elements plus the raw (still escaped) text collected for each.
    let mut stack: Vec<(XmlElement, Vec<u8>)> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                stack.push((element_from(e)?, Vec::new()));
            }
            Ok(Event::Empty(ref e)) => {
                let element = element_from(e)?;
                match stack.last_mut() {
                    Some((parent, _)) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => return Err(XmlError::Malformed("multiple root elements".into())),
                }
            }
            Ok(Event::End(_)) => {
                let Some((mut element, raw)) = stack.pop() else {
                    return Err(XmlError::Malformed("unbalanced end tag".into()));
                };
                element.text = decode(&raw);
                match stack.last_mut() {
                    Some((parent, _)) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => return Err(XmlError::Malformed("multiple root elements".into())),
                }
            }
            Ok(Event::Text(ref t)) => {
                if let Some((_, raw)) = stack.last_mut() {
                    raw.extend_from_slice(t);
                }
            }
            Ok(Event::GeneralRef(ref r)) => {
                if let Some((_, raw)) = stack.last_mut() {
                    raw.push(b'&');
                    raw.extend_from_slice(r);
                    raw.push(b';');
                }
            }
            Ok(Event::CData(ref c)) => {
                if let Some((_, raw)) = stack.last_mut() {
                    // Re-escape so the final entity decode leaves CDATA intact.
                    let escaped = html_escape::encode_text(&String::from_utf8_lossy(c)).into_owned();
                    raw.extend_from_slice(escaped.as_bytes());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(XmlError::Malformed(format!(
                    "at position {}: {}",
                    reader.error_position(),
                    e
                )))
            }
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(XmlError::Malformed("unexpected end of document".into()));
    }
    root.ok_or_else(|| XmlError::Malformed("no root element".into()))
}

/// Escapes text for inclusion in element content or attribute values.
pub fn escape(text: &str) -> String {
    html_escape::encode_double_quoted_attribute(text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_local_names_across_prefixes() {
        let root = parse(
            r#"<s:Envelope xmlns:s="x" xmlns:tds="y"><s:Body><tds:Value>a</tds:Value></s:Body></s:Envelope>"#,
        )
        .unwrap();
        assert_eq!(root.name, "Envelope");
        assert_eq!(root.find_text("Value").as_deref(), Some("a"));
        assert!(root.child("Body").is_some());
    }

    #[test]
    fn decodes_entities_and_cdata() {
        let root = parse("<a><b>x &amp; y &#65;</b><c><![CDATA[<raw>&amp;]]></c></a>").unwrap();
        assert_eq!(root.find_text("b").as_deref(), Some("x & y A"));
        assert_eq!(root.find_text("c").as_deref(), Some("<raw>&amp;"));
    }

    #[test]
    fn attributes_skip_namespace_declarations() {
        let root = parse(r#"<p:Profiles xmlns:p="z" token="main&amp;1" fixed="true"/>"#).unwrap();
        assert_eq!(root.attr("token"), Some("main&1"));
        assert_eq!(root.attrs.len(), 2);
    }

    #[test]
    fn find_all_is_document_order() {
        let root = parse("<r><x>1</x><y><x>2</x></y><x>3</x></r>").unwrap();
        let texts: Vec<_> = root.find_all("x").iter().map(|e| e.text.clone()).collect();
        assert_eq!(texts, ["1", "2", "3"]);
    }

    #[test]
    fn simple_elements_have_text_only() {
        let root = parse("<r><a>text</a><b><c>x</c></b><d/><e></e></r>").unwrap();
        assert!(root.child("a").unwrap().is_simple());
        assert!(!root.child("b").unwrap().is_simple());
        assert!(!root.child("d").unwrap().is_simple());
        assert!(!root.child("e").unwrap().is_simple());
    }

    #[test]
    fn rejects_truncated_and_mismatched_documents() {
        assert!(matches!(parse("<a><b></a>"), Err(XmlError::Malformed(_))));
        assert!(matches!(parse("<a><b>"), Err(XmlError::Malformed(_))));
        assert!(matches!(parse(""), Err(XmlError::Malformed(_))));
    }

    #[test]
    fn require_reports_missing_element() {
        let root = parse("<a/>").unwrap();
        assert!(matches!(root.require("b"), Err(XmlError::MissingElement("b"))));
    }
}
