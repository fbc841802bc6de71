use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// SEC-003: Maximum element nesting accepted from a feed document.
/// Guards the recursive walkers below against pathological input.
const MAX_XML_DEPTH: usize = 64;

/// Document-level failures. Any of these means "no entries from this document".
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Syntax(String),

    #[error("Document nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("Document has no root element")]
    NoRoot,

    #[error("Unbalanced closing tag </{0}>")]
    Unbalanced(String),
}

/// An element from a feed document, addressed by local name only.
///
/// Namespace prefixes are dropped from element and attribute names so that
/// `content:encoded`, `dc:creator` and `atom:link` match as `encoded`,
/// `creator` and `link`. The namespace URI bound on the element (if any) is
/// kept for dialect detection.
#[derive(Debug, Clone, Default)]
pub struct XmlElement {
    pub name: String,
    pub namespace: Option<String>,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    text: String,
}

impl XmlElement {
    /// Character data directly inside this element (text and CDATA), trimmed.
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is(&self, local_name: &str) -> bool {
        self.name.eq_ignore_ascii_case(local_name)
    }

    /// First direct child with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.is(local_name))
    }

    /// All direct children with the given local name.
    pub fn children_named<'a>(&'a self, local_name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.is(local_name))
    }

    /// Follows a path of local names through first-matching children.
    pub fn path(&self, path: &[&str]) -> Option<&XmlElement> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    /// Every descendant with the given local name, in document order.
    ///
    /// Matching elements are not searched further, so an `item` nested inside
    /// another `item` is not reported twice.
    pub fn descendants_named<'a>(&'a self, local_name: &str) -> Vec<&'a XmlElement> {
        let mut found = Vec::new();
        collect_named(self, local_name, &mut found);
        found
    }
}

fn collect_named<'a>(node: &'a XmlElement, local_name: &str, out: &mut Vec<&'a XmlElement>) {
    for child in &node.children {
        if child.is(local_name) {
            out.push(child);
        } else {
            collect_named(child, local_name, out);
        }
    }
}

/// Parses raw bytes into the root [`XmlElement`].
///
/// Content is decoded as UTF-8 (lossily). Entities outside the XML builtins
/// (e.g. `&nbsp;` in sloppy feeds) are kept verbatim instead of failing the
/// whole document.
pub fn parse_document(bytes: &[u8]) -> Result<XmlElement, XmlError> {
    // SEC-002: quick-xml never expands DOCTYPE entity declarations, see Cargo.toml pin.
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if stack.len() >= MAX_XML_DEPTH {
                    return Err(XmlError::TooDeep(MAX_XML_DEPTH));
                }
                stack.push(element_from(&e, &reader));
            }
            Ok(Event::Empty(e)) => {
                let element = element_from(&e, &reader);
                attach(&mut stack, &mut root, element);
            }
            Ok(Event::End(e)) => {
                let element = stack.pop().ok_or_else(|| {
                    XmlError::Unbalanced(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
                })?;
                attach(&mut stack, &mut root, element);
            }
            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last_mut() {
                    match t.unescape() {
                        Ok(text) => top.text.push_str(&text),
                        Err(_) => top.text.push_str(&String::from_utf8_lossy(&t)),
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(XmlError::Syntax(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(XmlError::Syntax(format!("Unclosed element <{}>", open.name)));
    }
    root.ok_or(XmlError::NoRoot)
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

fn element_from<R>(e: &BytesStart<'_>, reader: &Reader<R>) -> XmlElement {
    let qname = e.name();
    let prefix = qname
        .prefix()
        .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());
    let namespace_key = match &prefix {
        Some(p) => format!("xmlns:{}", p),
        None => "xmlns".to_string(),
    };

    let mut element = XmlElement {
        name: String::from_utf8_lossy(qname.local_name().as_ref()).into_owned(),
        ..Default::default()
    };

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(err) => {
                tracing::debug!(element = %element.name, error = %err, "Skipping malformed XML attribute");
                continue;
            }
        };
        let value = match attr.decode_and_unescape_value(reader.decoder()) {
            Ok(v) => v.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        let raw_key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if raw_key == namespace_key {
            element.namespace = Some(value);
        } else if raw_key != "xmlns" && !raw_key.starts_with("xmlns:") {
            let local = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            element.attrs.push((local, value));
        }
    }
    element
}
