//! Mutable XML trees and the forgiving parser pipeline
//!
//! Package documents, NCX files, SVG and XHTML documents are all held as an
//! ordered, mutable [XmlDocument]. Unlike a read-only tree, the document keeps
//! comments, processing instructions, CDATA sections and whitespace so that
//! serializing an unmodified tree reproduces the original content.
//!
//! Real-world books are frequently not well formed, so parsing runs through a
//! pipeline of increasingly lenient stages:
//!
//! 1. Strict: end tags must match and every entity must be known.
//! 2. Relaxed: mismatched end tags are repaired, unclosed elements are closed
//!    at the end of the document and unknown entities are kept as references.
//! 3. Sanitized: characters that are illegal in XML are dropped and stray
//!    `&` and `<` are escaped before running the relaxed stage again.
//!
//! Every stage that fails adds a diagnostic; the diagnostics of a successful
//! parse are non-fatal and returned together with the tree.

use std::{collections::HashMap, sync::LazyLock};

use html5ever::data::NAMED_ENTITIES;
use indexmap::IndexMap;
use quick_xml::{
    Reader, Writer,
    escape::{resolve_predefined_entity, unescape_with},
    events::{BytesCData, BytesDecl, BytesEnd, BytesPI, BytesStart, BytesText, Event},
};

use crate::error::EpubError;

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// The flavor of markup a document is parsed and serialized as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Generic XML: OPF, NCX, SVG, SMIL, ...
    Xml,

    /// XHTML and HTML documents
    ///
    /// Void elements such as `<br>` may be left unclosed, named HTML entities
    /// are resolved and end tags match case-insensitively.
    Html,
}

/// A node of an XML tree
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction(String),

    /// An entity reference that could not be resolved, written back as `&name;`
    EntityRef(String),
}

/// Represents an element node in an XML document
#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    /// The qualified name of the element, including its prefix (`dc:title`)
    pub name: String,

    /// The namespace the element's prefix was bound to when it was parsed
    pub namespace: Option<String>,

    /// The attributes of the element in document order, values unescaped
    ///
    /// Namespace declarations (`xmlns`, `xmlns:*`) are kept as attributes.
    pub attributes: IndexMap<String, String>,

    /// The child nodes of the element
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Create a new element without namespace, attributes or children
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: None,
            attributes: IndexMap::new(),
            children: Vec::new(),
        }
    }

    /// Create a new element in the same namespace and with the same prefix as `sibling_of`
    pub fn new_like(local_name: &str, sibling_of: &XmlElement) -> Self {
        let name = match sibling_of.prefix() {
            Some(prefix) => format!("{}:{}", prefix, local_name),
            None => local_name.to_string(),
        };

        Self {
            name,
            namespace: sibling_of.namespace.clone(),
            attributes: IndexMap::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style helper that sets an attribute
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    /// The local name of the element (excluding the namespace prefix)
    pub fn local_name(&self) -> &str {
        local_part(&self.name)
    }

    /// The namespace prefix of the element
    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    /// Returns the value of the attribute with the given qualified name
    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Returns the value of the first attribute whose local name matches,
    /// ignoring its prefix (`opf:scheme` matches `scheme`)
    pub fn get_attr_local(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| !key.starts_with("xmlns") && local_part(key) == local_name)
            .map(|(_, value)| value.as_str())
    }

    /// Sets an attribute, keeping its position when it already exists
    pub fn set_attr(&mut self, name: &str, value: &str) {
        self.attributes.insert(name.to_string(), value.to_string());
    }

    /// Removes an attribute, keeping the order of the remaining ones
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        self.attributes.shift_remove(name)
    }

    /// Gets the text content of the element and all its descendants
    pub fn text(&self) -> String {
        let mut result = String::new();
        self.collect_text(&mut result);
        result
    }

    fn collect_text(&self, result: &mut String) {
        for child in &self.children {
            match child {
                XmlNode::Text(text) | XmlNode::CData(text) => result.push_str(text),
                XmlNode::Element(element) => element.collect_text(result),
                XmlNode::EntityRef(name) => {
                    result.push('&');
                    result.push_str(name);
                    result.push(';');
                }
                _ => {}
            }
        }
    }

    /// Replaces all children with a single text node
    pub fn set_text(&mut self, text: &str) {
        self.children = vec![XmlNode::Text(text.to_string())];
    }

    /// Child elements of this element
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(element) => Some(element),
            _ => None,
        })
    }

    /// Mutable child elements of this element
    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut XmlElement> {
        self.children.iter_mut().filter_map(|node| match node {
            XmlNode::Element(element) => Some(element),
            _ => None,
        })
    }

    /// Find the first child element with the specified local name
    pub fn find_child(&self, local_name: &str) -> Option<&XmlElement> {
        self.elements().find(|element| element.local_name() == local_name)
    }

    /// Find the first child element with the specified local name, mutably
    pub fn find_child_mut(&mut self, local_name: &str) -> Option<&mut XmlElement> {
        self.elements_mut()
            .find(|element| element.local_name() == local_name)
    }

    /// Find all elements with the specified local name, this element included
    pub fn find_elements_by_name(&self, local_name: &str) -> impl Iterator<Item = &XmlElement> {
        SearchElementsByNameIter::new(self, local_name)
    }

    /// Visits this element and all descendant elements in document order
    pub fn walk_mut(&mut self, visitor: &mut dyn FnMut(&mut XmlElement)) {
        visitor(self);
        for child in self.elements_mut() {
            child.walk_mut(visitor);
        }
    }

    /// Visits this element and all descendant elements in document order
    pub fn walk(&self, visitor: &mut dyn FnMut(&XmlElement)) {
        visitor(self);
        for child in self.elements() {
            child.walk(visitor);
        }
    }

    /// Removes the child elements for which `keep` returns false
    ///
    /// The whitespace that indented a removed element is removed with it.
    /// Returns the number of removed elements.
    pub fn retain_elements(&mut self, mut keep: impl FnMut(&XmlElement) -> bool) -> usize {
        let mut removed = 0;
        let mut children = Vec::with_capacity(self.children.len());

        for node in self.children.drain(..) {
            match node {
                XmlNode::Element(element) if !keep(&element) => {
                    removed += 1;
                    if matches!(children.last(), Some(XmlNode::Text(text)) if is_whitespace(text))
                    {
                        children.pop();
                    }
                }
                node => children.push(node),
            }
        }

        self.children = children;
        removed
    }

    /// Appends a child element after the last child element, reusing its indentation
    pub fn push_element(&mut self, element: XmlElement) {
        let last_element = self
            .children
            .iter()
            .rposition(|node| matches!(node, XmlNode::Element(_)));

        match last_element {
            Some(index) => {
                let indent = self.indent_before(index);
                let mut insert_at = index + 1;
                if let Some(indent) = indent {
                    self.children.insert(insert_at, XmlNode::Text(indent));
                    insert_at += 1;
                }
                self.children.insert(insert_at, XmlNode::Element(element));
            }
            None => self.children.push(XmlNode::Element(element)),
        }
    }

    /// Inserts a child element before the `position`-th child element
    ///
    /// Appends when `position` is past the last child element.
    pub fn insert_element(&mut self, position: usize, element: XmlElement) {
        let target = self
            .children
            .iter()
            .enumerate()
            .filter(|(_, node)| matches!(node, XmlNode::Element(_)))
            .nth(position)
            .map(|(index, _)| index);

        match target {
            Some(index) => {
                let indent = self.indent_before(index);
                if let Some(indent) = indent {
                    self.children.insert(index, XmlNode::Text(indent));
                }
                self.children.insert(index, XmlNode::Element(element));
            }
            None => self.push_element(element),
        }
    }

    fn indent_before(&self, index: usize) -> Option<String> {
        match index.checked_sub(1).and_then(|i| self.children.get(i)) {
            Some(XmlNode::Text(text)) if is_whitespace(text) => Some(text.clone()),
            _ => None,
        }
    }
}

struct SearchElementsByNameIter<'a> {
    elements: Vec<&'a XmlElement>,
    current_index: usize,
    target_name: String,
}

impl<'a> SearchElementsByNameIter<'a> {
    fn new(root: &'a XmlElement, name: &str) -> Self {
        let mut elements = Vec::new();
        Self::collect_elements(root, &mut elements);
        Self {
            elements,
            current_index: 0,
            target_name: name.to_string(),
        }
    }

    fn collect_elements(element: &'a XmlElement, collection: &mut Vec<&'a XmlElement>) {
        collection.push(element);
        for child in element.elements() {
            Self::collect_elements(child, collection);
        }
    }
}

impl<'a> Iterator for SearchElementsByNameIter<'a> {
    type Item = &'a XmlElement;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current_index < self.elements.len() {
            let element = self.elements[self.current_index];
            self.current_index += 1;
            if element.local_name() == self.target_name {
                return Some(element);
            }
        }
        None
    }
}

/// A parsed XML or XHTML document
#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    /// Whether the source started with an XML declaration
    pub declaration: bool,

    /// The content of the `<!DOCTYPE …>` declaration
    pub doctype: Option<String>,

    /// Comments and processing instructions before the root element
    pub prolog: Vec<XmlNode>,

    /// The root element
    pub root: XmlElement,

    /// Comments and processing instructions after the root element
    pub epilog: Vec<XmlNode>,
}

/// A successfully parsed document and the non-fatal problems met on the way
#[derive(Debug)]
pub struct ParseOutcome {
    pub document: XmlDocument,
    pub diagnostics: Vec<String>,
}

impl XmlDocument {
    /// Create a document with an XML declaration around a root element
    pub fn new(root: XmlElement) -> Self {
        Self {
            declaration: true,
            doctype: None,
            prolog: Vec::new(),
            root,
            epilog: Vec::new(),
        }
    }

    /// Parses a document through the forgiving pipeline
    ///
    /// ## Return
    /// - `Ok(ParseOutcome)`: A tree was recovered; `diagnostics` lists what had to be repaired
    /// - `Err(Vec<String>)`: No stage recovered a tree; the diagnostics of every stage
    pub fn parse(content: &str, dialect: Dialect) -> Result<ParseOutcome, Vec<String>> {
        let mut diagnostics = Vec::new();

        match TreeBuilder::run(content, dialect, true, &mut diagnostics) {
            Ok(document) => return Ok(ParseOutcome {
                document,
                diagnostics,
            }),
            Err(err) => diagnostics.push(format!("strict parse failed: {}", err)),
        }

        match TreeBuilder::run(content, dialect, false, &mut diagnostics) {
            Ok(document) => return Ok(ParseOutcome {
                document,
                diagnostics,
            }),
            Err(err) => diagnostics.push(format!("relaxed parse failed: {}", err)),
        }

        let sanitized = sanitize(content);
        match TreeBuilder::run(&sanitized, dialect, false, &mut diagnostics) {
            Ok(document) => Ok(ParseOutcome {
                document,
                diagnostics,
            }),
            Err(err) => {
                diagnostics.push(format!("sanitized parse failed: {}", err));
                Err(diagnostics)
            }
        }
    }

    /// Serializes the document as UTF-8
    ///
    /// The XML declaration, when present, is rewritten to declare UTF-8.
    /// With `pretty` set, whitespace-only text is dropped and elements are
    /// indented by two spaces.
    pub fn serialize(&self, dialect: Dialect, pretty: bool) -> Result<Vec<u8>, EpubError> {
        let mut writer = if pretty {
            Writer::new_with_indent(Vec::new(), b' ', 2)
        } else {
            Writer::new(Vec::new())
        };

        if self.declaration {
            writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
            Self::line_break(&mut writer, pretty);
        }

        for node in &self.prolog {
            write_node(&mut writer, node, dialect, pretty)?;
            Self::line_break(&mut writer, pretty);
        }

        if let Some(doctype) = &self.doctype {
            writer.write_event(Event::DocType(BytesText::from_escaped(doctype.as_str())))?;
            Self::line_break(&mut writer, pretty);
        }

        write_element(&mut writer, &self.root, dialect, pretty)?;

        for node in &self.epilog {
            Self::line_break(&mut writer, pretty);
            write_node(&mut writer, node, dialect, pretty)?;
        }

        let mut output = writer.into_inner();
        output.push(b'\n');
        Ok(output)
    }

    fn line_break(writer: &mut Writer<Vec<u8>>, pretty: bool) {
        // the indenting writer breaks lines on its own
        if !pretty {
            writer.get_mut().push(b'\n');
        }
    }
}

fn write_node(
    writer: &mut Writer<Vec<u8>>,
    node: &XmlNode,
    dialect: Dialect,
    pretty: bool,
) -> Result<(), EpubError> {
    match node {
        XmlNode::Element(element) => write_element(writer, element, dialect, pretty)?,
        XmlNode::Text(text) => {
            writer.write_event(Event::Text(BytesText::from_escaped(escape_text(text))))?
        }
        XmlNode::CData(text) => writer.write_event(Event::CData(BytesCData::new(text.as_str())))?,
        XmlNode::Comment(text) => {
            writer.write_event(Event::Comment(BytesText::from_escaped(text.as_str())))?
        }
        XmlNode::ProcessingInstruction(content) => {
            writer.write_event(Event::PI(BytesPI::new(content.as_str())))?
        }
        XmlNode::EntityRef(name) => {
            writer.write_event(Event::Text(BytesText::from_escaped(format!("&{};", name))))?
        }
    }
    Ok(())
}

fn write_element(
    writer: &mut Writer<Vec<u8>>,
    element: &XmlElement,
    dialect: Dialect,
    pretty: bool,
) -> Result<(), EpubError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        let value = escape_attribute(value);
        start.push_attribute((key.as_bytes(), value.as_bytes()));
    }

    let children = element
        .children
        .iter()
        .filter(|node| !pretty || !matches!(node, XmlNode::Text(text) if is_whitespace(text)))
        .collect::<Vec<_>>();

    if children.is_empty() && (dialect == Dialect::Xml || is_void_element(element.local_name())) {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for child in children {
        write_node(writer, child, dialect, pretty)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}

/// Builds a tree from the events of one parser stage
struct TreeBuilder<'d> {
    dialect: Dialect,
    strict: bool,
    stack: Vec<XmlElement>,
    root: Option<XmlElement>,
    declaration: bool,
    doctype: Option<String>,
    prolog: Vec<XmlNode>,
    epilog: Vec<XmlNode>,
    diagnostics: &'d mut Vec<String>,
}

impl<'d> TreeBuilder<'d> {
    fn run(
        content: &str,
        dialect: Dialect,
        strict: bool,
        diagnostics: &'d mut Vec<String>,
    ) -> Result<XmlDocument, String> {
        let mut reader = Reader::from_str(content);
        let config = reader.config_mut();
        config.trim_text(false);
        config.check_end_names = strict;
        config.allow_unmatched_ends = !strict;

        let mut builder = TreeBuilder {
            dialect,
            strict,
            stack: Vec::new(),
            root: None,
            declaration: false,
            doctype: None,
            prolog: Vec::new(),
            epilog: Vec::new(),
            diagnostics,
        };

        loop {
            let event = reader
                .read_event()
                .map_err(|err| format!("{} at byte {}", err, reader.error_position()))?;

            match event {
                Event::Eof => break,
                Event::Start(e) => {
                    let element = builder.open_element(&e)?;
                    if builder.dialect == Dialect::Html && is_void_element(element.local_name()) {
                        builder.attach(element)?;
                    } else {
                        builder.stack.push(element);
                    }
                }
                Event::Empty(e) => {
                    let element = builder.open_element(&e)?;
                    builder.attach(element)?;
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    builder.close_element(&name)?;
                }
                Event::Text(e) => builder.push_text(&String::from_utf8_lossy(&e)),
                Event::GeneralRef(e) => {
                    let entity = String::from_utf8_lossy(&e).into_owned();
                    match builder.resolve_reference(&entity)? {
                        Some(resolved) => builder.push_text(&resolved),
                        None => builder.push_node(XmlNode::EntityRef(entity)),
                    }
                }
                Event::CData(e) => {
                    builder.push_node(XmlNode::CData(String::from_utf8_lossy(&e).into_owned()))
                }
                Event::Comment(e) => {
                    builder.push_node(XmlNode::Comment(String::from_utf8_lossy(&e).into_owned()))
                }
                Event::PI(e) => builder.push_node(XmlNode::ProcessingInstruction(
                    String::from_utf8_lossy(&e).into_owned(),
                )),
                Event::Decl(_) => builder.declaration = true,
                Event::DocType(e) => {
                    builder.doctype = Some(String::from_utf8_lossy(&e).trim().to_string())
                }
            }
        }

        builder.finish()
    }

    fn open_element(&mut self, e: &BytesStart) -> Result<XmlElement, String> {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let mut element = XmlElement::new(&name);

        let mut attributes = if self.strict {
            e.attributes()
        } else {
            e.html_attributes()
        };
        attributes.with_checks(self.strict);

        for attribute in attributes {
            let attribute = match attribute {
                Ok(attribute) => attribute,
                Err(err) if self.strict => return Err(err.to_string()),
                Err(err) => {
                    self.diagnostics
                        .push(format!("dropped malformed attributes of <{}>: {}", name, err));
                    break;
                }
            };

            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let raw = String::from_utf8_lossy(&attribute.value);
            let value = match unescape_with(&raw, |entity| self.entity_value(entity)) {
                Ok(value) => value.into_owned(),
                Err(err) if self.strict => return Err(err.to_string()),
                Err(err) => {
                    self.diagnostics.push(format!(
                        "kept unknown references in attribute {} of <{}>: {}",
                        key, name, err
                    ));
                    unescape_lenient(&raw, |entity| self.entity_value(entity))
                }
            };

            if element.attributes.contains_key(&key) {
                if self.strict {
                    return Err(format!("duplicate attribute {} on <{}>", key, name));
                }
                self.diagnostics
                    .push(format!("dropped duplicate attribute {} on <{}>", key, name));
                continue;
            }
            element.attributes.insert(key, value);
        }

        element.namespace = self.resolve_namespace(element.prefix(), &element.attributes);
        Ok(element)
    }

    fn resolve_namespace(
        &self,
        prefix: Option<&str>,
        own: &IndexMap<String, String>,
    ) -> Option<String> {
        if prefix == Some("xml") {
            return Some(XML_NAMESPACE.to_string());
        }

        let key = match prefix {
            Some(prefix) => format!("xmlns:{}", prefix),
            None => "xmlns".to_string(),
        };

        own.get(&key)
            .or_else(|| {
                self.stack
                    .iter()
                    .rev()
                    .find_map(|element| element.attributes.get(&key))
            })
            .filter(|uri| !uri.is_empty())
            .cloned()
    }

    fn entity_value(&self, entity: &str) -> Option<&'static str> {
        resolve_predefined_entity(entity).or_else(|| {
            if self.dialect == Dialect::Html || !self.strict {
                html_entity(entity)
            } else {
                None
            }
        })
    }

    /// Resolves a reference to its text, `None` keeps an unknown entity as a reference
    fn resolve_reference(&mut self, entity: &str) -> Result<Option<String>, String> {
        if let Some(number) = entity.strip_prefix('#') {
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => number.parse::<u32>().ok(),
            };

            return match code.and_then(char::from_u32) {
                Some(c) => Ok(Some(c.to_string())),
                None if self.strict => Err(format!("invalid character reference &{};", entity)),
                None => {
                    self.diagnostics
                        .push(format!("replaced invalid character reference &{};", entity));
                    Ok(Some(char::REPLACEMENT_CHARACTER.to_string()))
                }
            };
        }

        match self.entity_value(entity) {
            Some(value) => Ok(Some(value.to_string())),
            None if self.strict => Err(format!("unknown entity &{};", entity)),
            None => {
                self.diagnostics
                    .push(format!("kept unknown entity &{}; as a reference", entity));
                Ok(None)
            }
        }
    }

    fn close_element(&mut self, name: &str) -> Result<(), String> {
        let matches = |element: &XmlElement| match self.dialect {
            Dialect::Html => element.name.eq_ignore_ascii_case(name),
            Dialect::Xml => element.name == name,
        };

        let Some(position) = self.stack.iter().rposition(matches) else {
            if self.strict {
                return Err(format!("unexpected end tag </{}>", name));
            }
            if !(self.dialect == Dialect::Html && is_void_element(local_part(name))) {
                self.diagnostics
                    .push(format!("ignored unmatched end tag </{}>", name));
            }
            return Ok(());
        };

        if position + 1 != self.stack.len() {
            if self.strict {
                return Err(format!("end tag </{}> closes unclosed elements", name));
            }
            self.diagnostics
                .push(format!("closed unclosed elements before </{}>", name));
        }

        while self.stack.len() > position {
            if let Some(element) = self.stack.pop() {
                self.attach(element)?;
            }
        }
        Ok(())
    }

    fn attach(&mut self, element: XmlElement) -> Result<(), String> {
        if let Some(parent) = self.stack.last_mut() {
            parent.children.push(XmlNode::Element(element));
            return Ok(());
        }

        match self.root.as_mut() {
            None => self.root = Some(element),
            Some(_) if self.strict => {
                return Err(format!("second root element <{}>", element.name));
            }
            Some(root) => {
                self.diagnostics
                    .push(format!("moved second root element <{}> into the root", element.name));
                root.children.push(XmlNode::Element(element));
            }
        }
        Ok(())
    }

    fn push_text(&mut self, text: &str) {
        let Some(parent) = self.stack.last_mut() else {
            // text outside the root element carries no content
            return;
        };

        if let Some(XmlNode::Text(previous)) = parent.children.last_mut() {
            previous.push_str(text);
        } else {
            parent.children.push(XmlNode::Text(text.to_string()));
        }
    }

    fn push_node(&mut self, node: XmlNode) {
        if let Some(parent) = self.stack.last_mut() {
            parent.children.push(node);
        } else if self.root.is_none() {
            self.prolog.push(node);
        } else {
            self.epilog.push(node);
        }
    }

    fn finish(mut self) -> Result<XmlDocument, String> {
        if !self.stack.is_empty() {
            if self.strict {
                return Err(format!("unclosed element <{}>", self.stack[0].name));
            }
            self.diagnostics
                .push(format!("closed {} unclosed elements at end of document", self.stack.len()));
            while let Some(element) = self.stack.pop() {
                self.attach(element)?;
            }
        }

        let root = self.root.ok_or_else(|| "no root element".to_string())?;
        Ok(XmlDocument {
            declaration: self.declaration,
            doctype: self.doctype,
            prolog: self.prolog,
            root,
            epilog: self.epilog,
        })
    }
}

/// Prepares badly broken markup for another relaxed parse
///
/// Drops characters that are not allowed in XML 1.0 and escapes `&` that
/// does not start a reference and `<` that does not start markup.
fn sanitize(content: &str) -> String {
    let mut output = String::with_capacity(content.len());
    let mut chars = content.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        match c {
            '\t' | '\n' | '\r' => output.push(c),
            c if (c as u32) < 0x20 || c == '\u{FFFE}' || c == '\u{FFFF}' => continue,
            '&' if !starts_reference(&content[index + 1..]) => output.push_str("&amp;"),
            '<' => match chars.peek() {
                Some((_, next))
                    if next.is_alphabetic() || matches!(next, '/' | '!' | '?' | '_' | ':') =>
                {
                    output.push('<')
                }
                _ => output.push_str("&lt;"),
            },
            c => output.push(c),
        }
    }

    output
}

fn starts_reference(rest: &str) -> bool {
    let Some(end) = rest.find(';') else {
        return false;
    };
    let body = &rest[..end];

    if let Some(number) = body.strip_prefix('#') {
        return match number.strip_prefix(['x', 'X']) {
            Some(hex) => !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()),
            None => !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()),
        };
    }

    let mut chars = body.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

fn local_part(name: &str) -> &str {
    match name.split_once(':') {
        Some((_, local)) => local,
        None => name,
    }
}

fn is_whitespace(text: &str) -> bool {
    text.chars().all(char::is_whitespace)
}

fn is_void_element(local_name: &str) -> bool {
    matches!(
        local_name.to_ascii_lowercase().as_str(),
        "area"
            | "base"
            | "br"
            | "col"
            | "embed"
            | "hr"
            | "img"
            | "input"
            | "link"
            | "meta"
            | "param"
            | "source"
            | "track"
            | "wbr"
    )
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escapes an attribute value
///
/// An `&` that starts a reference to an unknown entity is left alone, it was
/// kept verbatim when the attribute was parsed.
fn escape_attribute(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for (index, c) in value.char_indices() {
        match c {
            '&' if is_unknown_reference(&value[index + 1..]) => output.push('&'),
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '"' => output.push_str("&quot;"),
            c => output.push(c),
        }
    }
    output
}

fn is_unknown_reference(rest: &str) -> bool {
    if !starts_reference(rest) || rest.starts_with('#') {
        return false;
    }
    let name = rest.split(';').next().unwrap_or_default();
    resolve_predefined_entity(name).is_none() && html_entity(name).is_none()
}

/// Unescapes an attribute value, keeping references that do not resolve
fn unescape_lenient<'e>(raw: &str, mut resolve: impl FnMut(&str) -> Option<&'e str>) -> String {
    let mut output = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find('&') {
        output.push_str(&rest[..start]);
        rest = &rest[start..];

        let Some(end) = rest.find(';').filter(|_| starts_reference(&rest[1..])) else {
            output.push('&');
            rest = &rest[1..];
            continue;
        };

        let entity = &rest[1..end];
        let resolved = match entity.strip_prefix('#') {
            Some(number) => match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => number.parse::<u32>().ok(),
            }
            .and_then(char::from_u32)
            .map(String::from),
            None => resolve(entity).map(str::to_string),
        };

        match resolved {
            Some(value) => output.push_str(&value),
            None => output.push_str(&rest[..=end]),
        }
        rest = &rest[end + 1..];
    }

    output.push_str(rest);
    output
}

/// Resolves a named HTML5 character reference (without `&` and `;`)
fn html_entity(name: &str) -> Option<&'static str> {
    static ENTITIES: LazyLock<HashMap<&'static str, String>> = LazyLock::new(|| {
        NAMED_ENTITIES
            .entries()
            .filter_map(|(name, &(first, second))| {
                let name: &'static str = *name;
                let name = name.trim_start_matches('&').strip_suffix(';')?;
                let value = [first, second]
                    .into_iter()
                    .filter(|code| *code != 0)
                    .map(char::from_u32)
                    .collect::<Option<String>>()?;
                (!value.is_empty()).then_some((name, value))
            })
            .collect()
    });

    ENTITIES.get(name).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use crate::xml::{Dialect, XmlDocument, XmlElement, XmlNode, sanitize};

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>A &amp; B</dc:title>
    <!-- generated -->
  </metadata>
  <manifest>
    <item id="a" href="a.xhtml" media-type="application/xhtml+xml"/>
    <item id="b" href="b.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
</package>
"#;

    /// A well-formed document is parsed without diagnostics and keeps namespaces
    #[test]
    fn test_parse_strict() {
        let outcome = XmlDocument::parse(OPF, Dialect::Xml).unwrap();
        assert!(outcome.diagnostics.is_empty());

        let document = outcome.document;
        assert!(document.declaration);
        assert_eq!(document.root.local_name(), "package");
        assert_eq!(document.root.namespace.as_deref(), Some("http://www.idpf.org/2007/opf"));

        let title = document.root.find_elements_by_name("title").next().unwrap();
        assert_eq!(title.name, "dc:title");
        assert_eq!(title.prefix(), Some("dc"));
        assert_eq!(title.namespace.as_deref(), Some("http://purl.org/dc/elements/1.1/"));
        assert_eq!(title.text(), "A & B");
    }

    /// Serializing an unmodified document keeps its content
    #[test]
    fn test_serialize_round_trip() {
        let document = XmlDocument::parse(OPF, Dialect::Xml).unwrap().document;
        let output = document.serialize(Dialect::Xml, false).unwrap();
        let output = String::from_utf8(output).unwrap();

        assert!(output.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<package"));
        assert!(output.contains("<dc:title>A &amp; B</dc:title>"));
        assert!(output.contains("<!-- generated -->"));
        assert!(output.contains(r#"<item id="a" href="a.xhtml" media-type="application/xhtml+xml"/>"#));

        let reparsed = XmlDocument::parse(&output, Dialect::Xml).unwrap().document;
        assert_eq!(reparsed, document);
    }

    /// Mismatched and unclosed tags are repaired by the relaxed stage
    #[test]
    fn test_parse_relaxed_recovery() {
        let broken = "<html><body><p>One<b>bold</p><p>Two</body></html>";
        let outcome = XmlDocument::parse(broken, Dialect::Html).unwrap();
        assert!(!outcome.diagnostics.is_empty());

        let body = outcome.document.root.find_child("body").unwrap();
        let paragraphs = body.elements().filter(|e| e.name == "p").count();
        assert_eq!(paragraphs, 2);
        assert_eq!(body.text(), "OneboldTwo");
    }

    /// HTML void elements and named entities are understood in the HTML dialect
    #[test]
    fn test_parse_html_void_and_entities() {
        let html = "<html><body><p>a&nbsp;b<br>c<img src=\"x.png\"></p></body></html>";
        let document = XmlDocument::parse(html, Dialect::Html).unwrap().document;
        let p = document.root.find_elements_by_name("p").next().unwrap();
        assert_eq!(p.text(), "a\u{A0}bc");
        assert_eq!(p.find_child("img").unwrap().get_attr("src"), Some("x.png"));

        let output = String::from_utf8(document.serialize(Dialect::Html, false).unwrap()).unwrap();
        assert!(output.contains("<br/>"));
        assert!(output.contains("<img src=\"x.png\"/>"));
    }

    /// Every HTML5 named reference resolves, not only the common ones
    #[test]
    fn test_parse_html5_entities() {
        let html = "<html><body><p>&hearts; &alpha;&frac12; &oelig;</p></body></html>";
        let outcome = XmlDocument::parse(html, Dialect::Html).unwrap();
        assert!(outcome.diagnostics.is_empty());

        let p = outcome.document.root.find_elements_by_name("p").next().unwrap();
        assert_eq!(p.text(), "\u{2665} \u{3B1}\u{BD} \u{153}");

        let output = String::from_utf8(outcome.document.serialize(Dialect::Html, false).unwrap()).unwrap();
        assert!(output.contains("<p>\u{2665} \u{3B1}\u{BD} \u{153}</p>"));
        assert!(!output.contains("&amp;"));
    }

    /// Unknown references survive a parse and serialize cycle unchanged
    #[test]
    fn test_unknown_entities_round_trip() {
        let html = r#"<html><body><p title="a &bogus; b &amp; c">x &bogus; y &amp; z</p></body></html>"#;
        let outcome = XmlDocument::parse(html, Dialect::Html).unwrap();
        assert!(!outcome.diagnostics.is_empty());

        let p = outcome.document.root.find_elements_by_name("p").next().unwrap();
        assert_eq!(p.text(), "x &bogus; y & z");
        assert_eq!(p.get_attr("title"), Some("a &bogus; b & c"));

        let output = String::from_utf8(outcome.document.serialize(Dialect::Html, false).unwrap()).unwrap();
        assert!(output.contains("x &bogus; y &amp; z"));
        assert!(output.contains(r#"title="a &bogus; b &amp; c""#));
        assert!(!output.contains("&amp;bogus;"));
    }

    /// Stray ampersands and control characters are sanitized
    #[test]
    fn test_parse_sanitized() {
        assert_eq!(
            sanitize("a & b < c &amp; &#x20; <d/>\u{1}"),
            "a &amp; b &lt; c &amp; &#x20; <d/>"
        );

        let broken = "<root><a>Tom & Jerry\u{1}</a></root>";
        let document = XmlDocument::parse(broken, Dialect::Xml).unwrap().document;
        let a = document.root.find_child("a").unwrap();
        assert!(a.text().starts_with("Tom & Jerry"));
    }

    /// Garbage without any element cannot be recovered
    #[test]
    fn test_parse_failure() {
        let diagnostics = XmlDocument::parse("just some text", Dialect::Xml).unwrap_err();
        assert_eq!(diagnostics.len(), 3);
    }

    /// Removing and inserting elements keeps the surrounding indentation
    #[test]
    fn test_retain_and_insert_elements() {
        let mut document = XmlDocument::parse(OPF, Dialect::Xml).unwrap().document;
        let manifest = document.root.find_child_mut("manifest").unwrap();

        assert_eq!(manifest.retain_elements(|e| e.get_attr("id") != Some("a")), 1);
        let item = XmlElement::new_like("item", manifest).with_attr("id", "c");
        manifest.insert_element(0, item);
        let item = XmlElement::new_like("item", manifest).with_attr("id", "d");
        manifest.push_element(item);

        let ids = manifest
            .elements()
            .filter_map(|e| e.get_attr("id"))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["c", "b", "d"]);

        let output = String::from_utf8(document.serialize(Dialect::Xml, false).unwrap()).unwrap();
        assert!(output.contains("<manifest>\n    <item id=\"c\"/>\n    <item id=\"b\""));
        assert!(output.contains("/>\n    <item id=\"d\"/>\n  </manifest>"));
    }

    /// Pretty printing drops whitespace-only text nodes
    #[test]
    fn test_serialize_pretty() {
        let mut root = XmlElement::new("root");
        root.children.push(XmlNode::Text("\n\n   ".to_string()));
        let mut child = XmlElement::new("child");
        child.set_text("value");
        root.children.push(XmlNode::Element(child));

        let output = XmlDocument::new(root).serialize(Dialect::Xml, true).unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("<root>\n  <child>value</child>\n</root>"));
    }
}
