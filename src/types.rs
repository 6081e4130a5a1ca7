//! Shared data types
//!
//! Plain data returned by the container's accessors. None of these types hold
//! references into the container; they are snapshots of the package document
//! at the time they were requested.

use std::fmt;

pub const OPF_MIME: &str = "application/oebps-package+xml";
pub const NCX_MIME: &str = "application/x-dtbncx+xml";
pub const XHTML_MIME: &str = "application/xhtml+xml";
pub const HTML_MIME: &str = "text/html";
pub const CSS_MIME: &str = "text/css";
pub const SVG_MIME: &str = "image/svg+xml";
pub const EPUB_MIME: &str = "application/epub+zip";
pub const OCTET_STREAM_MIME: &str = "application/octet-stream";

/// The flavor of a container, selected from the file signature at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookFlavor {
    /// An EPUB, either zipped or unpacked in a directory
    Epub,

    /// A KF8 (AZW3) book exploded into an EPUB-like tree
    Azw3,
}

/// Represents a metadata item of the package document
///
/// Dublin Core elements use their local name (`title`, `creator`, `identifier`, ...)
/// as the property. EPUB 2 `<meta name content>` pairs use the `name` attribute,
/// EPUB 3 `<meta property>` elements use the `property` attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataItem {
    /// Optional unique identifier for this metadata item
    pub id: Option<String>,

    /// The metadata property name
    pub property: String,

    /// The metadata value, whitespace normalized
    pub value: String,

    /// Optional language code for this metadata item
    pub lang: Option<String>,

    /// Refinements of this metadata item
    ///
    /// In EPUB 3, `<meta refines="#id">` elements refine the item with that id.
    /// In EPUB 2, the extra attributes of a Dublin Core element (such as
    /// `opf:scheme` or `opf:role`) are reported as refinements.
    pub refined: Vec<MetadataRefinement>,
}

/// Represents a refinement of a metadata item
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRefinement {
    /// The refinement property name, e.g. `role`, `file-as` or `scheme`
    pub property: String,

    /// The refinement value
    pub value: String,
}

/// Represents a resource item declared in the manifest
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestItem {
    /// The manifest id
    pub id: String,

    /// The href exactly as written in the package document
    pub href: String,

    /// The canonical name the href resolves to, `None` for external or broken hrefs
    pub name: Option<String>,

    /// The declared media type, lower-cased
    pub media_type: String,

    /// The space-separated `properties` attribute, split into tokens
    pub properties: Vec<String>,
}

/// Represents an item in the spine
#[derive(Debug, Clone, PartialEq)]
pub struct SpineItem {
    /// The id of the referenced manifest item
    pub idref: String,

    /// The canonical name of the referenced file, `None` when the idref is dangling
    pub name: Option<String>,

    /// Whether this item belongs to the linear reading order (`linear="no"` clears it)
    pub linear: bool,
}

/// Represents a reference of the legacy guide
#[derive(Debug, Clone, PartialEq)]
pub struct GuideReference {
    /// The reference type, such as `cover`, `toc` or `text`
    pub ref_type: String,

    /// The optional human readable title
    pub title: Option<String>,

    /// The href exactly as written in the package document
    pub href: String,

    /// The canonical name the href resolves to
    pub name: Option<String>,
}

/// An identifier of the publication, as listed by `<dc:identifier>`
#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub id: Option<String>,
    pub scheme: Option<String>,
    pub value: String,
}

/// The font obfuscation algorithms understood by the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObfuscationAlgorithm {
    /// Adobe font obfuscation (`http://ns.adobe.com/pdf/enc#RC`)
    ///
    /// XORs the first 1024 bytes with the 16 raw bytes of a UUID identifier.
    Adobe,

    /// IDPF font obfuscation (`http://www.idpf.org/2008/embedding`)
    ///
    /// XORs the first 1040 bytes with the SHA-1 of the unique identifier.
    Idpf,
}

impl ObfuscationAlgorithm {
    pub const ADOBE_URI: &'static str = "http://ns.adobe.com/pdf/enc#RC";
    pub const IDPF_URI: &'static str = "http://www.idpf.org/2008/embedding";

    /// Returns the algorithm identified by an `EncryptionMethod@Algorithm` value
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri.trim() {
            Self::ADOBE_URI => Some(Self::Adobe),
            Self::IDPF_URI => Some(Self::Idpf),
            _ => None,
        }
    }

    /// Returns the `EncryptionMethod@Algorithm` value of this algorithm
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Adobe => Self::ADOBE_URI,
            Self::Idpf => Self::IDPF_URI,
        }
    }

    /// Returns the number of leading bytes that are XORed with the key
    pub fn obfuscated_length(&self) -> usize {
        match self {
            Self::Adobe => 1024,
            Self::Idpf => 1040,
        }
    }
}

impl fmt::Display for ObfuscationAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

/// A URL found inside a file, with its position
///
/// `line` is 1-based and `offset` is the byte offset of the URL inside that
/// line. Positions are exact for stylesheets; for tree based formats they are
/// `0`, since the parsed tree no longer knows where an attribute came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLocation {
    pub url: String,
    pub line: usize,
    pub offset: usize,
}

/// The result of comparing two containers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffReport {
    /// Names present in both containers whose bytes differ
    pub changed: Vec<String>,

    /// Names present only in the container the comparison was started from
    pub only_in_self: Vec<String>,

    /// Names present only in the other container
    pub only_in_other: Vec<String>,
}

impl DiffReport {
    /// Returns true when both containers hold the same names with the same bytes
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.only_in_self.is_empty() && self.only_in_other.is_empty()
    }

    /// All names that differ, in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names = self
            .changed
            .iter()
            .chain(&self.only_in_self)
            .chain(&self.only_in_other)
            .map(String::as_str)
            .collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}

/// The content of a file as returned by `Container::raw_data`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawData {
    Bytes(Vec<u8>),
    Text(String),
}

impl RawData {
    /// Returns the raw bytes, encoding text as UTF-8
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            RawData::Bytes(bytes) => bytes,
            RawData::Text(text) => text.into_bytes(),
        }
    }

    /// Returns the text, or `None` when the data was requested undecoded
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawData::Text(text) => Some(text),
            RawData::Bytes(_) => None,
        }
    }
}

/// Returns true for the media types of (X)HTML documents
pub fn is_html_media_type(media_type: &str) -> bool {
    matches!(media_type, XHTML_MIME | HTML_MIME)
}

/// Returns true for the media types that are parsed as generic XML
pub fn is_xml_media_type(media_type: &str) -> bool {
    !is_html_media_type(media_type)
        && (media_type.ends_with("+xml")
            || media_type == "application/xml"
            || media_type == "text/xml")
}

/// Returns true for font media types
pub fn is_font_media_type(media_type: &str) -> bool {
    media_type.starts_with("font/")
        || media_type.starts_with("application/font")
        || media_type.starts_with("application/x-font")
        || media_type == "application/vnd.ms-opentype"
}
