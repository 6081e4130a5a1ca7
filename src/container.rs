//! The editable book container
//!
//! A [Container] unpacks a book into a private directory tree and exposes it
//! as a set of files identified by canonical names. Files are read and edited
//! either as raw bytes or as parsed trees; parsed trees live in a cache and
//! are written back when the container is committed. Every mutation that
//! touches more than one file (renames, removals, additions) goes through the
//! container so that the package document, the spine, the guide and the links
//! inside documents stay consistent.
//!
//! ## Lifecycle
//!
//! 1. [Container::open] unpacks an EPUB ZIP, hard-link clones an unpacked EPUB
//!    directory, or explodes a KF8 (AZW3) book into a temporary root.
//! 2. Files are inspected and edited through [Container::raw_data],
//!    [Container::parsed], [Container::rename], [Container::add_file], ...
//! 3. [Container::commit] serializes the dirty trees and writes the book back.
//!
//! [Container::clone_to] creates a checkpoint that shares unchanged files with
//! the original through hard links; writes through either container copy a
//! shared file first, so neither ever sees the other's changes.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use encoding_rs::{Encoding, UTF_8};
use log::{debug, info, warn};
use tempfile::{NamedTempFile, TempDir};
use walkdir::WalkDir;

use crate::{
    archive::{
        clone_dir, extract_zip, is_zip_signature, read_signature, remove_empty_dirs,
        write_epub_zip, write_file,
    },
    css::Stylesheet,
    error::EpubError,
    links::{collect_links, visit_links},
    names::{
        basename, href_to_name, is_valid_name, name_to_href, name_to_path, nfc, path_to_name,
        split_href,
    },
    obfuscation::{
        ENCRYPTION_NAME, font_key, parse_encryption, remove_from_encryption, rename_in_encryption,
        xor_font,
    },
    opf,
    types::{
        BookFlavor, CSS_MIME, EPUB_MIME, GuideReference, Identifier, LinkLocation, ManifestItem,
        MetadataItem, NCX_MIME, OCTET_STREAM_MIME, OPF_MIME, ObfuscationAlgorithm, RawData,
        SVG_MIME, SpineItem, is_font_media_type, is_html_media_type, is_xml_media_type,
    },
    utils::{DecodeBytes, guess_media_type, media_type_for, normalize_text},
    xml::{Dialect, XmlDocument},
};

pub const CONTAINER_NAME: &str = "META-INF/container.xml";

/// A parsed file held in the container's cache
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    /// A generic XML document: OPF, NCX, SVG, ...
    Xml(XmlDocument),

    /// An (X)HTML document
    Html(XmlDocument),

    /// A CSS stylesheet
    Css(Stylesheet),
}

impl ParsedItem {
    /// Returns the tree of an XML or HTML item
    pub fn as_document(&self) -> Option<&XmlDocument> {
        match self {
            ParsedItem::Xml(document) | ParsedItem::Html(document) => Some(document),
            ParsedItem::Css(_) => None,
        }
    }

    /// Returns the tree of an XML or HTML item for editing
    pub fn as_document_mut(&mut self) -> Option<&mut XmlDocument> {
        match self {
            ParsedItem::Xml(document) | ParsedItem::Html(document) => Some(document),
            ParsedItem::Css(_) => None,
        }
    }

    /// Returns the stylesheet of a CSS item
    pub fn as_stylesheet(&self) -> Option<&Stylesheet> {
        match self {
            ParsedItem::Css(sheet) => Some(sheet),
            _ => None,
        }
    }

    /// Returns the stylesheet of a CSS item for editing
    pub fn as_stylesheet_mut(&mut self) -> Option<&mut Stylesheet> {
        match self {
            ParsedItem::Css(sheet) => Some(sheet),
            _ => None,
        }
    }

    fn serialize(&self, pretty: bool) -> Result<Vec<u8>, EpubError> {
        match self {
            ParsedItem::Xml(document) => document.serialize(Dialect::Xml, pretty),
            ParsedItem::Html(document) => document.serialize(Dialect::Html, pretty),
            ParsedItem::Css(sheet) => Ok(sheet.serialize()),
        }
    }
}

/// Options used when opening a container
///
/// ## Example
/// ```rust, no_run
/// # use oeb_container::{OpenOptions, EpubError};
/// # fn main() -> Result<(), EpubError> {
/// let container = OpenOptions::new()
///     .temp_dir("/var/tmp/books")
///     .compression_level(9)
///     .pretty_print_opf(true)
///     .open("book.epub")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    temp_dir: Option<PathBuf>,
    compression_level: Option<i64>,
    pretty_print_opf: bool,
}

impl OpenOptions {
    /// Creates the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory the temporary unpack root is created in
    pub fn temp_dir<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.temp_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the deflate level used when the book is repacked
    pub fn compression_level(&mut self, level: i64) -> &mut Self {
        self.compression_level = Some(level);
        self
    }

    /// Sets whether the package document is pretty printed when it is written
    pub fn pretty_print_opf(&mut self, pretty: bool) -> &mut Self {
        self.pretty_print_opf = pretty;
        self
    }

    /// Opens a book with these options
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Container, EpubError> {
        Container::open_with(path, self)
    }
}

/// Where the container came from, which decides what `commit(None)` writes
#[derive(Debug, Clone)]
enum Source {
    Zip(PathBuf),
    Directory(PathBuf),
    Mobi(PathBuf),

    /// The root itself is the book (checkpoints)
    InPlace,
}

#[derive(Debug, Clone)]
struct FontState {
    algorithm: ObfuscationAlgorithm,

    /// Whether the bytes under the root are the decrypted cleartext
    decrypted: bool,
}

/// An editable EPUB (or exploded AZW3) book
pub struct Container {
    root: PathBuf,
    temp_root: Option<TempDir>,
    source: Source,
    flavor: BookFlavor,

    name_path_map: BTreeMap<String, PathBuf>,
    mime_map: HashMap<String, String>,
    opf_name: String,

    parsed_cache: HashMap<String, ParsedItem>,
    dirtied: HashSet<String>,
    encoding_map: HashMap<String, &'static Encoding>,
    pretty_print: HashSet<String>,

    cloned: bool,
    obfuscated_fonts: HashMap<String, FontState>,
    options: OpenOptions,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("root", &self.root)
            .field("temporary", &self.temp_root.is_some())
            .field("flavor", &self.flavor)
            .field("opf_name", &self.opf_name)
            .field("names", &self.name_path_map.len())
            .field("dirtied", &self.dirtied)
            .field("cloned", &self.cloned)
            .finish()
    }
}

impl Container {
    /// Opens a book with the default [OpenOptions]
    ///
    /// ## Parameters
    /// - `path`: An EPUB file, an unpacked EPUB directory or an AZW3 file
    ///
    /// ## Return
    /// - `Ok(Container)`: The opened book
    /// - `Err(EpubError)`: The book is malformed (`InvalidEpub`, `InvalidMobi`),
    ///   encrypted (`DrmError`) or could not be read
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EpubError> {
        Self::open_with(path, &OpenOptions::default())
    }

    /// Opens a book with explicit options
    pub fn open_with<P: AsRef<Path>>(path: P, options: &OpenOptions) -> Result<Self, EpubError> {
        let path = path.as_ref();
        let temp_root = match &options.temp_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                TempDir::new_in(dir)?
            }
            None => TempDir::new()?,
        };
        let root = temp_root.path().to_path_buf();

        let (source, flavor, cloned) = if path.is_dir() {
            clone_dir(path, &root)?;
            (Source::Directory(path.to_path_buf()), BookFlavor::Epub, true)
        } else {
            let signature = read_signature(path)?;

            if is_zip_signature(&signature) {
                extract_zip(path, &root)?;
                (Source::Zip(path.to_path_buf()), BookFlavor::Epub, false)
            } else if signature.starts_with(b"TPZ") {
                return Err(EpubError::InvalidMobi {
                    reason: "Topaz books are not supported".to_string(),
                });
            } else if signature.get(60..68) == Some(b"BOOKMOBI".as_slice()) {
                Self::explode_mobi(path, &root)?;
                (Source::Mobi(path.to_path_buf()), BookFlavor::Azw3, false)
            } else {
                extract_zip(path, &root).map_err(|_| EpubError::InvalidEpub {
                    reason: format!("{} is not an EPUB, AZW3 or unpacked book", path.display()),
                })?;
                (Source::Zip(path.to_path_buf()), BookFlavor::Epub, false)
            }
        };

        let mut container = Self::load(root, Some(temp_root), source, flavor, cloned, options)?;
        container.decrypt_fonts()?;

        info!(
            "Opened {} ({} files, package document {})",
            path.display(),
            container.name_path_map.len(),
            container.opf_name
        );
        Ok(container)
    }

    #[cfg(feature = "azw3")]
    fn explode_mobi(path: &Path, root: &Path) -> Result<(), EpubError> {
        crate::mobi::explode(path, root)
    }

    #[cfg(not(feature = "azw3"))]
    fn explode_mobi(path: &Path, _root: &Path) -> Result<(), EpubError> {
        Err(EpubError::InvalidMobi {
            reason: format!("{} is a MOBI book and AZW3 support is disabled", path.display()),
        })
    }

    fn load(
        root: PathBuf,
        temp_root: Option<TempDir>,
        source: Source,
        flavor: BookFlavor,
        cloned: bool,
        options: &OpenOptions,
    ) -> Result<Self, EpubError> {
        let mut name_path_map = BTreeMap::new();
        for entry in WalkDir::new(&root).min_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let name = path_to_name(entry.path(), &root);
                name_path_map.insert(name, entry.path().to_path_buf());
            }
        }

        let mut container = Self {
            root,
            temp_root,
            source,
            flavor,
            name_path_map,
            mime_map: HashMap::new(),
            opf_name: String::new(),
            parsed_cache: HashMap::new(),
            dirtied: HashSet::new(),
            encoding_map: HashMap::new(),
            pretty_print: HashSet::new(),
            cloned,
            obfuscated_fonts: HashMap::new(),
            options: options.clone(),
        };

        if container.flavor == BookFlavor::Epub {
            container.repair_mimetype()?;
        }

        container.opf_name = container.find_opf_name()?;
        container
            .mime_map
            .insert(container.opf_name.clone(), OPF_MIME.to_string());
        container
            .mime_map
            .insert(CONTAINER_NAME.to_string(), "application/xml".to_string());

        let opf_name = container.opf_name.clone();
        container.parsed(&opf_name)?;

        let removed = match container.parsed_cache.get_mut(&opf_name) {
            Some(ParsedItem::Xml(document)) => opf::dedupe_manifest(document, &opf_name),
            _ => Vec::new(),
        };
        if !removed.is_empty() {
            container.dirtied.insert(opf_name.clone());
        }

        container.build_mime_map();
        if options.pretty_print_opf {
            container.pretty_print.insert(opf_name);
        }

        Ok(container)
    }

    fn repair_mimetype(&mut self) -> Result<(), EpubError> {
        let path = name_to_path("mimetype", &self.root);
        let current = fs::read(&path).ok();
        if current.as_deref() == Some(EPUB_MIME.as_bytes()) {
            return Ok(());
        }

        warn!("Repairing missing or incorrect mimetype file");
        write_file(&path, EPUB_MIME.as_bytes(), self.cloned)?;
        self.name_path_map.insert("mimetype".to_string(), path);
        Ok(())
    }

    fn find_opf_name(&mut self) -> Result<String, EpubError> {
        if !self.has_name(CONTAINER_NAME) {
            return Err(EpubError::InvalidEpub {
                reason: format!("{} is missing", CONTAINER_NAME),
            });
        }

        let document = match self.parsed(CONTAINER_NAME)? {
            ParsedItem::Xml(document) | ParsedItem::Html(document) => document,
            ParsedItem::Css(_) => {
                return Err(EpubError::InvalidEpub {
                    reason: format!("{} is not XML", CONTAINER_NAME),
                });
            }
        };

        let rootfiles = document
            .root
            .find_elements_by_name("rootfile")
            .filter_map(|rootfile| {
                let full_path = rootfile.get_attr("full-path")?;
                let media_type = rootfile.get_attr("media-type").unwrap_or(OPF_MIME);
                Some((full_path.trim().trim_start_matches('/'), media_type))
            })
            .collect::<Vec<_>>();

        let full_path = rootfiles
            .iter()
            .find(|(_, media_type)| *media_type == OPF_MIME)
            .or_else(|| rootfiles.first())
            .map(|(full_path, _)| nfc(full_path))
            .ok_or_else(|| EpubError::InvalidEpub {
                reason: format!("{} lists no rootfile", CONTAINER_NAME),
            })?;

        if self.has_name(&full_path) {
            return Ok(full_path);
        }

        let lower = full_path.to_lowercase();
        self.name_path_map
            .keys()
            .find(|name| name.to_lowercase() == lower)
            .cloned()
            .ok_or_else(|| EpubError::InvalidEpub {
                reason: format!("the package document {} is missing", full_path),
            })
    }

    /// Builds the media type of every file
    ///
    /// Manifest media types win, except that missing or generic XML types are
    /// guessed from the extension (then the content), and the package document
    /// always has the OPF media type.
    fn build_mime_map(&mut self) {
        let manifest = self.manifest_items();
        let declared = manifest
            .into_iter()
            .filter_map(|item| item.name.map(|name| (name, item.media_type)))
            .collect::<Vec<_>>();

        let mut mime_map = HashMap::with_capacity(self.name_path_map.len());
        for (name, path) in &self.name_path_map {
            let media_type = match guess_media_type(name) {
                Some(media_type) => media_type.to_string(),
                None => media_type_for(name, fs::read(path).ok().as_deref()),
            };
            mime_map.insert(name.clone(), media_type);
        }

        for (name, media_type) in declared {
            if media_type.is_empty() || media_type == "text/xml" {
                continue;
            }
            if let Some(entry) = mime_map.get_mut(&name) {
                *entry = media_type;
            }
        }

        mime_map.insert(self.opf_name.clone(), OPF_MIME.to_string());
        self.mime_map = mime_map;
    }

    /// Decrypts the fonts listed in `META-INF/encryption.xml` in place
    fn decrypt_fonts(&mut self) -> Result<(), EpubError> {
        if !self.has_name(ENCRYPTION_NAME) {
            return Ok(());
        }

        let fonts = match self.parsed(ENCRYPTION_NAME)? {
            ParsedItem::Xml(document) | ParsedItem::Html(document) => parse_encryption(document)?,
            ParsedItem::Css(_) => return Ok(()),
        };

        for font in fonts {
            if !self.has_name(&font.name) {
                warn!("Obfuscated font {} listed in {} is missing", font.name, ENCRYPTION_NAME);
                continue;
            }
            if !self.mime_type(&font.name).is_some_and(is_font_media_type) {
                debug!("{} is obfuscated but not declared as a font", font.name);
            }

            self.obfuscated_fonts.insert(
                font.name,
                FontState {
                    algorithm: font.algorithm,
                    decrypted: false,
                },
            );
        }

        self.decrypt_pending_fonts()?;
        for (name, state) in &self.obfuscated_fonts {
            if !state.decrypted {
                warn!(
                    "No identifier usable as the {} key, leaving {} obfuscated",
                    state.algorithm, name
                );
            }
        }

        Ok(())
    }

    /// Decrypts the obfuscated fonts whose key can be derived from the current identifiers
    fn decrypt_pending_fonts(&mut self) -> Result<(), EpubError> {
        let mut pending = self
            .obfuscated_fonts
            .iter()
            .filter(|(_, state)| !state.decrypted)
            .map(|(name, state)| (name.clone(), state.algorithm))
            .collect::<Vec<_>>();
        if pending.is_empty() {
            return Ok(());
        }
        pending.sort_by(|left, right| left.0.cmp(&right.0));

        let identifiers = self.identifiers();
        let unique_identifier = self.unique_identifier();

        for (name, algorithm) in pending {
            let Some(key) = font_key(algorithm, &identifiers, unique_identifier.as_deref()) else {
                continue;
            };

            let path = self.path_of(&name)?.to_path_buf();
            let mut data = fs::read(&path)?;
            xor_font(&mut data, &key, algorithm);
            write_file(&path, &data, self.cloned)?;

            if let Some(state) = self.obfuscated_fonts.get_mut(&name) {
                state.decrypted = true;
            }
            debug!("Decrypted {}", name);
        }

        Ok(())
    }

    fn missing_key_error(&self, name: &str) -> Option<EpubError> {
        self.obfuscated_fonts
            .get(name)
            .filter(|state| !state.decrypted)
            .map(|state| EpubError::ObfuscationKeyMissing {
                name: name.to_string(),
                algorithm: state.algorithm.to_string(),
            })
    }

    /// The directory the book is unpacked into
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The flavor of the book
    pub fn flavor(&self) -> BookFlavor {
        self.flavor
    }

    /// The canonical name of the package document
    pub fn opf_name(&self) -> &str {
        &self.opf_name
    }

    /// All canonical names, in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.name_path_map.keys().map(String::as_str)
    }

    /// The canonical names and the absolute paths they are stored at
    pub fn name_path_map(&self) -> &BTreeMap<String, PathBuf> {
        &self.name_path_map
    }

    /// Returns true when the book contains a file with this name
    pub fn has_name(&self, name: &str) -> bool {
        self.name_path_map.contains_key(name)
    }

    /// Returns the absolute path of a name
    pub fn name_to_abspath(&self, name: &str) -> Option<&Path> {
        self.name_path_map.get(name).map(PathBuf::as_path)
    }

    /// Returns the media type of a name
    pub fn mime_type(&self, name: &str) -> Option<&str> {
        self.mime_map.get(name).map(String::as_str)
    }

    /// Returns the encoding a text file was decoded from
    pub fn encoding(&self, name: &str) -> Option<&'static Encoding> {
        self.encoding_map.get(name).copied()
    }

    /// Returns true when a parsed file has changes that are not written yet
    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirtied.contains(name)
    }

    /// Returns true when the files of this container may be shared with a checkpoint
    pub fn is_cloned(&self) -> bool {
        self.cloned
    }

    /// Sets whether a file is pretty printed when it is serialized
    pub fn set_pretty_print(&mut self, name: &str, pretty: bool) {
        if pretty {
            self.pretty_print.insert(name.to_string());
        } else {
            self.pretty_print.remove(name);
        }
    }

    /// Returns the raw content of a file
    ///
    /// A dirty parsed tree is written first, so the bytes always reflect the
    /// current state. Obfuscated fonts are returned decrypted; a font whose key
    /// cannot be derived from the current identifiers fails with
    /// `EpubError::ObfuscationKeyMissing`.
    ///
    /// ## Parameters
    /// - `name`: The canonical name of the file
    /// - `decode`: Decode the bytes to text (BOM, UTF-8, declared encoding, Windows-1252)
    /// - `normalize_nfc`: Normalize decoded text to NFC
    pub fn raw_data(
        &mut self,
        name: &str,
        decode: bool,
        normalize_nfc: bool,
    ) -> Result<RawData, EpubError> {
        if self.dirtied.contains(name) {
            self.commit_item(name, true)?;
        }
        if self.missing_key_error(name).is_some() {
            self.decrypt_pending_fonts()?;
            if let Some(err) = self.missing_key_error(name) {
                return Err(err);
            }
        }

        let path = self.path_of(name)?;
        let data = fs::read(path)?;
        if !decode {
            return Ok(RawData::Bytes(data));
        }

        let decoded = data.decode();
        self.encoding_map.insert(name.to_string(), decoded.encoding);
        Ok(RawData::Text(normalize_text(&decoded.text, normalize_nfc)))
    }

    fn path_of(&self, name: &str) -> Result<&Path, EpubError> {
        self.name_to_abspath(name).ok_or_else(|| EpubError::NotFound {
            name: name.to_string(),
        })
    }

    /// Returns the parsed tree of a file, parsing it on first access
    ///
    /// Changes made through the returned reference are only written after
    /// [Container::dirty] marks the file.
    ///
    /// ## Return
    /// - `Ok(&mut ParsedItem)`: The cached tree
    /// - `Err(EpubError::NotFound)`: No such file
    /// - `Err(EpubError::UnsupportedMediaType)`: The file is not XML, HTML or CSS
    /// - `Err(EpubError::FailedParsingXml)`: No parser stage could recover a tree
    pub fn parsed(&mut self, name: &str) -> Result<&mut ParsedItem, EpubError> {
        if !self.parsed_cache.contains_key(name) {
            let item = self.parse_item(name)?;
            self.parsed_cache.insert(name.to_string(), item);
        }

        self.parsed_cache
            .get_mut(name)
            .ok_or_else(|| EpubError::NotFound {
                name: name.to_string(),
            })
    }

    fn parse_item(&mut self, name: &str) -> Result<ParsedItem, EpubError> {
        if !self.has_name(name) {
            return Err(EpubError::NotFound {
                name: name.to_string(),
            });
        }

        let media_type = self
            .mime_type(name)
            .map(str::to_string)
            .or_else(|| guess_media_type(name).map(str::to_string))
            .unwrap_or_else(|| OCTET_STREAM_MIME.to_string());

        let dialect = if is_html_media_type(&media_type) {
            Dialect::Html
        } else if is_xml_media_type(&media_type) {
            Dialect::Xml
        } else if media_type == CSS_MIME {
            let text = self.raw_data(name, true, true)?;
            return Ok(ParsedItem::Css(Stylesheet::new(
                text.as_text().unwrap_or_default().to_string(),
            )));
        } else {
            return Err(EpubError::UnsupportedMediaType {
                name: name.to_string(),
                media_type,
            });
        };

        let text = self.raw_data(name, true, true)?;
        let text = text.as_text().unwrap_or_default();
        let outcome = XmlDocument::parse(text, dialect).map_err(|diagnostics| {
            EpubError::FailedParsingXml {
                name: name.to_string(),
                diagnostics,
            }
        })?;

        for diagnostic in &outcome.diagnostics {
            warn!("{}: {}", name, diagnostic);
        }

        Ok(match dialect {
            Dialect::Html => ParsedItem::Html(outcome.document),
            Dialect::Xml => ParsedItem::Xml(outcome.document),
        })
    }

    /// Replaces the parsed tree of a file and marks it dirty
    pub fn replace(&mut self, name: &str, item: ParsedItem) -> Result<(), EpubError> {
        if !self.has_name(name) {
            return Err(EpubError::NotFound {
                name: name.to_string(),
            });
        }

        self.parsed_cache.insert(name.to_string(), item);
        self.dirtied.insert(name.to_string());
        Ok(())
    }

    /// Marks a parsed file as changed, parsing it first if needed
    pub fn dirty(&mut self, name: &str) -> Result<(), EpubError> {
        self.parsed(name)?;
        self.dirtied.insert(name.to_string());
        Ok(())
    }

    /// Writes the parsed tree of one file to disk
    ///
    /// With `keep_parsed` unset, the tree is evicted from the cache afterwards
    /// (the package document always stays cached).
    pub fn commit_item(&mut self, name: &str, keep_parsed: bool) -> Result<(), EpubError> {
        let Some(item) = self.parsed_cache.get(name) else {
            self.dirtied.remove(name);
            return Ok(());
        };

        let data = item.serialize(self.pretty_print.contains(name))?;
        let path = self.path_of(name)?.to_path_buf();
        write_file(&path, &data, self.cloned)?;

        self.dirtied.remove(name);
        self.encoding_map.insert(name.to_string(), UTF_8);
        if !keep_parsed && name != self.opf_name {
            self.parsed_cache.remove(name);
        }
        Ok(())
    }

    fn commit_dirty(&mut self, keep_parsed: bool) -> Result<(), EpubError> {
        let mut dirty = self.dirtied.iter().cloned().collect::<Vec<_>>();
        dirty.sort();
        for name in dirty {
            self.commit_item(&name, keep_parsed)?;
        }
        Ok(())
    }

    /// Returns the current bytes of a file, serializing a dirty tree without writing it
    pub(crate) fn current_bytes(&self, name: &str) -> Result<Vec<u8>, EpubError> {
        if self.dirtied.contains(name) {
            if let Some(item) = self.parsed_cache.get(name) {
                return item.serialize(self.pretty_print.contains(name));
            }
        }
        Ok(fs::read(self.path_of(name)?)?)
    }

    /// Writes all changes and saves the book
    ///
    /// Dirty trees are serialized first, each one independently: when a write
    /// fails, the files written so far stay written and the rest stay dirty,
    /// so calling `commit` again completes the save.
    ///
    /// ## Parameters
    /// - `output`: Where to write an EPUB ZIP. With `None`, the book is saved
    ///   where it was opened from: the ZIP is repacked, or the source directory
    ///   is synchronized. An AZW3 book can only be committed to an explicit path.
    pub fn commit(&mut self, output: Option<&Path>) -> Result<(), EpubError> {
        if output.is_none() && matches!(self.source, Source::Mobi(_)) {
            return Err(EpubError::InvalidMobi {
                reason: "an AZW3 book can only be committed to an EPUB output path".to_string(),
            });
        }

        self.commit_dirty(true)?;
        self.decrypt_pending_fonts()?;
        debug_assert!(self.invariants_hold());

        match (output, &self.source) {
            (Some(path), _) => self.write_zip(path)?,
            (None, Source::Zip(path)) => self.write_zip(path)?,
            (None, Source::Directory(path)) => self.sync_directory(path)?,
            (None, Source::InPlace) | (None, Source::Mobi(_)) => {}
        }

        info!("Committed {}", self.root.display());
        Ok(())
    }

    fn invariants_hold(&self) -> bool {
        let names_valid = self.name_path_map.iter().all(|(name, path)| {
            is_valid_name(name) && *name == nfc(name) && path.starts_with(&self.root)
        });
        let dirty_cached = self
            .dirtied
            .iter()
            .all(|name| self.parsed_cache.contains_key(name));

        names_valid && dirty_cached && self.has_name(&self.opf_name)
    }

    /// The keys of the fonts that have to be obfuscated again when writing
    fn font_keys(&self) -> Result<HashMap<String, (ObfuscationAlgorithm, Vec<u8>)>, EpubError> {
        let identifiers = self.identifiers();
        let unique_identifier = self.unique_identifier();

        let mut keys = HashMap::new();
        for (name, state) in &self.obfuscated_fonts {
            if let Some(err) = self.missing_key_error(name) {
                return Err(err);
            }
            let key = font_key(state.algorithm, &identifiers, unique_identifier.as_deref())
                .ok_or_else(|| EpubError::ObfuscationKeyMissing {
                    name: name.clone(),
                    algorithm: state.algorithm.to_string(),
                })?;
            keys.insert(name.clone(), (state.algorithm, key));
        }
        Ok(keys)
    }

    /// The bytes of a file as they are stored in the book, fonts obfuscated again
    fn stored_bytes(
        &self,
        name: &str,
        keys: &HashMap<String, (ObfuscationAlgorithm, Vec<u8>)>,
    ) -> Result<Vec<u8>, EpubError> {
        let mut data = fs::read(self.path_of(name)?)?;
        if let Some((algorithm, key)) = keys.get(name) {
            xor_font(&mut data, key, *algorithm);
        }
        Ok(data)
    }

    fn write_zip(&self, output: &Path) -> Result<(), EpubError> {
        let keys = self.font_keys()?;
        let names = self.name_path_map.keys().cloned().collect::<Vec<_>>();

        write_epub_zip(&names, output, self.options.compression_level, |name| {
            self.stored_bytes(name, &keys)
        })
    }

    /// Makes the source directory match the container
    fn sync_directory(&self, dest: &Path) -> Result<(), EpubError> {
        let keys = self.font_keys()?;

        for (name, path) in &self.name_path_map {
            let target = name_to_path(name, dest);
            if same_file(path, &target) {
                continue;
            }

            let data = self.stored_bytes(name, &keys)?;
            if fs::read(&target).ok().as_deref() == Some(data.as_slice()) {
                continue;
            }

            let parent = target.parent().unwrap_or(dest);
            fs::create_dir_all(parent)?;
            let mut temp = NamedTempFile::new_in(parent)?;
            std::io::Write::write_all(&mut temp, &data)?;
            temp.persist(&target).map_err(|err| err.error)?;
        }

        let mut stale = Vec::new();
        for entry in WalkDir::new(dest).min_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file() && !self.has_name(&path_to_name(entry.path(), dest)) {
                stale.push(entry.path().to_path_buf());
            }
        }
        for path in stale {
            fs::remove_file(&path)?;
            remove_empty_dirs(&path, dest);
        }

        debug!("Synchronized {}", dest.display());
        Ok(())
    }

    /// Creates a checkpoint of the container under `dest`
    ///
    /// Dirty trees are written first (and stay cached). Every file is then
    /// hard-linked into `dest`; both containers copy a shared file before
    /// writing to it. The checkpoint commits in place.
    pub fn clone_to<P: AsRef<Path>>(&mut self, dest: P) -> Result<Container, EpubError> {
        let dest = dest.as_ref();
        self.commit_dirty(true)?;
        clone_dir(&self.root, dest)?;
        self.cloned = true;

        let name_path_map = self
            .name_path_map
            .keys()
            .map(|name| (name.clone(), name_to_path(name, dest)))
            .collect();

        let mut parsed_cache = HashMap::new();
        if let Some(opf) = self.parsed_cache.get(&self.opf_name) {
            parsed_cache.insert(self.opf_name.clone(), opf.clone());
        }

        debug!("Cloned {} into {}", self.root.display(), dest.display());
        Ok(Container {
            root: dest.to_path_buf(),
            temp_root: None,
            source: Source::InPlace,
            flavor: self.flavor,
            name_path_map,
            mime_map: self.mime_map.clone(),
            opf_name: self.opf_name.clone(),
            parsed_cache,
            dirtied: HashSet::new(),
            encoding_map: self.encoding_map.clone(),
            pretty_print: self.pretty_print.clone(),
            cloned: true,
            obfuscated_fonts: self.obfuscated_fonts.clone(),
            options: self.options.clone(),
        })
    }

    /// Compares the current content of two containers
    pub fn compare_to(&self, other: &Container) -> Result<crate::types::DiffReport, EpubError> {
        crate::diff::compare(self, other)
    }

    fn is_locked(&self, name: &str) -> bool {
        match self.flavor {
            BookFlavor::Epub => name == "mimetype" || name.starts_with("META-INF/"),
            BookFlavor::Azw3 => {
                name == "mimetype" || name.starts_with("META-INF/") || name == self.opf_name
            }
        }
    }

    fn is_exempt(&self, name: &str) -> bool {
        name == "mimetype" || name.starts_with("META-INF/") || name == self.opf_name
    }

    fn is_link_bearing(media_type: &str) -> bool {
        is_html_media_type(media_type)
            || matches!(media_type, CSS_MIME | OPF_MIME | NCX_MIME | SVG_MIME)
    }

    /// The names of all files that may contain links, in sorted order
    fn link_bearing_names(&self) -> Vec<String> {
        self.name_path_map
            .keys()
            .filter(|name| {
                self.mime_type(name)
                    .is_some_and(|media_type| Self::is_link_bearing(media_type))
            })
            .cloned()
            .collect()
    }

    /// Renames a file and updates every reference to it
    ///
    /// See [Container::rename_files].
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), EpubError> {
        let renames = HashMap::from([(old.to_string(), new.to_string())]);
        self.rename_files(&renames)
    }

    /// Renames a batch of files in one pass over the links of the book
    ///
    /// Every link in the book that resolved to an old name is rewritten to
    /// resolve to the new name (keeping its fragment), and the links inside
    /// moved files are rebased on their new location. Renaming the package
    /// document of an EPUB updates `META-INF/container.xml`; renaming an
    /// obfuscated font updates `META-INF/encryption.xml`.
    ///
    /// ## Return
    /// - `Err(EpubError::NotFound)`: An old name does not exist
    /// - `Err(EpubError::DuplicateName)`: A new name exists and differs from the old by more than case
    /// - `Err(EpubError::ReferentialIntegrity)`: A name may not change, or the new name is invalid
    ///
    /// On error the container is unchanged.
    pub fn rename_files(&mut self, renames: &HashMap<String, String>) -> Result<(), EpubError> {
        let renames = renames
            .iter()
            .map(|(old, new)| (old.clone(), nfc(new)))
            .filter(|(old, new)| old != new)
            .collect::<HashMap<_, _>>();
        if renames.is_empty() {
            return Ok(());
        }

        self.validate_renames(&renames)?;

        // parse every link-bearing file before anything moves
        let mut link_files = Vec::new();
        for name in self.link_bearing_names() {
            match self.parsed(&name) {
                Ok(_) => link_files.push(name),
                Err(err) => warn!("Links in {} will not be updated: {}", name, err),
            }
        }

        let mut sorted = renames.iter().collect::<Vec<_>>();
        sorted.sort();
        for (old, new) in sorted {
            self.move_file(old, new)?;
        }

        let reverse = renames
            .iter()
            .map(|(old, new)| (new.clone(), old.clone()))
            .collect::<HashMap<_, _>>();

        for old_file in link_files {
            let file = renames.get(&old_file).cloned().unwrap_or(old_file.clone());
            let media_type = self.mime_type(&file).unwrap_or_default().to_string();

            let Some(item) = self.parsed_cache.get_mut(&file) else {
                continue;
            };
            let count = visit_links(item, &media_type, &mut |url| {
                rebase_link(url, &old_file, &file, &renames)
            });
            if count > 0 {
                self.dirtied.insert(file);
            }
        }

        if let Some(old_opf) = reverse.get(&self.opf_name).cloned() {
            self.update_container_xml(&old_opf)?;
        }

        if self.has_name(ENCRYPTION_NAME)
            && renames.keys().any(|old| self.obfuscated_fonts.contains_key(old))
        {
            for (old, new) in &renames {
                if let Some(state) = self.obfuscated_fonts.remove(old) {
                    self.obfuscated_fonts.insert(new.clone(), state);
                }
            }
            if let Some(document) = self.parsed(ENCRYPTION_NAME)?.as_document_mut() {
                if rename_in_encryption(document, &renames) {
                    self.dirtied.insert(ENCRYPTION_NAME.to_string());
                }
            }
        }

        Ok(())
    }

    fn validate_renames(&self, renames: &HashMap<String, String>) -> Result<(), EpubError> {
        let mut targets = HashSet::new();

        for (old, new) in renames {
            if !self.has_name(old) {
                return Err(EpubError::NotFound { name: old.clone() });
            }
            if !is_valid_name(new) {
                return Err(EpubError::ReferentialIntegrity {
                    reason: format!("{:?} is not a valid name", new),
                });
            }
            if self.is_locked(old) || self.is_locked(new) {
                return Err(EpubError::ReferentialIntegrity {
                    reason: format!("{} may not be renamed to {}", old, new),
                });
            }
            if !targets.insert(new.to_lowercase()) {
                return Err(EpubError::DuplicateName { name: new.clone() });
            }

            let lower = new.to_lowercase();
            let clash = self.name_path_map.keys().any(|existing| {
                existing.to_lowercase() == lower
                    && existing.to_lowercase() != old.to_lowercase()
                    && !renames.contains_key(existing)
            });
            if clash {
                return Err(EpubError::DuplicateName { name: new.clone() });
            }
        }
        Ok(())
    }

    fn move_file(&mut self, old: &str, new: &str) -> Result<(), EpubError> {
        let old_path = self.path_of(old)?.to_path_buf();
        let new_path = name_to_path(new, &self.root);
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if old.to_lowercase() == new.to_lowercase() {
            // case-only renames go through a temporary name for case-insensitive filesystems
            let temp_path = old_path.with_file_name(format!(
                ".{}.renaming",
                old_path.file_name().unwrap_or_default().to_string_lossy()
            ));
            fs::rename(&old_path, &temp_path)?;
            fs::rename(&temp_path, &new_path)?;
        } else {
            fs::rename(&old_path, &new_path)?;
        }
        remove_empty_dirs(&old_path, &self.root);

        self.name_path_map.remove(old);
        self.name_path_map.insert(new.to_string(), new_path);
        if let Some(media_type) = self.mime_map.remove(old) {
            self.mime_map.insert(new.to_string(), media_type);
        }
        if let Some(item) = self.parsed_cache.remove(old) {
            self.parsed_cache.insert(new.to_string(), item);
        }
        if self.dirtied.remove(old) {
            self.dirtied.insert(new.to_string());
        }
        if let Some(encoding) = self.encoding_map.remove(old) {
            self.encoding_map.insert(new.to_string(), encoding);
        }
        if self.pretty_print.remove(old) {
            self.pretty_print.insert(new.to_string());
        }
        if self.opf_name == old {
            self.opf_name = new.to_string();
        }

        debug!("Renamed {} to {}", old, new);
        Ok(())
    }

    fn update_container_xml(&mut self, old_opf: &str) -> Result<(), EpubError> {
        let new_opf = self.opf_name.clone();
        let Some(document) = self.parsed(CONTAINER_NAME)?.as_document_mut() else {
            return Ok(());
        };

        let mut changed = false;
        document.root.walk_mut(&mut |element| {
            if element.local_name() != "rootfile" {
                return;
            }
            let points_to_old = element
                .get_attr("full-path")
                .is_some_and(|full_path| nfc(full_path.trim().trim_start_matches('/')) == old_opf);
            if points_to_old {
                element.set_attr("full-path", &new_opf);
                changed = true;
            }
        });

        if changed {
            self.dirtied.insert(CONTAINER_NAME.to_string());
        }
        Ok(())
    }

    /// Removes a file and every reference to it from the package
    ///
    /// Manifest items, spine itemrefs and `<meta name="cover">` entries that
    /// reference the file are removed, and guide references too when
    /// `remove_from_guide` is set.
    pub fn remove_item(&mut self, name: &str, remove_from_guide: bool) -> Result<(), EpubError> {
        if !self.has_name(name) {
            return Err(EpubError::NotFound {
                name: name.to_string(),
            });
        }
        if name == self.opf_name || name == CONTAINER_NAME {
            return Err(EpubError::ReferentialIntegrity {
                reason: format!("{} may not be removed", name),
            });
        }

        let opf_name = self.opf_name.clone();
        if opf::remove_name(self.opf_mut()?, &opf_name, name, remove_from_guide) {
            self.dirtied.insert(opf_name);
        }

        if self.obfuscated_fonts.remove(name).is_some() && self.has_name(ENCRYPTION_NAME) {
            if let Some(document) = self.parsed(ENCRYPTION_NAME)?.as_document_mut() {
                if remove_from_encryption(document, name) {
                    self.dirtied.insert(ENCRYPTION_NAME.to_string());
                }
            }
        }

        if let Some(path) = self.name_path_map.remove(name) {
            fs::remove_file(&path)?;
            remove_empty_dirs(&path, &self.root);
        }
        self.mime_map.remove(name);
        self.parsed_cache.remove(name);
        self.dirtied.remove(name);
        self.encoding_map.remove(name);
        self.pretty_print.remove(name);

        debug!("Removed {}", name);
        Ok(())
    }

    /// Returns a name based on `name` that does not clash with any existing name
    ///
    /// `-1`, `-2`, ... is inserted before the extension; names are compared
    /// case-insensitively.
    pub fn make_name_unique(&self, name: &str) -> String {
        if !self.clashes(name) {
            return name.to_string();
        }

        let (dir, file) = match name.rfind('/') {
            Some(index) => (&name[..=index], &name[index + 1..]),
            None => ("", name),
        };
        let (stem, extension) = match file.rfind('.') {
            Some(index) if index > 0 => (&file[..index], &file[index..]),
            _ => (file, ""),
        };

        let mut counter = 1;
        loop {
            let candidate = format!("{}{}-{}{}", dir, stem, counter, extension);
            if !self.clashes(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }

    fn clashes(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.name_path_map
            .keys()
            .any(|existing| existing.to_lowercase() == lower)
    }

    /// Adds a new file to the book
    ///
    /// Unless the name is exempt (`mimetype`, `META-INF/*`, the package
    /// document), the file is added to the manifest; (X)HTML documents are also
    /// added to the spine, at `spine_index` or at the end.
    ///
    /// ## Parameters
    /// - `name`: The canonical name of the new file
    /// - `data`: The content of the file
    /// - `media_type`: The media type, guessed from the name and content when `None`
    /// - `spine_index`: The spine position of an (X)HTML document
    /// - `allow_rename`: Pick a unique name instead of failing when the name exists
    ///
    /// ## Return
    /// - `Ok(String)`: The name the file was added under
    /// - `Err(EpubError::DuplicateName)`: The name exists and `allow_rename` is unset
    /// - `Err(EpubError::ReferentialIntegrity)`: The name is invalid or reserved
    pub fn add_file(
        &mut self,
        name: &str,
        data: &[u8],
        media_type: Option<&str>,
        spine_index: Option<usize>,
        allow_rename: bool,
    ) -> Result<String, EpubError> {
        let name = nfc(name);
        if !is_valid_name(&name) || name == "mimetype" {
            return Err(EpubError::ReferentialIntegrity {
                reason: format!("{:?} can not be added to the book", name),
            });
        }

        let name = if self.clashes(&name) {
            if !allow_rename {
                return Err(EpubError::DuplicateName { name });
            }
            self.make_name_unique(&name)
        } else {
            name
        };

        let media_type = match media_type {
            Some(media_type) => media_type.trim().to_ascii_lowercase(),
            None => media_type_for(&name, Some(data)),
        };

        let path = name_to_path(&name, &self.root);
        write_file(&path, data, false)?;
        self.name_path_map.insert(name.clone(), path);
        self.mime_map.insert(name.clone(), media_type.clone());

        if !self.is_exempt(&name) {
            let opf_name = self.opf_name.clone();
            let href = name_to_href(&name, Some(&opf_name));
            let package = self.opf_mut()?;
            let id = opf::generate_id(package, basename(&name));

            if !opf::add_manifest_item(package, &id, &href, &media_type) {
                warn!("The package document has no manifest, {} is not listed", name);
            }
            if is_html_media_type(&media_type)
                && !opf::insert_spine_itemref(package, &id, spine_index)
            {
                warn!("The package document has no spine, {} is not listed", name);
            }
            self.dirtied.insert(opf_name);
        }

        debug!("Added {} ({})", name, media_type);
        Ok(name)
    }

    /// Returns true when a manifest item resolves to the name
    pub fn manifest_has_name(&self, name: &str) -> bool {
        self.manifest_items()
            .iter()
            .any(|item| item.name.as_deref() == Some(name))
    }

    /// Replaces the spine with `(name, linear)` pairs, in order
    ///
    /// Every name must already be listed in the manifest.
    pub fn set_spine(&mut self, items: &[(String, bool)]) -> Result<(), EpubError> {
        let mut entries = Vec::with_capacity(items.len());
        for (name, linear) in items {
            let id = opf::manifest_id_for(self.opf()?, &self.opf_name, name).ok_or_else(|| {
                EpubError::ReferentialIntegrity {
                    reason: format!("{} is not in the manifest", name),
                }
            })?;
            entries.push((id, *linear));
        }

        let opf_name = self.opf_name.clone();
        if !opf::set_spine(self.opf_mut()?, &entries) {
            return Err(EpubError::InvalidEpub {
                reason: "the package document has no spine".to_string(),
            });
        }
        self.dirtied.insert(opf_name);
        Ok(())
    }

    /// Applies `replace` to every link of a file
    ///
    /// The file is marked dirty when at least one link changed. Files without
    /// links (images, fonts, ...) report no changes.
    ///
    /// ## Return
    /// The number of links that changed.
    pub fn replace_links<F>(&mut self, name: &str, mut replace: F) -> Result<usize, EpubError>
    where
        F: FnMut(&str) -> String,
    {
        let media_type = self.mime_type(name).unwrap_or_default().to_string();
        if !Self::is_link_bearing(&media_type) {
            return match self.has_name(name) {
                true => Ok(0),
                false => Err(EpubError::NotFound {
                    name: name.to_string(),
                }),
            };
        }

        let item = self.parsed(name)?;
        let count = visit_links(item, &media_type, &mut |url| Some(replace(url)));
        if count > 0 {
            self.dirtied.insert(name.to_string());
        }
        Ok(count)
    }

    /// Lists the links of a file with their positions
    pub fn iter_links(&mut self, name: &str) -> Result<Vec<LinkLocation>, EpubError> {
        let media_type = self.mime_type(name).unwrap_or_default().to_string();
        if !Self::is_link_bearing(&media_type) {
            return match self.has_name(name) {
                true => Ok(Vec::new()),
                false => Err(EpubError::NotFound {
                    name: name.to_string(),
                }),
            };
        }

        let item = self.parsed(name)?;
        Ok(collect_links(item, &media_type))
    }

    /// Lists the files that contain a link resolving to `name`
    pub fn links_to(&mut self, name: &str) -> Result<Vec<String>, EpubError> {
        let mut sources = Vec::new();
        for file in self.link_bearing_names() {
            let links = match self.iter_links(&file) {
                Ok(links) => links,
                Err(err) => {
                    warn!("Skipping links of {}: {}", file, err);
                    continue;
                }
            };
            if links
                .iter()
                .any(|link| href_to_name(&link.url, Some(&file)).as_deref() == Some(name))
            {
                sources.push(file);
            }
        }
        Ok(sources)
    }

    /// Replaces the bytes of a file
    ///
    /// Any parsed tree of the file is discarded. Obfuscated fonts take
    /// cleartext bytes, they are obfuscated again on commit.
    pub fn replace_raw(&mut self, name: &str, data: &[u8]) -> Result<(), EpubError> {
        let path = self.path_of(name)?.to_path_buf();
        write_file(&path, data, self.cloned)?;

        self.parsed_cache.remove(name);
        self.dirtied.remove(name);
        self.encoding_map.remove(name);

        if name == self.opf_name {
            let opf_name = self.opf_name.clone();
            self.parsed(&opf_name)?;
        }
        Ok(())
    }

    /// Changes the media type of a file in the manifest and the media type table
    pub fn set_media_type(&mut self, name: &str, media_type: &str) -> Result<(), EpubError> {
        if !self.has_name(name) {
            return Err(EpubError::NotFound {
                name: name.to_string(),
            });
        }

        let media_type = media_type.trim().to_ascii_lowercase();
        if self.mime_type(name) == Some(media_type.as_str()) {
            return Ok(());
        }

        if name != self.opf_name && self.parsed_cache.contains_key(name) {
            self.commit_item(name, false)?;
        }
        self.mime_map.insert(name.to_string(), media_type.clone());

        let opf_name = self.opf_name.clone();
        if opf::set_media_type(self.opf_mut()?, &opf_name, name, &media_type) {
            self.dirtied.insert(opf_name);
        }
        Ok(())
    }

    /// The parsed package document
    pub fn opf(&self) -> Result<&XmlDocument, EpubError> {
        self.parsed_cache
            .get(&self.opf_name)
            .and_then(ParsedItem::as_document)
            .ok_or_else(|| EpubError::InvalidEpub {
                reason: format!("the package document {} is not loaded", self.opf_name),
            })
    }

    /// The parsed package document for editing; call [Container::dirty] afterwards
    pub fn opf_mut(&mut self) -> Result<&mut XmlDocument, EpubError> {
        let opf_name = self.opf_name.clone();
        self.parsed(&opf_name)?
            .as_document_mut()
            .ok_or_else(|| EpubError::InvalidEpub {
                reason: format!("the package document {} is not XML", opf_name),
            })
    }

    /// The version declared by the package document
    pub fn opf_version(&self) -> f64 {
        self.opf().map(opf::version).unwrap_or(0.0)
    }

    /// The metadata items of the package, in document order
    pub fn metadata(&self) -> Vec<MetadataItem> {
        self.opf().map(opf::metadata_items).unwrap_or_default()
    }

    /// The first title of the book
    pub fn title(&self) -> Option<String> {
        self.metadata()
            .into_iter()
            .find(|item| item.property == "title")
            .map(|item| item.value)
    }

    /// The first language of the book
    pub fn language(&self) -> Option<String> {
        self.metadata()
            .into_iter()
            .find(|item| item.property == "language")
            .map(|item| item.value)
    }

    /// The identifiers of the book
    pub fn identifiers(&self) -> Vec<Identifier> {
        self.opf().map(opf::identifiers).unwrap_or_default()
    }

    /// The value of the package's unique identifier
    pub fn unique_identifier(&self) -> Option<String> {
        self.opf().ok().and_then(opf::unique_identifier)
    }

    /// The canonical name of the cover image
    pub fn cover_name(&self) -> Option<String> {
        self.opf()
            .ok()
            .and_then(|document| opf::cover_name(document, &self.opf_name))
    }

    /// The manifest items of the package
    pub fn manifest_items(&self) -> Vec<ManifestItem> {
        self.opf()
            .map(|document| opf::manifest_items(document, &self.opf_name))
            .unwrap_or_default()
    }

    /// The spine in reading order
    pub fn spine_items(&self) -> Vec<SpineItem> {
        self.opf()
            .map(|document| opf::spine_items(document, &self.opf_name))
            .unwrap_or_default()
    }

    /// The names of the spine items in reading order, skipping dangling itemrefs
    pub fn spine_names(&self) -> Vec<String> {
        self.spine_items()
            .into_iter()
            .filter_map(|item| item.name)
            .collect()
    }

    /// The references of the legacy guide
    pub fn guide_references(&self) -> Vec<GuideReference> {
        self.opf()
            .map(|document| opf::guide_references(document, &self.opf_name))
            .unwrap_or_default()
    }
}

/// Computes the new form of a link after a batch of renames
///
/// `base_old` and `base_new` are the names of the file containing the link
/// before and after the renames.
fn rebase_link(
    url: &str,
    base_old: &str,
    base_new: &str,
    renames: &HashMap<String, String>,
) -> Option<String> {
    let (path, suffix) = split_href(url.trim());
    if path.is_empty() {
        return None;
    }

    let target_old = href_to_name(url, Some(base_old))?;
    let target_new = renames.get(&target_old).cloned().unwrap_or(target_old.clone());
    if base_old == base_new && target_old == target_new {
        return None;
    }

    Some(format!("{}{}", name_to_href(&target_new, Some(base_new)), suffix))
}

#[cfg(unix)]
fn same_file(left: &Path, right: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(left), fs::metadata(right)) {
        (Ok(left), Ok(right)) => left.dev() == right.dev() && left.ino() == right.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_left: &Path, _right: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs};

    use tempfile::TempDir;

    use crate::{
        container::{Container, ParsedItem, rebase_link},
        error::EpubError,
        types::RawData,
    };

    const CONTAINER_XML: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Test Book</dc:title>
    <dc:language>en</dc:language>
    <dc:identifier id="uid">urn:uuid:0fd5c5ba-4f6e-4b14-a4f5-0e5f1d3c1e2f</dc:identifier>
  </metadata>
  <manifest>
    <item id="chap1" href="chap1.xhtml" media-type="application/xhtml+xml"/>
    <item id="chap2" href="chap2.xhtml" media-type="application/xhtml+xml"/>
    <item id="css" href="Styles/style.css" media-type="text/css"/>
    <item id="img" href="Images/a.png" media-type="image/png"/>
  </manifest>
  <spine>
    <itemref idref="chap1"/>
    <itemref idref="chap2"/>
  </spine>
  <guide>
    <reference type="text" href="chap1.xhtml"/>
  </guide>
</package>"#;

    const CHAP1: &str = r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><link href="Styles/style.css" rel="stylesheet"/></head><body><a href="chap2.xhtml#p1">next</a><img src="Images/a.png"/></body></html>"#;
    const CHAP2: &str = r##"<html xmlns="http://www.w3.org/1999/xhtml"><body><p id="p1"><a href="chap1.xhtml">back</a><a href="#p1">self</a><a href="http://example.com/">web</a></p></body></html>"##;

    fn book_dir(temp: &TempDir) -> std::path::PathBuf {
        let dir = temp.path().join("book");
        fs::create_dir_all(dir.join("META-INF")).unwrap();
        fs::create_dir_all(dir.join("OEBPS/Styles")).unwrap();
        fs::create_dir_all(dir.join("OEBPS/Images")).unwrap();
        fs::write(dir.join("mimetype"), "application/epub+zip").unwrap();
        fs::write(dir.join("META-INF/container.xml"), CONTAINER_XML).unwrap();
        fs::write(dir.join("OEBPS/content.opf"), OPF).unwrap();
        fs::write(dir.join("OEBPS/chap1.xhtml"), CHAP1).unwrap();
        fs::write(dir.join("OEBPS/chap2.xhtml"), CHAP2).unwrap();
        fs::write(dir.join("OEBPS/Styles/style.css"), "body { background: url(../Images/a.png) }").unwrap();
        fs::write(dir.join("OEBPS/Images/a.png"), b"\x89PNG\r\n\x1a\n").unwrap();
        dir
    }

    /// Links are rebased on the new location and point at renamed targets
    #[test]
    fn test_rebase_link() {
        let renames = HashMap::from([("OEBPS/a.xhtml".to_string(), "text/a.xhtml".to_string())]);

        assert_eq!(
            rebase_link("a.xhtml#x", "OEBPS/b.xhtml", "OEBPS/b.xhtml", &renames).as_deref(),
            Some("../text/a.xhtml#x")
        );
        assert_eq!(
            rebase_link("b.xhtml", "OEBPS/a.xhtml", "text/a.xhtml", &renames).as_deref(),
            Some("../OEBPS/b.xhtml")
        );
        assert_eq!(rebase_link("c.xhtml", "OEBPS/b.xhtml", "OEBPS/b.xhtml", &renames), None);
        assert_eq!(rebase_link("#x", "OEBPS/a.xhtml", "text/a.xhtml", &renames), None);
        assert_eq!(rebase_link("http://x.org/a", "OEBPS/a.xhtml", "text/a.xhtml", &renames), None);
    }

    /// A directory book is opened through a private clone
    #[test]
    fn test_open_directory() {
        let temp = TempDir::new().unwrap();
        let dir = book_dir(&temp);
        let mut container = Container::open(&dir).unwrap();

        assert!(container.is_cloned());
        assert_eq!(container.opf_name(), "OEBPS/content.opf");
        assert_eq!(container.title().as_deref(), Some("Test Book"));
        assert_eq!(container.language().as_deref(), Some("en"));
        assert_eq!(container.spine_names(), vec!["OEBPS/chap1.xhtml", "OEBPS/chap2.xhtml"]);
        assert_eq!(container.mime_type("OEBPS/Styles/style.css"), Some("text/css"));
        assert_eq!(container.mime_type("OEBPS/content.opf"), Some("application/oebps-package+xml"));
        assert!(!container.root().starts_with(&dir));

        match container.raw_data("OEBPS/chap2.xhtml", true, true).unwrap() {
            RawData::Text(text) => assert!(text.contains("back")),
            RawData::Bytes(_) => panic!("expected text"),
        }
        assert!(matches!(
            container.parsed("OEBPS/Images/a.png"),
            Err(EpubError::UnsupportedMediaType { .. })
        ));
        assert!(matches!(
            container.parsed("OEBPS/missing.xhtml"),
            Err(EpubError::NotFound { .. })
        ));
    }

    /// Renaming rewrites links everywhere and commits back to the directory
    #[test]
    fn test_rename_and_commit_directory() {
        let temp = TempDir::new().unwrap();
        let dir = book_dir(&temp);
        let mut container = Container::open(&dir).unwrap();

        container.rename("OEBPS/chap1.xhtml", "text/chap1.xhtml").unwrap();
        assert!(!container.has_name("OEBPS/chap1.xhtml"));
        assert!(container.has_name("text/chap1.xhtml"));
        assert_eq!(container.spine_names()[0], "text/chap1.xhtml");
        assert_eq!(container.guide_references()[0].href, "../text/chap1.xhtml");

        let links = container.iter_links("text/chap1.xhtml").unwrap();
        let urls = links.iter().map(|link| link.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec!["../OEBPS/Styles/style.css", "../OEBPS/chap2.xhtml#p1", "../OEBPS/Images/a.png"]
        );
        assert_eq!(container.links_to("text/chap1.xhtml").unwrap(), vec![
            "OEBPS/chap2.xhtml",
            "OEBPS/content.opf"
        ]);

        container.commit(None).unwrap();
        assert!(!dir.join("OEBPS/chap1.xhtml").exists());
        let chap2 = fs::read_to_string(dir.join("OEBPS/chap2.xhtml")).unwrap();
        assert!(chap2.contains(r#"href="../text/chap1.xhtml""#));
        assert!(chap2.contains(r##"href="#p1""##));
        assert!(chap2.contains(r#"href="http://example.com/""#));
    }

    /// Invalid renames fail and leave the container unchanged
    #[test]
    fn test_rename_errors() {
        let temp = TempDir::new().unwrap();
        let mut container = Container::open(book_dir(&temp)).unwrap();

        assert!(matches!(
            container.rename("OEBPS/chap1.xhtml", "OEBPS/CHAP2.xhtml"),
            Err(EpubError::DuplicateName { .. })
        ));
        assert!(matches!(
            container.rename("META-INF/container.xml", "container.xml"),
            Err(EpubError::ReferentialIntegrity { .. })
        ));
        assert!(matches!(
            container.rename("OEBPS/missing.xhtml", "a.xhtml"),
            Err(EpubError::NotFound { .. })
        ));
        assert!(container.has_name("OEBPS/chap1.xhtml"));

        container.rename("OEBPS/chap1.xhtml", "OEBPS/Chap1.xhtml").unwrap();
        assert!(container.has_name("OEBPS/Chap1.xhtml"));
        assert_eq!(container.spine_names()[0], "OEBPS/Chap1.xhtml");
    }

    /// Renaming the package document updates container.xml
    #[test]
    fn test_rename_opf() {
        let temp = TempDir::new().unwrap();
        let mut container = Container::open(book_dir(&temp)).unwrap();

        container.rename("OEBPS/content.opf", "package.opf").unwrap();
        assert_eq!(container.opf_name(), "package.opf");
        assert_eq!(container.spine_names()[0], "OEBPS/chap1.xhtml");
        assert_eq!(container.manifest_items()[0].href, "OEBPS/chap1.xhtml");

        match container.raw_data("META-INF/container.xml", true, false).unwrap() {
            RawData::Text(text) => assert!(text.contains(r#"full-path="package.opf""#)),
            RawData::Bytes(_) => panic!("expected text"),
        }
    }

    /// Adding and removing files keeps the package consistent
    #[test]
    fn test_add_and_remove() {
        let temp = TempDir::new().unwrap();
        let mut container = Container::open(book_dir(&temp)).unwrap();

        let name = container
            .add_file("OEBPS/chap3.xhtml", CHAP2.as_bytes(), None, Some(1), false)
            .unwrap();
        assert_eq!(name, "OEBPS/chap3.xhtml");
        assert!(container.manifest_has_name(&name));
        assert_eq!(container.spine_names()[1], "OEBPS/chap3.xhtml");
        assert!(container.is_dirty("OEBPS/content.opf"));

        assert!(matches!(
            container.add_file("OEBPS/CHAP3.xhtml", b"x", None, None, false),
            Err(EpubError::DuplicateName { .. })
        ));
        let renamed = container
            .add_file("OEBPS/chap3.xhtml", b"<html/>", None, None, true)
            .unwrap();
        assert_eq!(renamed, "OEBPS/chap3-1.xhtml");
        assert!(matches!(
            container.add_file("../outside.xhtml", b"x", None, None, false),
            Err(EpubError::ReferentialIntegrity { .. })
        ));

        let extra = container
            .add_file("META-INF/com.apple.ibooks.display-options.xml", b"<display_options/>", None, None, false)
            .unwrap();
        assert!(!container.manifest_has_name(&extra));

        container.remove_item("OEBPS/chap1.xhtml", true).unwrap();
        assert!(!container.has_name("OEBPS/chap1.xhtml"));
        assert!(container.spine_names().iter().all(|name| name != "OEBPS/chap1.xhtml"));
        assert!(container.guide_references().is_empty());
        assert!(matches!(
            container.remove_item("OEBPS/content.opf", true),
            Err(EpubError::ReferentialIntegrity { .. })
        ));
    }

    /// Files in the pretty print set are indented when written
    #[test]
    fn test_pretty_print() {
        let temp = TempDir::new().unwrap();
        let mut container = Container::open(book_dir(&temp)).unwrap();

        container.set_pretty_print("OEBPS/chap1.xhtml", true);
        container.dirty("OEBPS/chap1.xhtml").unwrap();
        let text = container.raw_data("OEBPS/chap1.xhtml", true, false).unwrap();
        assert!(text.as_text().unwrap().lines().count() > 3);

        container.set_pretty_print("OEBPS/chap1.xhtml", false);
        container.dirty("OEBPS/chap1.xhtml").unwrap();
        let text = container.raw_data("OEBPS/chap1.xhtml", true, false).unwrap();
        assert_eq!(text.as_text().unwrap().lines().count(), 1);
    }

    /// Parsed trees are NFC and keep the text of every HTML5 entity through a commit
    #[test]
    fn test_parsed_text_is_normalized() {
        let temp = TempDir::new().unwrap();
        let mut container = Container::open(book_dir(&temp)).unwrap();

        let source = "<html xmlns=\"http://www.w3.org/1999/xhtml\"><body><p>Cafe\u{301} &hearts;</p></body></html>";
        container.replace_raw("OEBPS/chap2.xhtml", source.as_bytes()).unwrap();
        let document = container.parsed("OEBPS/chap2.xhtml").unwrap().as_document().unwrap();
        assert_eq!(document.root.text(), "Caf\u{e9} \u{2665}");

        container.dirty("OEBPS/chap2.xhtml").unwrap();
        let text = container.raw_data("OEBPS/chap2.xhtml", true, false).unwrap();
        let text = text.as_text().unwrap();
        assert!(text.contains("<p>Caf\u{e9} \u{2665}</p>"));
        assert!(!text.contains("&amp;hearts;"));
    }

    /// Spines can only reference manifest items
    #[test]
    fn test_set_spine() {
        let temp = TempDir::new().unwrap();
        let mut container = Container::open(book_dir(&temp)).unwrap();

        container
            .set_spine(&[
                ("OEBPS/chap2.xhtml".to_string(), true),
                ("OEBPS/chap1.xhtml".to_string(), false),
            ])
            .unwrap();
        assert_eq!(container.spine_names(), vec!["OEBPS/chap2.xhtml", "OEBPS/chap1.xhtml"]);
        assert!(!container.spine_items()[1].linear);

        assert!(matches!(
            container.set_spine(&[("OEBPS/nope.xhtml".to_string(), true)]),
            Err(EpubError::ReferentialIntegrity { .. })
        ));
    }

    /// Replacing links dirties the file and counts the changes
    #[test]
    fn test_replace_links_and_raw() {
        let temp = TempDir::new().unwrap();
        let mut container = Container::open(book_dir(&temp)).unwrap();

        let count = container
            .replace_links("OEBPS/Styles/style.css", |url| url.replace("a.png", "b.png"))
            .unwrap();
        assert_eq!(count, 1);
        assert!(container.is_dirty("OEBPS/Styles/style.css"));
        assert_eq!(container.replace_links("OEBPS/Images/a.png", |url| url.to_string()).unwrap(), 0);

        // raw reads see the dirty tree
        let data = container.raw_data("OEBPS/Styles/style.css", false, false).unwrap();
        assert_eq!(data.into_bytes(), b"body { background: url(../Images/b.png) }");
        assert!(!container.is_dirty("OEBPS/Styles/style.css"));

        container.replace_raw("OEBPS/chap2.xhtml", b"<html><body>new</body></html>").unwrap();
        let Ok(ParsedItem::Html(document)) = container.parsed("OEBPS/chap2.xhtml") else {
            panic!("expected an html document");
        };
        assert_eq!(document.root.text(), "new");

        container.set_media_type("OEBPS/chap2.xhtml", "text/html").unwrap();
        assert_eq!(container.mime_type("OEBPS/chap2.xhtml"), Some("text/html"));
        assert!(container.is_dirty("OEBPS/content.opf"));
    }
}
