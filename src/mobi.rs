//! KF8 (AZW3) books
//!
//! A KF8 book is a Palm database whose first record carries the MOBI and EXTH
//! headers. [explode] unpacks one into an EPUB-like tree that the container
//! can open: the primary text flow becomes an XHTML document, the auxiliary
//! flows listed by the FDST record become stylesheets or SVG images, the
//! resource records become images, and a synthetic package document lists
//! them all. `kindle:embed` and `kindle:flow` references are rewritten to the
//! exploded names.
//!
//! Topaz books, encrypted books, MOBI6 books and joint MOBI6/KF8 files are
//! rejected.

use std::{fs, ops::Range, path::Path};

use encoding_rs::WINDOWS_1252;
use infer::MatcherType;
use log::{debug, warn};
use uuid::Uuid;

use crate::{
    archive::preallocation,
    container::CONTAINER_NAME,
    error::EpubError,
    names::{name_to_href, name_to_path},
    opf::{DC_NAMESPACE, OPF_NAMESPACE},
    types::{CSS_MIME, EPUB_MIME, OPF_MIME, SVG_MIME, XHTML_MIME},
    xml::{Dialect, XmlDocument, XmlElement},
};

/// The name of the package document of an exploded book
pub const MOBI_OPF_NAME: &str = "metadata.opf";

const TEXT_NAME: &str = "text/part0000.xhtml";
const NULL_INDEX: u32 = 0xFFFF_FFFF;
const UTF8_CODEPAGE: u32 = 65001;

fn invalid(reason: impl Into<String>) -> EpubError {
    EpubError::InvalidMobi {
        reason: reason.into(),
    }
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|bytes| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// The record table of a Palm database
#[derive(Debug)]
struct PalmDatabase {
    records: Vec<Range<usize>>,
}

impl PalmDatabase {
    fn parse(data: &[u8]) -> Result<Self, EpubError> {
        if data.get(60..68) != Some(b"BOOKMOBI".as_slice()) {
            return Err(invalid("not a BOOKMOBI Palm database"));
        }

        let count = read_u16(data, 76).ok_or_else(|| invalid("truncated Palm database header"))?;
        let offsets = (0..count as usize)
            .map(|index| read_u32(data, 78 + index * 8).map(|offset| offset as usize))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("truncated Palm database record list"))?;

        let records = offsets
            .iter()
            .enumerate()
            .map(|(index, &start)| {
                let start = start.min(data.len());
                let end = offsets.get(index + 1).copied().unwrap_or(data.len());
                start..end.clamp(start, data.len())
            })
            .collect();

        Ok(Self { records })
    }

    fn record<'a>(&self, data: &'a [u8], index: usize) -> Option<&'a [u8]> {
        data.get(self.records.get(index)?.clone())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// The fields of record 0 used to unpack the book
#[derive(Debug)]
struct MobiHeader {
    compression: u16,
    text_length: usize,
    text_record_count: usize,
    encryption: u16,
    header_length: usize,
    codepage: u32,
    title: String,
    version: u32,
    first_resource: u32,
    exth_flags: u32,
    fdst_index: u32,
    extra_data_flags: u16,
}

impl MobiHeader {
    fn parse(record0: &[u8]) -> Result<Self, EpubError> {
        if record0.len() < 16 {
            return Err(invalid("record 0 is too short"));
        }
        if record0.get(16..20) != Some(b"MOBI".as_slice()) {
            return Err(invalid("record 0 has no MOBI header"));
        }

        let header_length = read_u32(record0, 20).unwrap_or(0) as usize;
        let codepage = read_u32(record0, 28).unwrap_or(1252);
        let title = match (read_u32(record0, 0x54), read_u32(record0, 0x58)) {
            (Some(offset), Some(length)) => record0
                .get(offset as usize..offset as usize + length as usize)
                .map(|bytes| decode_text(bytes, codepage))
                .unwrap_or_default(),
            _ => String::new(),
        };

        let extra_data_flags = match header_length >= 0xE4 {
            true => read_u16(record0, 0xF2).unwrap_or(0),
            false => 0,
        };

        Ok(Self {
            compression: read_u16(record0, 0).unwrap_or(1),
            text_length: read_u32(record0, 4).unwrap_or(0) as usize,
            text_record_count: read_u16(record0, 8).unwrap_or(0) as usize,
            encryption: read_u16(record0, 12).unwrap_or(0),
            header_length,
            codepage,
            title,
            version: read_u32(record0, 0x68).unwrap_or(1),
            first_resource: read_u32(record0, 0x6C).unwrap_or(NULL_INDEX),
            exth_flags: read_u32(record0, 0x80).unwrap_or(0),
            fdst_index: read_u32(record0, 0xC0).unwrap_or(NULL_INDEX),
            extra_data_flags,
        })
    }

    fn exth(&self, record0: &[u8]) -> Exth {
        if self.exth_flags & 0x40 == 0 {
            return Exth::default();
        }
        record0
            .get(16 + self.header_length..)
            .map(|data| Exth::parse(data, self.codepage))
            .unwrap_or_default()
    }
}

/// The EXTH records that end up in the package document
#[derive(Debug, Default)]
struct Exth {
    title: Option<String>,
    authors: Vec<String>,
    publisher: Option<String>,
    description: Option<String>,
    isbn: Option<String>,
    asin: Option<String>,
    language: Option<String>,
    kf8_boundary: Option<u32>,
}

impl Exth {
    fn parse(data: &[u8], codepage: u32) -> Self {
        let mut exth = Exth::default();
        if data.get(0..4) != Some(b"EXTH".as_slice()) {
            return exth;
        }

        let count = read_u32(data, 8).unwrap_or(0);
        let mut position = 12;
        for _ in 0..count {
            let (Some(kind), Some(length)) = (read_u32(data, position), read_u32(data, position + 4))
            else {
                break;
            };
            let length = length as usize;
            let Some(content) = length
                .checked_sub(8)
                .and_then(|_| data.get(position + 8..position + length))
            else {
                break;
            };

            let text = || decode_text(content, codepage).trim().to_string();
            match kind {
                100 => exth.authors.push(text()),
                101 => exth.publisher = Some(text()),
                103 => exth.description = Some(text()),
                104 => exth.isbn = Some(text()),
                113 => exth.asin = Some(text()),
                121 => exth.kf8_boundary = read_u32(content, 0).filter(|&value| value != NULL_INDEX),
                503 => exth.title = Some(text()),
                524 => exth.language = Some(text()),
                _ => {}
            }
            position += length;
        }

        exth
    }
}

fn decode_text(bytes: &[u8], codepage: u32) -> String {
    match codepage {
        UTF8_CODEPAGE => String::from_utf8_lossy(bytes).into_owned(),
        _ => WINDOWS_1252.decode(bytes).0.into_owned(),
    }
}

/// Decompresses a PalmDOC (LZ77) text record
fn palmdoc_decompress(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() * 2);
    let mut index = 0;

    while index < input.len() {
        let byte = input[index];
        index += 1;

        match byte {
            0x01..=0x08 => {
                let end = (index + byte as usize).min(input.len());
                output.extend_from_slice(&input[index..end]);
                index = end;
            }
            0x00 | 0x09..=0x7F => output.push(byte),
            0xC0..=0xFF => {
                output.push(b' ');
                output.push(byte ^ 0x80);
            }
            0x80..=0xBF => {
                let Some(&next) = input.get(index) else {
                    break;
                };
                index += 1;

                let pair = u16::from_be_bytes([byte, next]);
                let distance = ((pair & 0x3FFF) >> 3) as usize;
                let length = ((pair & 7) + 3) as usize;
                if distance == 0 || distance > output.len() {
                    continue;
                }
                for _ in 0..length {
                    output.push(output[output.len() - distance]);
                }
            }
        }
    }

    output
}

/// Strips the trailing entries announced by the extra data flags from a text record
fn strip_trailing_data(record: &[u8], flags: u16) -> &[u8] {
    let mut end = record.len();

    let mut shifted = flags >> 1;
    while shifted != 0 && end > 0 {
        if shifted & 1 != 0 {
            // backward variable-width integer: the byte with the high bit set starts it
            let mut size = 0usize;
            let mut shift = 0;
            let mut position = end;
            while position > 0 {
                position -= 1;
                let byte = record[position];
                size |= ((byte & 0x7F) as usize) << shift;
                shift += 7;
                if byte & 0x80 != 0 || shift >= 28 {
                    break;
                }
            }
            if size > 0 && size <= end {
                end -= size;
            }
        }
        shifted >>= 1;
    }

    if flags & 1 != 0 && end > 0 {
        let overlap = (record[end - 1] & 3) as usize + 1;
        end = end.saturating_sub(overlap);
    }

    &record[..end]
}

fn read_text(data: &[u8], pdb: &PalmDatabase, header: &MobiHeader) -> Result<Vec<u8>, EpubError> {
    let mut text = Vec::with_capacity(preallocation(header.text_length as u64));

    for index in 1..=header.text_record_count {
        let record = pdb
            .record(data, index)
            .ok_or_else(|| invalid(format!("text record {} is missing", index)))?;
        let record = strip_trailing_data(record, header.extra_data_flags);

        match header.compression {
            1 => text.extend_from_slice(record),
            2 => text.extend_from_slice(&palmdoc_decompress(record)),
            0x4448 => return Err(invalid("HUFF/CDIC compressed books are not supported")),
            other => return Err(invalid(format!("unknown compression type {}", other))),
        }
    }

    if header.text_length > 0 && text.len() > header.text_length {
        text.truncate(header.text_length);
    }
    Ok(text)
}

/// Reads the flow boundaries of the FDST record
fn read_flows(data: &[u8], pdb: &PalmDatabase, header: &MobiHeader, text_length: usize) -> Vec<Range<usize>> {
    let whole = vec![0..text_length];
    if header.fdst_index == NULL_INDEX {
        return whole;
    }
    let Some(record) = pdb.record(data, header.fdst_index as usize) else {
        warn!("FDST record {} is missing, reading a single flow", header.fdst_index);
        return whole;
    };
    if record.get(0..4) != Some(b"FDST".as_slice()) {
        return whole;
    }

    let start = read_u32(record, 4).unwrap_or(12) as usize;
    let count = read_u32(record, 8).unwrap_or(0) as usize;
    let flows = (0..count)
        .map_while(|index| {
            let offset = start + index * 8;
            let begin = read_u32(record, offset)? as usize;
            let end = read_u32(record, offset + 4)? as usize;
            Some(begin.min(text_length)..end.clamp(begin.min(text_length), text_length))
        })
        .collect::<Vec<_>>();

    if flows.is_empty() { whole } else { flows }
}

/// A file of the exploded book
#[derive(Debug)]
struct ExplodedFile {
    name: String,
    media_type: String,
    data: Vec<u8>,
}

/// Parses the base-32 numbers (`0-9A-V`) used by `kindle:` references
fn parse_base32(value: &str) -> Option<usize> {
    if value.is_empty() {
        return None;
    }
    value.chars().try_fold(0usize, |number, c| {
        let digit = c.to_digit(32)? as usize;
        number.checked_mul(32)?.checked_add(digit)
    })
}

/// Rewrites `kindle:embed:XXXX` and `kindle:flow:XXXX` references
///
/// `resolve` receives the kind (`embed` or `flow`) and the number of the
/// reference and returns the name it points to. The `?mime=...` suffix is
/// dropped along with the reference.
fn rewrite_kindle_refs(text: &str, resolve: impl Fn(&str, usize) -> Option<String>) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("kindle:") {
        output.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let end = candidate
            .find(|c: char| matches!(c, '"' | '\'' | ')' | '<' | '>') || c.is_whitespace())
            .unwrap_or(candidate.len());
        let reference = &candidate[..end];

        let mut parts = reference.split('?').next().unwrap_or_default().split(':');
        let replacement = match (parts.next(), parts.next(), parts.next()) {
            (Some("kindle"), Some(kind @ ("embed" | "flow")), Some(number)) => {
                parse_base32(number).and_then(|number| resolve(kind, number))
            }
            _ => None,
        };

        output.push_str(replacement.as_deref().unwrap_or(reference));
        rest = &candidate[end..];
    }

    output.push_str(rest);
    output
}

/// Resolves `kindle:` references to hrefs relative to the file `base`
///
/// Embed numbers are 1-based resource numbers, flow numbers index the FDST table.
fn kindle_resolver<'a>(
    base: &'a str,
    resources: &'a [(usize, String)],
    flows: &'a [(usize, String, &'static str)],
) -> impl Fn(&str, usize) -> Option<String> + 'a {
    move |kind, number| {
        let target = match kind {
            "embed" => resources
                .iter()
                .find(|(resource, _)| resource + 1 == number)
                .map(|(_, name)| name.as_str()),
            _ => flows
                .iter()
                .find(|(flow, _, _)| *flow == number)
                .map(|(_, name, _)| name.as_str()),
        };
        target.map(|target| name_to_href(target, Some(base)))
    }
}

/// Unpacks a KF8 book into `root`
///
/// ## Return
/// - `Err(EpubError::InvalidMobi)`: Topaz, MOBI6 or joint MOBI6/KF8 books, or a malformed file
/// - `Err(EpubError::DrmError)`: The book is encrypted
pub fn explode(path: &Path, root: &Path) -> Result<(), EpubError> {
    let data = fs::read(path)?;
    if data.starts_with(b"TPZ") {
        return Err(invalid("Topaz books are not supported"));
    }

    let pdb = PalmDatabase::parse(&data)?;
    let record0 = pdb
        .record(&data, 0)
        .ok_or_else(|| invalid("record 0 is missing"))?;
    let header = MobiHeader::parse(record0)?;

    if header.encryption != 0 {
        return Err(EpubError::DrmError {
            reason: format!("{} is encrypted (scheme {})", path.display(), header.encryption),
        });
    }

    let exth = header.exth(record0);
    if header.version != 8 {
        return Err(match exth.kf8_boundary {
            Some(_) => invalid("joint MOBI6/KF8 books are not supported, split off the KF8 part first"),
            None => invalid("only KF8 (AZW3) books can be edited, this is a MOBI6 book"),
        });
    }

    let text = read_text(&data, &pdb, &header)?;
    let flows = read_flows(&data, &pdb, &header, text.len());
    let mut files = Vec::new();

    let mut resources = Vec::new();
    if header.first_resource != NULL_INDEX {
        for index in header.first_resource as usize..pdb.len() {
            let number = index - header.first_resource as usize;
            let Some(record) = pdb.record(&data, index) else {
                continue;
            };
            match infer::get(record) {
                Some(kind) if kind.matcher_type() == MatcherType::Image => {
                    let name = format!("images/image{:05}.{}", number + 1, kind.extension());
                    resources.push((number, name.clone()));
                    files.push(ExplodedFile {
                        name,
                        media_type: kind.mime_type().to_string(),
                        data: record.to_vec(),
                    });
                }
                _ => debug!("Skipping resource record {}", index),
            }
        }
    }

    let flow_names = flows
        .iter()
        .enumerate()
        .skip(1)
        .map(|(number, range)| {
            let content = &text[range.clone()];
            let is_svg = String::from_utf8_lossy(&content[..content.len().min(512)]).contains("<svg");
            let (name, media_type) = match is_svg {
                true => (format!("images/flow{:04}.svg", number), SVG_MIME),
                false => (format!("styles/flow{:04}.css", number), CSS_MIME),
            };
            (number, name, media_type)
        })
        .collect::<Vec<_>>();

    for (number, name, media_type) in &flow_names {
        let content = decode_text(&text[flows[*number].clone()], header.codepage);
        files.push(ExplodedFile {
            name: name.clone(),
            media_type: media_type.to_string(),
            data: rewrite_kindle_refs(&content, kindle_resolver(name, &resources, &flow_names))
                .into_bytes(),
        });
    }

    let primary = decode_text(&text[flows[0].clone()], header.codepage);
    files.insert(0, ExplodedFile {
        name: TEXT_NAME.to_string(),
        media_type: XHTML_MIME.to_string(),
        data: rewrite_kindle_refs(&primary, kindle_resolver(TEXT_NAME, &resources, &flow_names))
            .into_bytes(),
    });

    let opf = package_document(&header, &exth, &files)?;

    write(root, "mimetype", EPUB_MIME.as_bytes())?;
    write(root, CONTAINER_NAME, container_document()?.as_slice())?;
    write(root, MOBI_OPF_NAME, &opf)?;
    for file in &files {
        write(root, &file.name, &file.data)?;
    }

    debug!(
        "Exploded {} into {} files ({} flows)",
        path.display(),
        files.len() + 3,
        flows.len()
    );
    Ok(())
}

fn write(root: &Path, name: &str, data: &[u8]) -> Result<(), EpubError> {
    let path = name_to_path(name, root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(())
}

fn container_document() -> Result<Vec<u8>, EpubError> {
    let rootfile = XmlElement::new("rootfile")
        .with_attr("full-path", MOBI_OPF_NAME)
        .with_attr("media-type", OPF_MIME);
    let mut rootfiles = XmlElement::new("rootfiles");
    rootfiles.push_element(rootfile);

    let mut container = XmlElement::new("container")
        .with_attr("version", "1.0")
        .with_attr("xmlns", "urn:oasis:names:tc:opendocument:xmlns:container");
    container.push_element(rootfiles);

    XmlDocument::new(container).serialize(Dialect::Xml, true)
}

fn dc_element(local_name: &str, value: &str) -> XmlElement {
    let mut element = XmlElement::new(&format!("dc:{}", local_name));
    element.namespace = Some(DC_NAMESPACE.to_string());
    element.set_text(value);
    element
}

/// Builds the synthetic package document listing every exploded file
fn package_document(header: &MobiHeader, exth: &Exth, files: &[ExplodedFile]) -> Result<Vec<u8>, EpubError> {
    let mut metadata = XmlElement::new("metadata")
        .with_attr("xmlns:dc", DC_NAMESPACE)
        .with_attr("xmlns:opf", OPF_NAMESPACE);

    let title = exth
        .title
        .clone()
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| header.title.clone());
    metadata.push_element(dc_element("title", &title));
    for author in &exth.authors {
        metadata.push_element(dc_element("creator", author).with_attr("opf:role", "aut"));
    }
    metadata.push_element(dc_element("language", exth.language.as_deref().unwrap_or("und")));

    let identifier = match (&exth.asin, &exth.isbn) {
        (Some(asin), _) if !asin.is_empty() => dc_element("identifier", asin).with_attr("opf:scheme", "MOBI-ASIN"),
        (_, Some(isbn)) if !isbn.is_empty() => dc_element("identifier", isbn).with_attr("opf:scheme", "ISBN"),
        _ => dc_element("identifier", &format!("urn:uuid:{}", Uuid::new_v4())).with_attr("opf:scheme", "uuid"),
    };
    metadata.push_element(identifier.with_attr("id", "uid"));
    if let Some(publisher) = &exth.publisher {
        metadata.push_element(dc_element("publisher", publisher));
    }
    if let Some(description) = &exth.description {
        metadata.push_element(dc_element("description", description));
    }

    let mut manifest = XmlElement::new("manifest");
    for (index, file) in files.iter().enumerate() {
        manifest.push_element(
            XmlElement::new("item")
                .with_attr("id", &format!("item{}", index))
                .with_attr("href", &name_to_href(&file.name, Some(MOBI_OPF_NAME)))
                .with_attr("media-type", &file.media_type),
        );
    }

    let mut spine = XmlElement::new("spine");
    spine.push_element(XmlElement::new("itemref").with_attr("idref", "item0"));

    let mut package = XmlElement::new("package")
        .with_attr("xmlns", OPF_NAMESPACE)
        .with_attr("version", "2.0")
        .with_attr("unique-identifier", "uid");
    package.namespace = Some(OPF_NAMESPACE.to_string());
    package.push_element(metadata);
    package.push_element(manifest);
    package.push_element(spine);

    XmlDocument::new(package).serialize(Dialect::Xml, true)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use crate::{
        error::EpubError,
        mobi::{explode, palmdoc_decompress, parse_base32, rewrite_kindle_refs, strip_trailing_data},
    };

    /// Builds a KF8 Palm database with one uncompressed text record, one FDST
    /// record and one PNG resource
    fn kf8_book(html: &str, css: &str, version: u32, encryption: u16) -> Vec<u8> {
        let text = format!("{}{}", html, css).into_bytes();

        let title = b"Fixture";
        let mut record0 = vec![0u8; 16 + 0xE8];
        record0[0..2].copy_from_slice(&1u16.to_be_bytes());
        record0[4..8].copy_from_slice(&(text.len() as u32).to_be_bytes());
        record0[8..10].copy_from_slice(&1u16.to_be_bytes());
        record0[12..14].copy_from_slice(&encryption.to_be_bytes());
        record0[16..20].copy_from_slice(b"MOBI");
        record0[20..24].copy_from_slice(&0xE8u32.to_be_bytes());
        record0[28..32].copy_from_slice(&65001u32.to_be_bytes());
        record0[0x68..0x6C].copy_from_slice(&version.to_be_bytes());
        record0[0x6C..0x70].copy_from_slice(&3u32.to_be_bytes());
        record0[0x80..0x84].copy_from_slice(&0x40u32.to_be_bytes());
        record0[0xC0..0xC4].copy_from_slice(&2u32.to_be_bytes());
        record0[0xC4..0xC8].copy_from_slice(&1u32.to_be_bytes());

        let mut exth = Vec::new();
        let mut records = Vec::new();
        for (kind, value) in [(503u32, "KF8 Fixture"), (100, "Jane Doe"), (113, "B000TEST"), (524, "en")] {
            records.extend_from_slice(&kind.to_be_bytes());
            records.extend_from_slice(&(value.len() as u32 + 8).to_be_bytes());
            records.extend_from_slice(value.as_bytes());
        }
        exth.extend_from_slice(b"EXTH");
        exth.extend_from_slice(&(records.len() as u32 + 12).to_be_bytes());
        exth.extend_from_slice(&4u32.to_be_bytes());
        exth.extend_from_slice(&records);
        record0.extend_from_slice(&exth);

        let title_offset = record0.len() as u32;
        record0.extend_from_slice(title);
        record0[0x54..0x58].copy_from_slice(&title_offset.to_be_bytes());
        record0[0x58..0x5C].copy_from_slice(&(title.len() as u32).to_be_bytes());

        let mut fdst = Vec::new();
        fdst.extend_from_slice(b"FDST");
        fdst.extend_from_slice(&12u32.to_be_bytes());
        fdst.extend_from_slice(&2u32.to_be_bytes());
        for (start, end) in [(0, html.len()), (html.len(), text.len())] {
            fdst.extend_from_slice(&(start as u32).to_be_bytes());
            fdst.extend_from_slice(&(end as u32).to_be_bytes());
        }

        let mut png = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();
        png.extend_from_slice(&[0; 17]);

        let bodies = [record0, text, fdst, png];
        let mut data = vec![0u8; 78 + bodies.len() * 8 + 2];
        data[0..7].copy_from_slice(b"fixture");
        data[60..68].copy_from_slice(b"BOOKMOBI");
        data[76..78].copy_from_slice(&(bodies.len() as u16).to_be_bytes());

        let mut offset = data.len();
        for (index, body) in bodies.iter().enumerate() {
            let position = 78 + index * 8;
            data[position..position + 4].copy_from_slice(&(offset as u32).to_be_bytes());
            offset += body.len();
        }
        for body in &bodies {
            data.extend_from_slice(body);
        }
        data
    }

    #[test]
    fn test_palmdoc_decompress() {
        assert_eq!(palmdoc_decompress(b"Hello"), b"Hello");
        assert_eq!(palmdoc_decompress(&[0xC1]), b" A");
        assert_eq!(palmdoc_decompress(&[0x02, 0xFF, 0x01]), &[0xFF, 0x01]);
        // "abcabc": back-reference of distance 3, length 3
        assert_eq!(palmdoc_decompress(&[b'a', b'b', b'c', 0x80, 0x18]), b"abcabc");
    }

    #[test]
    fn test_strip_trailing_data() {
        // one trailing entry of size 3 (terminated by the high bit)
        let record = [b'a', b'b', 0x00, 0x00, 0x83];
        assert_eq!(strip_trailing_data(&record, 0b10), b"ab");
        // multibyte overlap: low two bits + 1 bytes
        assert_eq!(strip_trailing_data(b"abc\x01", 0b1), b"ab");
        assert_eq!(strip_trailing_data(b"abc", 0), b"abc");
    }

    #[test]
    fn test_kindle_refs() {
        assert_eq!(parse_base32("0001"), Some(1));
        assert_eq!(parse_base32("000A"), Some(10));
        assert_eq!(parse_base32("00V0"), Some(31 * 32));
        assert_eq!(parse_base32("00W0"), None);

        let text = r#"<img src="kindle:embed:0001?mime=image/png"/><a href="kindle:pos:fid:0000:off:0000">x</a>"#;
        let rewritten = rewrite_kindle_refs(text, |kind, number| {
            (kind == "embed" && number == 1).then(|| "../images/image00001.png".to_string())
        });
        assert_eq!(
            rewritten,
            r#"<img src="../images/image00001.png"/><a href="kindle:pos:fid:0000:off:0000">x</a>"#
        );
    }

    /// A KF8 book explodes into an EPUB-like tree
    #[test]
    fn test_explode() {
        let temp = TempDir::new().unwrap();
        let book = temp.path().join("book.azw3");
        fs::write(
            &book,
            kf8_book(
                r#"<html><head><link href="kindle:flow:0001?mime=text/css" rel="stylesheet"/></head><body><img src="kindle:embed:0001?mime=image/png"/></body></html>"#,
                "p { margin: 0 }",
                8,
                0,
            ),
        )
        .unwrap();

        let root = temp.path().join("root");
        explode(&book, &root).unwrap();

        assert_eq!(fs::read(root.join("mimetype")).unwrap(), b"application/epub+zip");
        let html = fs::read_to_string(root.join("text/part0000.xhtml")).unwrap();
        assert!(html.contains(r#"href="../styles/flow0001.css""#));
        assert!(html.contains(r#"src="../images/image00001.png""#));
        assert_eq!(fs::read_to_string(root.join("styles/flow0001.css")).unwrap(), "p { margin: 0 }");
        assert!(root.join("images/image00001.png").exists());

        let opf = fs::read_to_string(root.join("metadata.opf")).unwrap();
        assert!(opf.contains("<dc:title>KF8 Fixture</dc:title>"));
        assert!(opf.contains("B000TEST"));
        assert!(opf.contains(r#"href="text/part0000.xhtml""#));
    }

    /// Encrypted and MOBI6 books are rejected with distinct errors
    #[test]
    fn test_explode_rejects() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");

        let encrypted = temp.path().join("drm.azw3");
        fs::write(&encrypted, kf8_book("<html/>", "", 8, 2)).unwrap();
        assert!(matches!(explode(&encrypted, &root), Err(EpubError::DrmError { .. })));

        let mobi6 = temp.path().join("old.mobi");
        fs::write(&mobi6, kf8_book("<html/>", "", 6, 0)).unwrap();
        assert!(matches!(explode(&mobi6, &root), Err(EpubError::InvalidMobi { .. })));

        let topaz = temp.path().join("book.tpz");
        fs::write(&topaz, b"TPZ0 topaz").unwrap();
        assert!(matches!(explode(&topaz, &root), Err(EpubError::InvalidMobi { .. })));
    }
}
