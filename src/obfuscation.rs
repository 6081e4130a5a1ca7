//! Font obfuscation
//!
//! EPUB allows embedded fonts to be *obfuscated*: the leading bytes of the
//! font are XORed with a key derived from the publication's identifiers, and
//! `META-INF/encryption.xml` lists the obfuscated files. Two algorithms are in
//! use:
//!
//! - IDPF (`http://www.idpf.org/2008/embedding`): the first 1040 bytes are
//!   XORed with the SHA-1 of the unique identifier, after removing the
//!   whitespace characters U+0020, U+0009, U+000D and U+000A.
//! - Adobe (`http://ns.adobe.com/pdf/enc#RC`): the first 1024 bytes are XORed
//!   with the 16 raw bytes of a UUID identifier.
//!
//! Since XOR is its own inverse, the same function obfuscates and restores.
//! Any other algorithm in `encryption.xml` means real encryption (DRM), which
//! is rejected.

use std::collections::HashMap;

use log::warn;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::{
    error::EpubError,
    names::{href_to_name, name_to_href},
    types::{Identifier, ObfuscationAlgorithm},
    xml::XmlDocument,
};

pub const ENCRYPTION_NAME: &str = "META-INF/encryption.xml";

/// A font listed in `META-INF/encryption.xml`
#[derive(Debug, Clone, PartialEq)]
pub struct ObfuscatedFont {
    /// The canonical name of the font
    pub name: String,

    /// The algorithm the font is obfuscated with
    pub algorithm: ObfuscationAlgorithm,
}

/// XORs the leading bytes of `data` with `key` in place
///
/// The key repeats over the first [ObfuscationAlgorithm::obfuscated_length]
/// bytes; the remainder of the data is left untouched. Applying the function
/// twice with the same key restores the original bytes.
pub fn xor_font(data: &mut [u8], key: &[u8], algorithm: ObfuscationAlgorithm) {
    if key.is_empty() {
        return;
    }

    let length = algorithm.obfuscated_length().min(data.len());
    for (index, byte) in data[..length].iter_mut().enumerate() {
        *byte ^= key[index % key.len()];
    }
}

/// Derives the IDPF obfuscation key from the package's unique identifier
pub fn idpf_key(unique_identifier: &str) -> Vec<u8> {
    let stripped = unique_identifier
        .chars()
        .filter(|c| !matches!(c, '\u{20}' | '\u{09}' | '\u{0D}' | '\u{0A}'))
        .collect::<String>();

    let mut hasher = Sha1::new();
    hasher.update(stripped.as_bytes());
    hasher.finalize().to_vec()
}

/// Derives the Adobe obfuscation key from the identifiers of the package
///
/// The first identifier in document order whose scheme is `uuid` or whose
/// value starts with `urn:uuid:`, and which parses as a UUID, supplies the key.
pub fn adobe_key(identifiers: &[Identifier]) -> Option<Vec<u8>> {
    for identifier in identifiers {
        let value = identifier.value.trim();
        let has_uuid_scheme = identifier
            .scheme
            .as_deref()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("uuid"));
        let has_uuid_prefix = value
            .get(..9)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("urn:uuid:"));

        if !has_uuid_scheme && !has_uuid_prefix {
            continue;
        }

        let raw = if has_uuid_prefix { &value[9..] } else { value };
        match Uuid::parse_str(raw) {
            Ok(uuid) => return Some(uuid.as_bytes().to_vec()),
            Err(err) => warn!("Identifier {:?} is not a usable UUID: {}", value, err),
        }
    }
    None
}

/// Derives the key for an algorithm from the current package identifiers
pub fn font_key(
    algorithm: ObfuscationAlgorithm,
    identifiers: &[Identifier],
    unique_identifier: Option<&str>,
) -> Option<Vec<u8>> {
    match algorithm {
        ObfuscationAlgorithm::Adobe => adobe_key(identifiers),
        ObfuscationAlgorithm::Idpf => unique_identifier.map(idpf_key),
    }
}

/// Lists the obfuscated fonts declared by a parsed `encryption.xml`
///
/// `CipherReference@URI` values are resolved relative to the container root.
///
/// ## Return
/// - `Ok(Vec<ObfuscatedFont>)`: The obfuscated fonts in document order
/// - `Err(EpubError::DrmError)`: A resource is encrypted with any other algorithm
pub fn parse_encryption(document: &XmlDocument) -> Result<Vec<ObfuscatedFont>, EpubError> {
    let mut fonts = Vec::new();

    for data in document.root.find_elements_by_name("EncryptedData") {
        let algorithm = data
            .find_elements_by_name("EncryptionMethod")
            .next()
            .and_then(|method| method.get_attr("Algorithm"));
        let uri = data
            .find_elements_by_name("CipherReference")
            .next()
            .and_then(|reference| reference.get_attr("URI"));

        let (Some(algorithm), Some(uri)) = (algorithm, uri) else {
            warn!("Skipping incomplete EncryptedData entry in {}", ENCRYPTION_NAME);
            continue;
        };

        let Some(algorithm) = ObfuscationAlgorithm::from_uri(algorithm) else {
            return Err(EpubError::DrmError {
                reason: format!("{} is encrypted with {}", uri, algorithm),
            });
        };

        match href_to_name(uri, None) {
            Some(name) => fonts.push(ObfuscatedFont { name, algorithm }),
            None => warn!("Ignoring obfuscated resource with unusable URI {:?}", uri),
        }
    }

    Ok(fonts)
}

/// Points the `CipherReference` entries of renamed fonts at their new names
///
/// Returns true when the document changed.
pub fn rename_in_encryption(document: &mut XmlDocument, renames: &HashMap<String, String>) -> bool {
    let mut changed = false;

    document.root.walk_mut(&mut |element| {
        if element.local_name() != "CipherReference" {
            return;
        }
        let Some(uri) = element.get_attr("URI") else {
            return;
        };
        let Some(new_name) = href_to_name(uri, None).and_then(|name| renames.get(&name)) else {
            return;
        };

        let new_uri = name_to_href(new_name, None);
        element.set_attr("URI", &new_uri);
        changed = true;
    });

    changed
}

/// Removes the `EncryptedData` entries that reference `name`
///
/// Returns true when an entry was removed.
pub fn remove_from_encryption(document: &mut XmlDocument, name: &str) -> bool {
    let references = |data: &crate::xml::XmlElement| {
        data.find_elements_by_name("CipherReference")
            .filter_map(|reference| reference.get_attr("URI"))
            .any(|uri| href_to_name(uri, None).as_deref() == Some(name))
    };

    let mut removed = 0;
    document.root.walk_mut(&mut |element| {
        removed += element
            .retain_elements(|child| child.local_name() != "EncryptedData" || !references(child));
    });
    removed > 0
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use sha1::{Digest, Sha1};

    use crate::{
        error::EpubError,
        obfuscation::{
            adobe_key, font_key, idpf_key, parse_encryption, remove_from_encryption,
            rename_in_encryption, xor_font,
        },
        types::{Identifier, ObfuscationAlgorithm},
        xml::{Dialect, XmlDocument},
    };

    const ENCRYPTION: &str = r#"<?xml version="1.0"?>
<encryption xmlns="urn:oasis:names:tc:opendocument:xmlns:container" xmlns:enc="http://www.w3.org/2001/04/xmlenc#">
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://ns.adobe.com/pdf/enc#RC"/>
    <enc:CipherData><enc:CipherReference URI="OEBPS/fonts/a.otf"/></enc:CipherData>
  </enc:EncryptedData>
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.idpf.org/2008/embedding"/>
    <enc:CipherData><enc:CipherReference URI="OEBPS/fonts/b%20c.ttf"/></enc:CipherData>
  </enc:EncryptedData>
</encryption>"#;

    fn identifier(scheme: Option<&str>, value: &str) -> Identifier {
        Identifier {
            id: None,
            scheme: scheme.map(str::to_string),
            value: value.to_string(),
        }
    }

    /// XOR obfuscation only touches the leading bytes and is its own inverse
    #[test]
    fn test_xor_font_round_trip() {
        let original = (0..2048u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let key = idpf_key("urn:uuid:1234");

        let mut data = original.clone();
        xor_font(&mut data, &key, ObfuscationAlgorithm::Idpf);
        assert_ne!(data[..1040], original[..1040]);
        assert_eq!(data[1040..], original[1040..]);

        xor_font(&mut data, &key, ObfuscationAlgorithm::Idpf);
        assert_eq!(data, original);

        let mut short = vec![1u8, 2, 3];
        xor_font(&mut short, &[0xFF; 16], ObfuscationAlgorithm::Adobe);
        assert_eq!(short, vec![0xFE, 0xFD, 0xFC]);
    }

    /// The IDPF key ignores the four XML whitespace characters
    #[test]
    fn test_idpf_key() {
        let mut hasher = Sha1::new();
        hasher.update(b"urn:uuid:abc");
        let expected = hasher.finalize().to_vec();

        assert_eq!(idpf_key(" urn:uuid:\tabc\r\n"), expected);
        assert_eq!(idpf_key("urn:uuid:abc").len(), 20);
    }

    /// The first parsable UUID identifier supplies the Adobe key
    #[test]
    fn test_adobe_key() {
        let identifiers = vec![
            identifier(Some("ISBN"), "9780000000000"),
            identifier(Some("uuid"), "not-a-uuid"),
            identifier(None, "urn:uuid:0fd5c5ba-4f6e-4b14-a4f5-0e5f1d3c1e2f"),
            identifier(Some("UUID"), "11111111-2222-3333-4444-555555555555"),
        ];

        let key = adobe_key(&identifiers).unwrap();
        assert_eq!(key.len(), 16);
        assert_eq!(key[..4], [0x0f, 0xd5, 0xc5, 0xba]);

        assert_eq!(adobe_key(&identifiers[..2]), None);
        assert_eq!(
            font_key(ObfuscationAlgorithm::Idpf, &[], Some("x")),
            Some(idpf_key("x"))
        );
        assert_eq!(font_key(ObfuscationAlgorithm::Idpf, &identifiers, None), None);
    }

    /// Both supported algorithms are listed with names relative to the container root
    #[test]
    fn test_parse_encryption() {
        let document = XmlDocument::parse(ENCRYPTION, Dialect::Xml).unwrap().document;
        let fonts = parse_encryption(&document).unwrap();

        assert_eq!(fonts.len(), 2);
        assert_eq!(fonts[0].name, "OEBPS/fonts/a.otf");
        assert_eq!(fonts[0].algorithm, ObfuscationAlgorithm::Adobe);
        assert_eq!(fonts[1].name, "OEBPS/fonts/b c.ttf");
        assert_eq!(fonts[1].algorithm, ObfuscationAlgorithm::Idpf);
    }

    /// Any other algorithm is reported as DRM
    #[test]
    fn test_parse_encryption_drm() {
        let text = ENCRYPTION.replace(
            "http://ns.adobe.com/pdf/enc#RC",
            "http://www.w3.org/2001/04/xmlenc#aes128-cbc",
        );
        let document = XmlDocument::parse(&text, Dialect::Xml).unwrap().document;
        let result = parse_encryption(&document);
        assert!(matches!(result, Err(EpubError::DrmError { .. })));
    }

    /// Renames and removals keep encryption.xml in step with the fonts
    #[test]
    fn test_rename_and_remove() {
        let mut document = XmlDocument::parse(ENCRYPTION, Dialect::Xml).unwrap().document;

        let renames = HashMap::from([(
            "OEBPS/fonts/a.otf".to_string(),
            "fonts/renamed.otf".to_string(),
        )]);
        assert!(rename_in_encryption(&mut document, &renames));
        let fonts = parse_encryption(&document).unwrap();
        assert_eq!(fonts[0].name, "fonts/renamed.otf");

        assert!(remove_from_encryption(&mut document, "OEBPS/fonts/b c.ttf"));
        assert!(!remove_from_encryption(&mut document, "OEBPS/fonts/b c.ttf"));
        assert_eq!(parse_encryption(&document).unwrap().len(), 1);
    }
}
